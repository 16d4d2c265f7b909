//! Background keepalive heartbeat.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::protocol::ProtocolClient;

/// Longest gap between heartbeats, whatever the keepalive.
const MAX_PERIOD: Duration = Duration::from_secs(60 * 60);

/// Heartbeat period for a job with the given server keepalive.
///
/// Sends twice per keepalive interval so one late heartbeat does not
/// expire the job. `None` when the job has no keepalive.
pub(crate) fn heartbeat_period(keepalive: Option<Duration>) -> Option<Duration> {
    keepalive
        .map(|k| (k / 2).min(MAX_PERIOD))
        .filter(|period| !period.is_zero())
}

/// Spawn the keepalive loop for `job_id`.
pub(crate) fn spawn(client: ProtocolClient, job_id: u64, period: Duration) -> JoinHandle<()> {
    tokio::spawn(run(client, job_id, period))
}

async fn run(client: ProtocolClient, job_id: u64, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!("Keepalive for job {} every {:?}", job_id, period);

    loop {
        ticker.tick().await;
        match client.job_keepalive(job_id).await {
            Ok(()) => debug!("Sent keepalive for job {}", job_id),
            Err(e) if e.is_connection_error() => {
                warn!("Keepalive for job {} stopped: {}", job_id, e);
                break;
            }
            Err(e) => warn!("Keepalive for job {} failed: {}", job_id, e),
        }
    }
}
