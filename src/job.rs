//! Job controller.
//!
//! A [`JobController`] represents one allocation on the server. It keeps
//! a cached [`Lifecycle`] which a background notification pump advances
//! as the server reports changes, sends keepalive heartbeats so the job
//! is not reclaimed, and lets callers wait for the job to reach a state.
//!
//! # Usage
//!
//! ```ignore
//! use spalloc_client::job::{Allocation, JobController, JobSpec};
//! use spalloc_client::protocol::ProtocolClient;
//! use std::time::Duration;
//!
//! let client = ProtocolClient::new("spalloc.example.com", 22244);
//! let spec = JobSpec::new(Allocation::Boards(3)).with_owner("me@example.com");
//! let job = JobController::create(client, spec).await?;
//!
//! job.wait_until_ready(Some(Duration::from_secs(60))).await?;
//! println!("Boot {} ({}x{} chips)", job.hostname().unwrap(), job.width().unwrap(), job.height().unwrap());
//!
//! job.destroy(Some("finished")).await?;
//! ```

mod keepalive;
mod lifecycle;
mod spec;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Result, SpallocError};
use crate::models::{Connection, JobState, JobStateInfo, MachineInfo};
use crate::protocol::{NotificationListener, ProtocolClient};

pub use lifecycle::Lifecycle;
pub use spec::{Allocation, JobSpec};

/// Reason recorded when reconnecting gives up.
const REASON_CONNECTION_LOST: &str = "connection lost";

/// Reconnect delay for jobs resumed without a [`Config`].
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// State shared with the notification pump.
#[derive(Debug)]
struct JobShared {
    job_id: u64,
    lifecycle: watch::Sender<Lifecycle>,
    /// Allocation topology, once known
    machine: Mutex<Option<MachineInfo>>,
}

impl JobShared {
    /// Apply an observed lifecycle if it is a legal transition.
    fn observe(&self, next: Lifecycle) -> bool {
        let job_id = self.job_id;
        self.lifecycle
            .send_if_modified(|current| match current.advance(&next) {
                Some(advanced) => {
                    info!("Job {} is now {}", job_id, advanced);
                    *current = advanced;
                    true
                }
                None => false,
            })
    }

    fn observe_info(&self, info: &JobStateInfo) -> bool {
        self.observe(Lifecycle::from_server(info.state, info.reason.as_deref()))
    }

    fn current(&self) -> Lifecycle {
        self.lifecycle.borrow().clone()
    }
}

#[derive(Debug, Default)]
struct Tasks {
    pump: Option<JoinHandle<()>>,
    keepalive: Option<JoinHandle<()>>,
}

/// Client-side handle on one job.
///
/// Holds a clone of a shared [`ProtocolClient`]; several controllers may
/// use the same client. Dropping the controller stops its background
/// tasks but leaves the job on the server; call
/// [`destroy`](Self::destroy) to free the boards.
#[derive(Debug)]
pub struct JobController {
    client: ProtocolClient,
    shared: Arc<JobShared>,
    keepalive: Option<Duration>,
    reconnect_delay: Duration,
    tasks: Mutex<Tasks>,
}

impl JobController {
    /// Request a new job and start tracking it.
    ///
    /// Fails with [`SpallocError::Allocation`] when the request is invalid
    /// or the server rejects it, and with
    /// [`SpallocError::IncompatibleVersion`] for unsupported servers.
    pub async fn create(client: ProtocolClient, spec: JobSpec) -> Result<Self> {
        let (args, kwargs) = spec.to_call()?;
        client.check_version().await?;

        // Registered before the job exists so no early change is missed
        let listener = client.subscribe();
        let reply = client
            .create_job(args, kwargs)
            .await
            .map_err(|e| match e {
                SpallocError::Server(message) => SpallocError::Allocation(message),
                other => other,
            })?;
        let (job_id, machine) = parse_create_reply(reply)?;
        info!("Created job {}", job_id);

        let controller = Self::start(
            client,
            job_id,
            machine,
            spec.keepalive,
            spec.reconnect_delay,
            listener,
        );
        controller.shared.observe(Lifecycle::Queued);
        controller.client.notify_job(Some(job_id)).await?;
        controller.refresh_state().await?;
        Ok(controller)
    }

    /// Adopt an existing job.
    ///
    /// The keepalive interval is taken from the server. Fails with
    /// [`SpallocError::JobDestroyed`] if the server reports the job
    /// destroyed or unknown. `timeout` bounds the whole handshake.
    pub async fn resume(client: ProtocolClient, job_id: u64, timeout: Option<Duration>) -> Result<Self> {
        Self::resume_with_delay(client, job_id, DEFAULT_RECONNECT_DELAY, timeout).await
    }

    /// [`resume`](Self::resume) with the reconnect delay from `config`.
    pub async fn resume_from_config(
        client: ProtocolClient,
        job_id: u64,
        config: &Config,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        Self::resume_with_delay(client, job_id, config.reconnect_delay, timeout).await
    }

    async fn resume_with_delay(
        client: ProtocolClient,
        job_id: u64,
        reconnect_delay: Duration,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let handshake = Self::resume_inner(client, job_id, reconnect_delay);
        match timeout {
            Some(limit) => tokio::time::timeout(limit, handshake)
                .await
                .unwrap_or(Err(SpallocError::ProtocolTimeout {
                    command: "resume".to_string(),
                    timeout: limit,
                })),
            None => handshake.await,
        }
    }

    async fn resume_inner(
        client: ProtocolClient,
        job_id: u64,
        reconnect_delay: Duration,
    ) -> Result<Self> {
        client.check_version().await?;
        let listener = client.subscribe();

        let info = client.get_job_state(job_id).await?;
        let lifecycle = Lifecycle::from_server(info.state, info.reason.as_deref());
        if let Lifecycle::Destroyed { reason } = lifecycle {
            return Err(SpallocError::JobDestroyed { job_id, reason });
        }
        let keepalive = info
            .keepalive
            .filter(|secs| *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok());
        info!("Resumed job {} ({})", job_id, lifecycle);

        let controller = Self::start(
            client,
            job_id,
            None,
            keepalive,
            reconnect_delay,
            listener,
        );
        controller.shared.observe(lifecycle);
        controller.client.notify_job(Some(job_id)).await?;
        if keepalive.is_some() {
            controller.client.job_keepalive(job_id).await?;
        }
        Ok(controller)
    }

    fn start(
        client: ProtocolClient,
        job_id: u64,
        machine: Option<MachineInfo>,
        keepalive: Option<Duration>,
        reconnect_delay: Duration,
        listener: NotificationListener,
    ) -> Self {
        let (lifecycle, _) = watch::channel(Lifecycle::Creating);
        let shared = Arc::new(JobShared {
            job_id,
            lifecycle,
            machine: Mutex::new(machine.filter(MachineInfo::is_allocated)),
        });

        let pump = tokio::spawn(pump_notifications(
            listener,
            client.clone(),
            Arc::clone(&shared),
        ));
        let heartbeat = keepalive::heartbeat_period(keepalive)
            .map(|period| keepalive::spawn(client.clone(), job_id, period));

        Self {
            client,
            shared,
            keepalive,
            reconnect_delay,
            tasks: Mutex::new(Tasks {
                pump: Some(pump),
                keepalive: heartbeat,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.job_id
    }

    /// The client this job talks through.
    pub fn client(&self) -> &ProtocolClient {
        &self.client
    }

    /// Keepalive interval the server applies to this job.
    pub fn keepalive(&self) -> Option<Duration> {
        self.keepalive
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.reconnect_delay
    }

    pub fn set_reconnect_delay(&mut self, delay: Duration) {
        self.reconnect_delay = delay;
    }

    /// Cached lifecycle.
    pub fn lifecycle(&self) -> Lifecycle {
        self.shared.current()
    }

    /// Cached state, as the server would report it.
    pub fn state(&self) -> JobState {
        self.shared.current().job_state()
    }

    /// Why the job was destroyed, if it was and a reason is known.
    pub fn reason(&self) -> Option<String> {
        match self.shared.current() {
            Lifecycle::Destroyed { reason } => reason,
            _ => None,
        }
    }

    /// Watch lifecycle changes.
    pub fn watch(&self) -> watch::Receiver<Lifecycle> {
        self.shared.lifecycle.subscribe()
    }

    /// Topology of the allocation, only while the job is ready.
    fn ready_machine(&self) -> Option<MachineInfo> {
        if self.shared.current() != Lifecycle::Ready {
            return None;
        }
        self.shared.machine.lock().clone()
    }

    /// Ethernet-connected chips of the allocation.
    pub fn connections(&self) -> Option<Vec<Connection>> {
        self.ready_machine()?.connections
    }

    /// Hostname of chip (0, 0).
    pub fn hostname(&self) -> Option<String> {
        self.ready_machine()?.hostname().map(str::to_string)
    }

    /// Width of the allocation in chips.
    pub fn width(&self) -> Option<u32> {
        self.ready_machine()?.width
    }

    /// Height of the allocation in chips.
    pub fn height(&self) -> Option<u32> {
        self.ready_machine()?.height
    }

    pub fn machine_name(&self) -> Option<String> {
        self.ready_machine()?.machine_name
    }

    /// Logical coordinates of the allocated boards.
    pub fn boards(&self) -> Option<Vec<(u32, u32, u32)>> {
        self.ready_machine()?.boards
    }

    fn ensure_alive(&self) -> Result<()> {
        match self.shared.current() {
            Lifecycle::Destroyed { reason } => Err(SpallocError::JobDestroyed {
                job_id: self.id(),
                reason,
            }),
            _ => Ok(()),
        }
    }

    /// Move to errored when the server's reply had the wrong shape.
    fn note_protocol_error(&self, err: SpallocError) -> SpallocError {
        if let SpallocError::Protocol(message) = &err {
            self.shared.observe(Lifecycle::Errored {
                message: message.clone(),
            });
        }
        err
    }

    /// Ask the server for the job's state and apply it.
    pub async fn refresh_state(&self) -> Result<Lifecycle> {
        self.ensure_alive()?;
        let info = self
            .client
            .get_job_state(self.id())
            .await
            .map_err(|e| self.note_protocol_error(e))?;
        self.shared.observe_info(&info);
        Ok(self.lifecycle())
    }

    /// Allocation topology, fetched from the server until it is known.
    pub async fn machine_info(&self) -> Result<MachineInfo> {
        self.ensure_alive()?;
        let cached = self.shared.machine.lock().clone();
        if let Some(info) = cached {
            return Ok(info);
        }
        let info = self
            .client
            .get_job_machine_info(self.id())
            .await
            .map_err(|e| self.note_protocol_error(e))?;
        if info.is_allocated() {
            *self.shared.machine.lock() = Some(info.clone());
        }
        Ok(info)
    }

    /// Wait until the job is in one of `targets`.
    ///
    /// Returns immediately when the cached state already matches. Fails
    /// with [`SpallocError::JobDestroyed`] if the job is, or becomes,
    /// destroyed and `Destroyed` is not a target;
    /// [`SpallocError::ConnectionClosed`] if the connection is gone; and
    /// [`SpallocError::StateChangeTimeout`] when `timeout` elapses. A zero
    /// timeout only checks the cached state.
    pub async fn wait_for_state_change(
        &self,
        targets: &[JobState],
        timeout: Option<Duration>,
    ) -> Result<JobState> {
        let job_id = self.id();
        let mut rx = self.shared.lifecycle.subscribe();

        let current = rx.borrow_and_update().clone();
        if let Some(outcome) = settle(job_id, current, targets) {
            return outcome;
        }
        if !self.client.is_connected() {
            return Err(SpallocError::ConnectionClosed);
        }

        let waiting = async {
            loop {
                tokio::select! {
                    biased;
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return Err(SpallocError::ConnectionClosed);
                        }
                        let current = rx.borrow_and_update().clone();
                        if let Some(outcome) = settle(job_id, current, targets) {
                            return outcome;
                        }
                    }
                    _ = self.client.disconnected() => {
                        debug!("Connection lost while waiting on job {}", job_id);
                        return Err(SpallocError::ConnectionClosed);
                    }
                }
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, waiting)
                .await
                .unwrap_or(Err(SpallocError::StateChangeTimeout {
                    job_id,
                    timeout: limit,
                })),
            None => waiting.await,
        }
    }

    /// Wait for the job to be ready and its topology to be known.
    pub async fn wait_until_ready(&self, timeout: Option<Duration>) -> Result<()> {
        self.wait_for_state_change(&[JobState::Ready], timeout).await?;
        self.machine_info().await?;
        Ok(())
    }

    /// Switch the job's boards on or off.
    pub async fn set_power(&self, on: bool) -> Result<()> {
        self.ensure_alive()?;
        if on {
            self.client.power_on_job_boards(self.id()).await
        } else {
            self.client.power_off_job_boards(self.id()).await
        }
    }

    /// Power-cycle the job's boards.
    pub async fn reset(&self) -> Result<()> {
        self.set_power(true).await
    }

    /// Destroy the job and stop tracking it.
    ///
    /// The request is sent without waiting for the server; a send failure
    /// is logged and the job is still marked destroyed locally. Fails with
    /// [`SpallocError::JobDestroyed`] if the job was already destroyed.
    pub async fn destroy(&self, reason: Option<&str>) -> Result<()> {
        self.ensure_alive()?;
        let job_id = self.id();

        if let Err(e) = self
            .client
            .cast("destroy_job", vec![json!(job_id), json!(reason)], Map::new())
            .await
        {
            warn!("Could not send destroy request for job {}: {}", job_id, e);
        }
        self.stop_tasks().await;
        self.shared.observe(Lifecycle::Destroyed {
            reason: reason.map(str::to_string),
        });
        Ok(())
    }

    /// Stop the keepalive and notification pump without destroying the job.
    pub async fn close(&self) {
        self.stop_tasks().await;
        debug!("Stopped tracking job {}", self.id());
    }

    /// Reconnect the shared client after the connection was lost.
    ///
    /// Retries every reconnect delay until `timeout` has passed, then
    /// re-checks the server version, re-subscribes and re-reads the
    /// job's state. If no connection can be made the job is marked
    /// destroyed ("connection lost") and the connection error returned.
    pub async fn reconnect(&self, timeout: Duration) -> Result<()> {
        self.ensure_alive()?;
        let job_id = self.id();
        let deadline = Instant::now() + timeout;

        loop {
            match self.client.connect().await {
                Ok(()) => break,
                Err(e) => {
                    if Instant::now() + self.reconnect_delay > deadline {
                        warn!("Giving up reconnecting for job {}: {}", job_id, e);
                        self.stop_tasks().await;
                        self.shared.observe(Lifecycle::Destroyed {
                            reason: Some(REASON_CONNECTION_LOST.to_string()),
                        });
                        return Err(e);
                    }
                    debug!(
                        "Reconnect for job {} failed ({}), retrying in {:?}",
                        job_id, e, self.reconnect_delay
                    );
                    tokio::time::sleep(self.reconnect_delay).await;
                }
            }
        }

        self.client.check_version().await?;
        self.client.notify_job(Some(job_id)).await?;
        self.refresh_state().await?;
        self.restart_keepalive();
        info!("Reconnected job {}", job_id);
        Ok(())
    }

    /// Start a new heartbeat if the previous one ended.
    fn restart_keepalive(&self) {
        let Some(period) = keepalive::heartbeat_period(self.keepalive) else {
            return;
        };
        let mut tasks = self.tasks.lock();
        let running = tasks
            .keepalive
            .as_ref()
            .is_some_and(|task| !task.is_finished());
        if !running {
            tasks.keepalive = Some(keepalive::spawn(self.client.clone(), self.id(), period));
        }
    }

    async fn stop_tasks(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in [tasks.pump, tasks.keepalive].into_iter().flatten() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for JobController {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut();
        for task in [tasks.pump.take(), tasks.keepalive.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}

/// How a wait for `targets` ends in state `current`, if it does.
fn settle(job_id: u64, current: Lifecycle, targets: &[JobState]) -> Option<Result<JobState>> {
    match current {
        Lifecycle::Errored { message } => Some(Err(SpallocError::Protocol(message))),
        current if targets.contains(&current.job_state()) => Some(Ok(current.job_state())),
        Lifecycle::Destroyed { reason } => Some(Err(SpallocError::JobDestroyed { job_id, reason })),
        _ => None,
    }
}

/// Job id and, if included, topology from a `create_job` reply.
fn parse_create_reply(reply: Value) -> Result<(u64, Option<MachineInfo>)> {
    if let Some(job_id) = reply.as_u64() {
        return Ok((job_id, None));
    }
    let job_id = reply
        .get("job_id")
        .and_then(Value::as_u64)
        .ok_or_else(|| SpallocError::protocol(format!("Unexpected reply to 'create_job': {}", reply)))?;
    let machine: MachineInfo = serde_json::from_value(reply).map_err(|e| {
        SpallocError::protocol(format!("Unexpected reply to 'create_job': {}", e))
    })?;
    Ok((job_id, Some(machine)))
}

/// Apply notifications about one job until it is destroyed.
async fn pump_notifications(
    mut listener: NotificationListener,
    client: ProtocolClient,
    shared: Arc<JobShared>,
) {
    let job_id = shared.job_id;
    let mut dropped = listener.dropped();

    while let Some(notification) = listener.recv().await {
        // Missed notifications may have named this job
        let missed = listener.dropped() > dropped;
        dropped = listener.dropped();

        let state = if notification.concerns_job(job_id) {
            notification
                .job_state()
                .map(|state| Lifecycle::from_server(state, notification.reason()))
        } else if missed {
            None
        } else {
            continue;
        };

        match state {
            Some(next) => {
                shared.observe(next);
            }
            None => match client.get_job_state(job_id).await {
                Ok(info) => {
                    shared.observe_info(&info);
                }
                Err(e) => debug!("Could not refresh job {}: {}", job_id, e),
            },
        }

        if shared.current().is_destroyed() {
            break;
        }
    }
    debug!("Notification pump for job {} stopped", job_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_create_reply_bare_id() {
        let (job_id, machine) = parse_create_reply(json!(42)).unwrap();
        assert_eq!(job_id, 42);
        assert!(machine.is_none());
    }

    #[test]
    fn test_parse_create_reply_with_topology() {
        let (job_id, machine) = parse_create_reply(json!({
            "job_id": 7,
            "width": 24,
            "height": 12,
            "connections": [[[0, 0], "10.2.0.1"]],
            "machine_name": "spinn-48",
            "boards": [[0, 0, 0], [0, 0, 1], [0, 0, 2]]
        }))
        .unwrap();

        let machine = machine.unwrap();
        assert_eq!(job_id, 7);
        assert_eq!(machine.width, Some(24));
        assert_eq!(machine.hostname(), Some("10.2.0.1"));
        assert_eq!(machine.boards.as_ref().map(Vec::len), Some(3));
    }

    #[test]
    fn test_parse_create_reply_wrong_shape() {
        for reply in [json!("seven"), json!({"id": 7}), json!({"job_id": 7, "width": "wide"})] {
            let err = parse_create_reply(reply).unwrap_err();
            assert!(matches!(err, SpallocError::Protocol(_)));
        }
    }

    #[test]
    fn test_shared_observe_reports_changes() {
        let (lifecycle, _) = watch::channel(Lifecycle::Creating);
        let shared = JobShared {
            job_id: 1,
            lifecycle,
            machine: Mutex::new(None),
        };

        assert!(shared.observe(Lifecycle::Queued));
        assert!(!shared.observe(Lifecycle::Queued));
        assert!(shared.observe(Lifecycle::Ready));
        assert!(!shared.observe(Lifecycle::Powering));
        assert_eq!(shared.current(), Lifecycle::Ready);
    }
}
