//! `spalloc` - command line front end for the spalloc client library.
//!
//! Settings come from the spalloc config files and may be overridden on
//! the command line.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use spalloc_client::models::JobSummary;
use spalloc_client::{Allocation, Config, JobController, JobSpec, JobState, ProtocolClient};

#[derive(Parser, Debug)]
#[command(name = "spalloc")]
#[command(about = "Allocate and inspect boards managed by a spalloc server")]
#[command(version)]
struct Cli {
    /// Server hostname (overrides the config files)
    #[arg(long, global = true)]
    hostname: Option<String>,

    /// Server port
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Call timeout in seconds
    #[arg(long, global = true)]
    timeout: Option<f64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Request boards and hold them until interrupted
    Alloc {
        /// Nothing for one board, N for N boards, W H for a rectangle of
        /// triads, or X Y Z for one specific board
        #[arg(num_args = 0..=3)]
        dimensions: Vec<u32>,

        /// Owner recorded against the job
        #[arg(long)]
        owner: Option<String>,

        /// Machine to allocate on
        #[arg(long, conflicts_with = "tags")]
        machine: Option<String>,

        /// Tags the machine must carry
        #[arg(long, value_delimiter = ',')]
        tags: Option<Vec<String>>,

        /// Seconds to wait for the boards to become ready
        #[arg(long, default_value = "300")]
        wait: f64,
    },
    /// List the server's jobs
    Ps {
        /// Only show jobs on this machine
        #[arg(long)]
        machine: Option<String>,

        /// Only show jobs owned by this user
        #[arg(long)]
        owner: Option<String>,
    },
    /// List the server's machines
    Machines,
    /// Destroy a job
    Destroy {
        job_id: u64,

        /// Reason recorded by the server
        #[arg(long)]
        reason: Option<String>,
    },
}

fn allocation(dimensions: &[u32]) -> Result<Allocation> {
    Ok(match *dimensions {
        [] => Allocation::Boards(1),
        [n] => Allocation::Boards(n),
        [width, height] => Allocation::Rectangle { width, height },
        [x, y, z] => Allocation::Board { x, y, z },
        _ => bail!("Expected at most three dimensions"),
    })
}

fn seconds(secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs).with_context(|| format!("Invalid duration: {secs}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "spalloc=info,spalloc_client=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();

    let mut config = Config::load().context("Failed to load spalloc configuration")?;
    if let Some(hostname) = cli.hostname {
        config.hostname = Some(hostname);
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(timeout) = cli.timeout {
        config.timeout = Some(seconds(timeout)?);
    }

    let client = ProtocolClient::from_config(&config)
        .context("No spalloc server configured; pass --hostname")?;
    client
        .connect()
        .await
        .with_context(|| format!("Could not connect to {}:{}", client.hostname(), client.port()))?;

    let result = match cli.command {
        Command::Alloc {
            dimensions,
            owner,
            machine,
            tags,
            wait,
        } => {
            let mut spec = JobSpec::from_config(allocation(&dimensions)?, &config);
            if let Some(owner) = owner {
                spec = spec.with_owner(owner);
            }
            if let Some(machine) = machine {
                spec = spec.with_machine(machine);
            }
            if let Some(tags) = tags {
                spec = spec.with_tags(tags);
            }
            alloc(&client, spec, seconds(wait)?).await
        }
        Command::Ps { machine, owner } => ps(&client, machine.as_deref(), owner.as_deref()).await,
        Command::Machines => machines(&client).await,
        Command::Destroy { job_id, reason } => {
            client
                .destroy_job(job_id, reason.as_deref())
                .await
                .with_context(|| format!("Could not destroy job {job_id}"))?;
            println!("Job {job_id} destroyed");
            Ok(())
        }
    };

    client.close().await;
    result
}

async fn alloc(client: &ProtocolClient, spec: JobSpec, wait: Duration) -> Result<()> {
    let job = JobController::create(client.clone(), spec)
        .await
        .context("Allocation failed")?;
    println!("Job ID: {}", job.id());

    let outcome = tokio::select! {
        ready = job.wait_until_ready(Some(wait)) => ready.map(Some),
        _ = tokio::signal::ctrl_c() => Ok(None),
    };

    match outcome {
        Ok(Some(())) => {
            println!("Hostname:     {}", job.hostname().unwrap_or_default());
            println!(
                "Dimensions:   {}x{} chips",
                job.width().unwrap_or_default(),
                job.height().unwrap_or_default()
            );
            println!("Machine:      {}", job.machine_name().unwrap_or_default());
            println!("Boards:       {}", job.boards().map_or(0, |b| b.len()));
            println!("Press Ctrl+C to release the boards");
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl+C")?;
        }
        Ok(None) => info!("Interrupted before job {} was ready", job.id()),
        Err(e) => {
            warn!("Job {} did not become ready: {}", job.id(), e);
            if job.state() == JobState::Destroyed {
                return Err(e).context("Job was destroyed");
            }
            job.destroy(Some("allocation failed")).await.ok();
            return Err(e).context("Job did not become ready");
        }
    }

    job.destroy(Some("released by user")).await?;
    println!("Job {} destroyed", job.id());
    Ok(())
}

fn print_job(job: &JobSummary) {
    let started = job
        .started_at()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default();
    println!(
        "{:>6}  {:<10}  {:<5}  {:>6}  {:<20}  {:<12}  {}",
        job.job_id,
        job.state.as_str(),
        match job.power {
            Some(true) => "on",
            Some(false) => "off",
            None => "",
        },
        job.num_boards().map(|n| n.to_string()).unwrap_or_default(),
        started,
        job.allocated_machine_name.as_deref().unwrap_or(""),
        job.owner
    );
}

async fn ps(client: &ProtocolClient, machine: Option<&str>, owner: Option<&str>) -> Result<()> {
    let mut jobs = client.list_jobs().await.context("Could not list jobs")?;
    jobs.retain(|job| {
        machine.map_or(true, |m| job.allocated_machine_name.as_deref() == Some(m))
            && owner.map_or(true, |o| job.owner == o)
    });
    jobs.sort_by_key(|job| job.job_id);

    println!(
        "{:>6}  {:<10}  {:<5}  {:>6}  {:<20}  {:<12}  {}",
        "ID", "State", "Power", "Boards", "Created", "Machine", "Owner"
    );
    for job in &jobs {
        print_job(job);
    }
    Ok(())
}

async fn machines(client: &ProtocolClient) -> Result<()> {
    let machines = client
        .list_machines()
        .await
        .context("Could not list machines")?;

    println!(
        "{:<16}  {:>5}  {:>6}  {:>6}  {:>6}  {}",
        "Name", "Width", "Height", "Boards", "Dead", "Tags"
    );
    for machine in &machines {
        println!(
            "{:<16}  {:>5}  {:>6}  {:>6}  {:>6}  {}",
            machine.name,
            machine.width,
            machine.height,
            machine.working_boards(),
            machine.dead_boards.len(),
            machine.tags.join(", ")
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_from_dimensions() {
        assert_eq!(allocation(&[]).unwrap(), Allocation::Boards(1));
        assert_eq!(allocation(&[4]).unwrap(), Allocation::Boards(4));
        assert_eq!(
            allocation(&[2, 3]).unwrap(),
            Allocation::Rectangle {
                width: 2,
                height: 3
            }
        );
        assert_eq!(
            allocation(&[1, 2, 0]).unwrap(),
            Allocation::Board { x: 1, y: 2, z: 0 }
        );
        assert!(allocation(&[1, 2, 3, 4]).is_err());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["spalloc", "--hostname", "h", "alloc", "2", "3"]).unwrap();
        assert_eq!(cli.hostname.as_deref(), Some("h"));
        assert!(matches!(cli.command, Command::Alloc { ref dimensions, .. } if dimensions == &[2, 3]));
    }
}
