//! Spalloc client library
//!
//! Talks to a spalloc server, which leases partitions of a large
//! SpiNNaker machine ("boards") to users:
//!
//! - `protocol` - one multiplexed connection carrying calls and notifications
//! - `job` - lifecycle of a single allocation (keepalive, waiting, teardown)
//! - `models` - typed results of the server's query commands
//! - `config` - settings read from the spalloc config files
//!
//! # Example
//!
//! ```ignore
//! use spalloc_client::{Allocation, Config, JobController, JobSpec, ProtocolClient};
//! use std::time::Duration;
//!
//! let config = Config::load()?;
//! let client = ProtocolClient::from_config(&config)?;
//! let spec = JobSpec::from_config(Allocation::Boards(3), &config);
//!
//! let job = JobController::create(client, spec).await?;
//! job.wait_until_ready(Some(Duration::from_secs(60))).await?;
//! println!("Allocated {:?}", job.boards());
//! job.destroy(None).await?;
//! ```

pub mod config;
pub mod error;
pub mod job;
pub mod models;
pub mod protocol;

pub use config::Config;
pub use error::{Result, SpallocError};
pub use job::{Allocation, JobController, JobSpec, Lifecycle};
pub use models::JobState;
pub use protocol::ProtocolClient;
