//! Client side of the spalloc server protocol.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐   call/cast    ┌──────────────┐   TCP, JSON lines   ┌────────────────┐
//! │ JobController  │ ─────────────► │ ProtocolClient│ ◄──────────────────►│ spalloc server │
//! │ (job module)   │ ◄───────────── │ receive loop │                     └────────────────┘
//! └────────────────┘ notifications  └──────────────┘
//! ```
//!
//! One connection carries both command/response traffic and unsolicited
//! notifications. Every command carries a `correlation_id` which the
//! server echoes in its reply, so any number of calls can be in flight
//! at once.
//!
//! # Usage
//!
//! ```ignore
//! use spalloc_client::protocol::ProtocolClient;
//!
//! let client = ProtocolClient::new("spalloc.example.com", 22244);
//! client.connect().await?;
//!
//! let mut listener = client.subscribe();
//! client.notify_job(None).await?;
//! while let Some(notification) = listener.recv().await {
//!     println!("{:?} changed", notification.job_ids());
//! }
//! ```

mod client;
pub mod codec;
mod commands;
mod listener;
pub mod transport;

pub use client::{ProtocolClient, DEFAULT_PORT};
pub use codec::{Frame, Notification, NotificationKind};
pub use commands::{WhereIs, MAX_VERSION, MIN_VERSION};
pub use listener::{ListenerId, NotificationListener, DEFAULT_LISTENER_CAPACITY};
