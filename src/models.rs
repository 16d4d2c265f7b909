//! Data models for the spalloc protocol.
//!
//! These structs mirror the JSON objects returned by the server's query
//! commands. Fields the server may omit or send as `null` are `Option`s
//! with `#[serde(default)]` so older servers still deserialize.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Server-side state of a job.
///
/// On the wire this is the integer code (`0..=4`); the lowercase name is
/// also accepted when decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    /// The server does not know the job
    Unknown,
    /// Waiting for boards to become available
    Queued,
    /// Boards allocated, power commands in progress
    Power,
    /// Boards allocated and powered
    Ready,
    /// The job has ended
    Destroyed,
}

impl JobState {
    /// Wire code of this state.
    pub fn code(&self) -> u8 {
        match self {
            JobState::Unknown => 0,
            JobState::Queued => 1,
            JobState::Power => 2,
            JobState::Ready => 3,
            JobState::Destroyed => 4,
        }
    }

    /// Decode a wire code; out-of-range codes map to `Unknown`.
    pub fn from_code(code: u64) -> Self {
        match code {
            1 => JobState::Queued,
            2 => JobState::Power,
            3 => JobState::Ready,
            4 => JobState::Destroyed,
            _ => JobState::Unknown,
        }
    }

    /// Decode a state name as used by the server's enum.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "unknown" => Some(JobState::Unknown),
            "queued" | "queue" => Some(JobState::Queued),
            "power" => Some(JobState::Power),
            "ready" => Some(JobState::Ready),
            "destroyed" => Some(JobState::Destroyed),
            _ => None,
        }
    }

    /// Get a short display string.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Unknown => "unknown",
            JobState::Queued => "queued",
            JobState::Power => "power",
            JobState::Ready => "ready",
            JobState::Destroyed => "destroyed",
        }
    }

    /// True when the job can never leave this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Destroyed | JobState::Unknown)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for JobState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for JobState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Code(u64),
            Name(String),
        }

        match Wire::deserialize(deserializer)? {
            Wire::Code(code) => Ok(JobState::from_code(code)),
            Wire::Name(name) => JobState::from_name(&name)
                .ok_or_else(|| serde::de::Error::custom(format!("unknown job state '{name}'"))),
        }
    }
}

/// Result of `get_job_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStateInfo {
    pub state: JobState,
    /// Whether the boards are powered (or powering) on; `None` without boards
    #[serde(default)]
    pub power: Option<bool>,
    /// Keepalive interval in seconds, `None` when disabled
    #[serde(default)]
    pub keepalive: Option<f64>,
    /// Reason the job was destroyed, if it was
    #[serde(default)]
    pub reason: Option<String>,
    /// Unix timestamp of job creation
    #[serde(default)]
    pub start_time: Option<f64>,
}

impl JobStateInfo {
    /// Creation time as a UTC timestamp.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.start_time.and_then(timestamp)
    }
}

/// Chip coordinates of an Ethernet-connected chip and its hostname.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// `(x, y)` chip coordinate
    pub chip: (u32, u32),
    pub hostname: String,
}

/// Topology of the boards allocated to a job.
///
/// Returned by `get_job_machine_info` and, on servers that include it, by
/// `create_job`. Every field is `None` until boards are allocated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineInfo {
    /// Width of the allocation in chips
    #[serde(default)]
    pub width: Option<u32>,
    /// Height of the allocation in chips
    #[serde(default)]
    pub height: Option<u32>,
    /// Ethernet-connected chips, as `[[x, y], hostname]` pairs on the wire
    #[serde(default, with = "connection_pairs")]
    pub connections: Option<Vec<Connection>>,
    #[serde(default)]
    pub machine_name: Option<String>,
    /// Logical `(x, y, z)` coordinates of the allocated boards
    #[serde(default)]
    pub boards: Option<Vec<(u32, u32, u32)>>,
}

impl MachineInfo {
    /// True once the server has reported any topology.
    pub fn is_allocated(&self) -> bool {
        self.connections.is_some() || self.width.is_some() || self.machine_name.is_some()
    }

    /// Hostname of chip (0, 0).
    pub fn hostname(&self) -> Option<&str> {
        self.connections
            .as_ref()?
            .iter()
            .find(|c| c.chip == (0, 0))
            .map(|c| c.hostname.as_str())
    }
}

mod connection_pairs {
    use super::Connection;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Vec<Connection>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        value
            .as_ref()
            .map(|conns| {
                conns
                    .iter()
                    .map(|c| ((c.chip.0, c.chip.1), c.hostname.as_str()))
                    .collect::<Vec<_>>()
            })
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<Connection>>, D::Error> {
        let pairs: Option<Vec<((u32, u32), String)>> = Option::deserialize(deserializer)?;
        Ok(pairs.map(|pairs| {
            pairs
                .into_iter()
                .map(|(chip, hostname)| Connection { chip, hostname })
                .collect()
        }))
    }
}

/// One entry of `list_jobs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: u64,
    pub owner: String,
    #[serde(default)]
    pub start_time: Option<f64>,
    #[serde(default)]
    pub keepalive: Option<f64>,
    pub state: JobState,
    #[serde(default)]
    pub power: Option<bool>,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub allocated_machine_name: Option<String>,
    #[serde(default)]
    pub boards: Option<Vec<(u32, u32, u32)>>,
    /// Host currently keeping the job alive
    #[serde(default)]
    pub keepalivehost: Option<String>,
}

impl JobSummary {
    /// Creation time as a UTC timestamp.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.start_time.and_then(timestamp)
    }

    /// Number of allocated boards, if any.
    pub fn num_boards(&self) -> Option<usize> {
        self.boards.as_ref().map(Vec::len)
    }
}

/// One entry of `list_machines`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSummary {
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Width in triads
    pub width: u32,
    /// Height in triads
    pub height: u32,
    #[serde(default)]
    pub dead_boards: Vec<(u32, u32, u32)>,
    #[serde(default)]
    pub dead_links: Vec<(u32, u32, u32, u32)>,
}

impl MachineSummary {
    /// Number of working boards (three per triad).
    pub fn working_boards(&self) -> usize {
        (self.width as usize * self.height as usize * 3).saturating_sub(self.dead_boards.len())
    }
}

/// Result of `where_is`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardLocation {
    pub machine: String,
    /// `(x, y, z)` logical board coordinate
    pub logical: (u32, u32, u32),
    /// `(cabinet, frame, board)` physical coordinate
    pub physical: (u32, u32, u32),
    /// Chip coordinate within the machine
    pub chip: (u32, u32),
    #[serde(default)]
    pub board_chip: Option<(u32, u32)>,
    #[serde(default)]
    pub job_id: Option<u64>,
    #[serde(default)]
    pub job_chip: Option<(u32, u32)>,
}

fn timestamp(secs: f64) -> Option<DateTime<Utc>> {
    let whole = secs.trunc() as i64;
    let nanos = ((secs - secs.trunc()) * 1e9) as u32;
    Utc.timestamp_opt(whole, nanos).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_job_state_accepts_codes_and_names() {
        let state: JobState = serde_json::from_value(json!(3)).unwrap();
        assert_eq!(state, JobState::Ready);

        let state: JobState = serde_json::from_value(json!("power")).unwrap();
        assert_eq!(state, JobState::Power);

        let state: JobState = serde_json::from_value(json!(99)).unwrap();
        assert_eq!(state, JobState::Unknown);

        assert!(serde_json::from_value::<JobState>(json!("exploded")).is_err());
        assert_eq!(serde_json::to_value(JobState::Destroyed).unwrap(), json!(4));
    }

    #[test]
    fn test_job_state_info_with_nulls() {
        let info: JobStateInfo = serde_json::from_value(json!({
            "state": 4,
            "power": null,
            "keepalive": null,
            "reason": "timeout",
            "start_time": 1_500_000_000.5
        }))
        .unwrap();

        assert_eq!(info.state, JobState::Destroyed);
        assert_eq!(info.reason.as_deref(), Some("timeout"));
        assert_eq!(info.started_at().unwrap().timestamp(), 1_500_000_000);
    }

    #[test]
    fn test_machine_info_connections() {
        let info: MachineInfo = serde_json::from_value(json!({
            "width": 8,
            "height": 8,
            "connections": [[[0, 0], "10.0.0.1"], [[4, 8], "10.0.0.2"]],
            "machine_name": "m"
        }))
        .unwrap();

        assert!(info.is_allocated());
        assert_eq!(info.hostname(), Some("10.0.0.1"));
        assert_eq!(
            info.connections.as_ref().unwrap()[1],
            Connection {
                chip: (4, 8),
                hostname: "10.0.0.2".to_string()
            }
        );

        let unallocated: MachineInfo = serde_json::from_value(json!({
            "width": null, "height": null, "connections": null, "machine_name": null
        }))
        .unwrap();
        assert!(!unallocated.is_allocated());
        assert_eq!(unallocated.hostname(), None);
    }

    #[test]
    fn test_machine_summary_working_boards() {
        let machine: MachineSummary = serde_json::from_value(json!({
            "name": "spinn-48",
            "tags": ["default"],
            "width": 2,
            "height": 2,
            "dead_boards": [[0, 0, 1]],
            "dead_links": []
        }))
        .unwrap();

        assert_eq!(machine.working_boards(), 11);
    }
}
