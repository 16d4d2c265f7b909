//! Typed wrappers for the server's commands.
//!
//! Each wrapper builds the positional and keyword arguments for one
//! command, issues it with the client's default timeout and decodes the
//! reply. A reply that does not decode is a [`SpallocError::Protocol`].

use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::{Result, SpallocError};
use crate::models::{BoardLocation, JobStateInfo, JobSummary, MachineInfo, MachineSummary};
use crate::protocol::ProtocolClient;

/// Oldest server version this client talks to (inclusive).
pub const MIN_VERSION: (u32, u32, u32) = (0, 0, 2);
/// First server version this client no longer talks to.
pub const MAX_VERSION: (u32, u32, u32) = (2, 0, 0);

/// Arguments accepted by `where_is`.
///
/// The server only understands these four combinations of keywords.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WhereIs {
    /// Logical board coordinate on a machine
    Logical {
        machine: String,
        x: u32,
        y: u32,
        z: u32,
    },
    /// Physical board position on a machine
    Physical {
        machine: String,
        cabinet: u32,
        frame: u32,
        board: u32,
    },
    /// Chip coordinate on a machine
    MachineChip {
        machine: String,
        chip_x: u32,
        chip_y: u32,
    },
    /// Chip coordinate relative to a job's allocation
    JobChip { job_id: u64, chip_x: u32, chip_y: u32 },
}

impl WhereIs {
    fn into_kwargs(self) -> Map<String, Value> {
        let value = match self {
            WhereIs::Logical { machine, x, y, z } => {
                json!({"machine": machine, "x": x, "y": y, "z": z})
            }
            WhereIs::Physical {
                machine,
                cabinet,
                frame,
                board,
            } => json!({"machine": machine, "cabinet": cabinet, "frame": frame, "board": board}),
            WhereIs::MachineChip {
                machine,
                chip_x,
                chip_y,
            } => json!({"machine": machine, "chip_x": chip_x, "chip_y": chip_y}),
            WhereIs::JobChip {
                job_id,
                chip_x,
                chip_y,
            } => json!({"job_id": job_id, "chip_x": chip_x, "chip_y": chip_y}),
        };
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

impl<'a> TryFrom<&'a Map<String, Value>> for WhereIs {
    type Error = SpallocError;

    /// Pick the query form from a set of keywords, rejecting any other set.
    fn try_from(kwargs: &'a Map<String, Value>) -> Result<Self> {
        let mut keys: Vec<&str> = kwargs.keys().map(String::as_str).collect();
        keys.sort_unstable();

        let text = |key: &str| -> Result<String> {
            kwargs
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| SpallocError::protocol(format!("where_is: '{key}' must be a string")))
        };
        let number = |key: &str| -> Result<u32> {
            kwargs
                .get(key)
                .and_then(Value::as_u64)
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| {
                    SpallocError::protocol(format!("where_is: '{key}' must be a small integer"))
                })
        };

        match keys.as_slice() {
            ["machine", "x", "y", "z"] => Ok(WhereIs::Logical {
                machine: text("machine")?,
                x: number("x")?,
                y: number("y")?,
                z: number("z")?,
            }),
            ["board", "cabinet", "frame", "machine"] => Ok(WhereIs::Physical {
                machine: text("machine")?,
                cabinet: number("cabinet")?,
                frame: number("frame")?,
                board: number("board")?,
            }),
            ["chip_x", "chip_y", "machine"] => Ok(WhereIs::MachineChip {
                machine: text("machine")?,
                chip_x: number("chip_x")?,
                chip_y: number("chip_y")?,
            }),
            ["chip_x", "chip_y", "job_id"] => Ok(WhereIs::JobChip {
                job_id: kwargs
                    .get("job_id")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| SpallocError::protocol("where_is: 'job_id' must be an integer"))?,
                chip_x: number("chip_x")?,
                chip_y: number("chip_y")?,
            }),
            _ => Err(SpallocError::protocol(format!(
                "Invalid arguments for where_is: {}",
                keys.join(", ")
            ))),
        }
    }
}

/// Decode a command's reply into `T`.
fn decode_reply<T: DeserializeOwned>(command: &str, reply: Value) -> Result<T> {
    serde_json::from_value(reply)
        .map_err(|e| SpallocError::protocol(format!("Unexpected reply to '{}': {}", command, e)))
}

/// Parse a dotted version string, ignoring any non-numeric suffix.
pub(crate) fn parse_version(version: &str) -> Option<(u32, u32, u32)> {
    let mut parts = version.trim().split('.').map(|part| {
        let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
        digits.parse::<u32>().ok()
    });
    let major = parts.next()??;
    let minor = parts.next().flatten().unwrap_or(0);
    let patch = parts.next().flatten().unwrap_or(0);
    Some((major, minor, patch))
}

impl ProtocolClient {
    /// Ask the server which version it is running.
    pub async fn version(&self) -> Result<String> {
        let reply = self.call("version", vec![], Map::new()).await?;
        decode_reply("version", reply)
    }

    /// Fetch the server version and check it lies in
    /// [`MIN_VERSION`, `MAX_VERSION`).
    pub async fn check_version(&self) -> Result<String> {
        let version = self.version().await?;
        match parse_version(&version) {
            Some(parsed) if parsed >= MIN_VERSION && parsed < MAX_VERSION => {
                debug!("Server version {} is compatible", version);
                Ok(version)
            }
            _ => Err(SpallocError::IncompatibleVersion(version)),
        }
    }

    /// Request a new job.
    ///
    /// Returns the raw reply: a bare job id from older servers, or an
    /// object carrying the id and, once known, the allocation topology.
    pub async fn create_job(&self, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<Value> {
        if !kwargs.get("owner").is_some_and(Value::is_string) {
            return Err(SpallocError::Allocation(
                "An owner must be specified for all jobs".to_string(),
            ));
        }
        self.call("create_job", args, kwargs).await
    }

    /// Reset a job's keepalive timer.
    pub async fn job_keepalive(&self, job_id: u64) -> Result<()> {
        self.call("job_keepalive", vec![json!(job_id)], Map::new())
            .await
            .map(|_| ())
    }

    pub async fn get_job_state(&self, job_id: u64) -> Result<JobStateInfo> {
        let reply = self
            .call("get_job_state", vec![json!(job_id)], Map::new())
            .await?;
        decode_reply("get_job_state", reply)
    }

    pub async fn get_job_machine_info(&self, job_id: u64) -> Result<MachineInfo> {
        let reply = self
            .call("get_job_machine_info", vec![json!(job_id)], Map::new())
            .await?;
        decode_reply("get_job_machine_info", reply)
    }

    /// Power on (or power-cycle) a job's boards.
    pub async fn power_on_job_boards(&self, job_id: u64) -> Result<()> {
        self.call("power_on_job_boards", vec![json!(job_id)], Map::new())
            .await
            .map(|_| ())
    }

    pub async fn power_off_job_boards(&self, job_id: u64) -> Result<()> {
        self.call("power_off_job_boards", vec![json!(job_id)], Map::new())
            .await
            .map(|_| ())
    }

    /// Destroy a job, waiting for the server to acknowledge.
    pub async fn destroy_job(&self, job_id: u64, reason: Option<&str>) -> Result<()> {
        self.call("destroy_job", vec![json!(job_id), json!(reason)], Map::new())
            .await
            .map(|_| ())
    }

    /// Subscribe to changes of one job, or of every job when `None`.
    pub async fn notify_job(&self, job_id: Option<u64>) -> Result<()> {
        self.call("notify_job", vec![json!(job_id)], Map::new())
            .await
            .map(|_| ())
    }

    pub async fn no_notify_job(&self, job_id: Option<u64>) -> Result<()> {
        self.call("no_notify_job", vec![json!(job_id)], Map::new())
            .await
            .map(|_| ())
    }

    /// Subscribe to changes of one machine, or of every machine when `None`.
    pub async fn notify_machine(&self, machine_name: Option<&str>) -> Result<()> {
        self.call("notify_machine", vec![json!(machine_name)], Map::new())
            .await
            .map(|_| ())
    }

    pub async fn no_notify_machine(&self, machine_name: Option<&str>) -> Result<()> {
        self.call("no_notify_machine", vec![json!(machine_name)], Map::new())
            .await
            .map(|_| ())
    }

    /// All jobs currently known to the server.
    pub async fn list_jobs(&self) -> Result<Vec<JobSummary>> {
        let reply = self.call("list_jobs", vec![], Map::new()).await?;
        decode_reply("list_jobs", reply)
    }

    /// All machines managed by the server.
    pub async fn list_machines(&self) -> Result<Vec<MachineSummary>> {
        let reply = self.call("list_machines", vec![], Map::new()).await?;
        decode_reply("list_machines", reply)
    }

    /// Physical `(cabinet, frame, board)` of logical board `(x, y, z)`.
    pub async fn get_board_position(
        &self,
        machine_name: &str,
        x: u32,
        y: u32,
        z: u32,
    ) -> Result<Option<(u32, u32, u32)>> {
        let reply = self
            .call(
                "get_board_position",
                vec![json!(machine_name), json!(x), json!(y), json!(z)],
                Map::new(),
            )
            .await?;
        decode_reply("get_board_position", reply)
    }

    /// Logical `(x, y, z)` of the board at physical `(cabinet, frame, board)`.
    pub async fn get_board_at_position(
        &self,
        machine_name: &str,
        cabinet: u32,
        frame: u32,
        board: u32,
    ) -> Result<Option<(u32, u32, u32)>> {
        let reply = self
            .call(
                "get_board_at_position",
                vec![json!(machine_name), json!(cabinet), json!(frame), json!(board)],
                Map::new(),
            )
            .await?;
        decode_reply("get_board_at_position", reply)
    }

    /// Locate a board or chip. `None` when nothing is there.
    pub async fn where_is(&self, query: WhereIs) -> Result<Option<BoardLocation>> {
        let reply = self.call("where_is", vec![], query.into_kwargs()).await?;
        decode_reply("where_is", reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn kwargs(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("Expected object"),
        }
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("1.0.0"), Some((1, 0, 0)));
        assert_eq!(parse_version("0.4"), Some((0, 4, 0)));
        assert_eq!(parse_version("1.2.3rc1"), Some((1, 2, 3)));
        assert_eq!(parse_version("banana"), None);

        let compatible = |v: &str| {
            parse_version(v).is_some_and(|p| p >= MIN_VERSION && p < MAX_VERSION)
        };
        assert!(compatible("0.0.2"));
        assert!(compatible("1.9.9"));
        assert!(!compatible("0.0.1"));
        assert!(!compatible("2.0.0"));
    }

    #[test]
    fn test_where_is_accepts_known_keyword_sets() {
        let query = WhereIs::try_from(&kwargs(json!({"machine": "m", "x": 1, "y": 2, "z": 0})))
            .unwrap();
        assert_eq!(
            query,
            WhereIs::Logical {
                machine: "m".to_string(),
                x: 1,
                y: 2,
                z: 0
            }
        );

        let query =
            WhereIs::try_from(&kwargs(json!({"job_id": 5, "chip_x": 8, "chip_y": 4}))).unwrap();
        assert_eq!(
            query.clone().into_kwargs(),
            kwargs(json!({"job_id": 5, "chip_x": 8, "chip_y": 4}))
        );

        let query = WhereIs::try_from(&kwargs(
            json!({"machine": "m", "cabinet": 0, "frame": 1, "board": 2}),
        ))
        .unwrap();
        assert!(matches!(query, WhereIs::Physical { board: 2, .. }));
    }

    #[test]
    fn test_where_is_rejects_other_keyword_sets() {
        for bad in [
            json!({"machine": "m", "x": 1, "y": 2}),
            json!({"job_id": 5, "x": 1, "y": 2, "z": 0}),
            json!({"machine": "m", "chip_x": 1, "chip_y": 2, "z": 0}),
            json!({}),
        ] {
            assert!(WhereIs::try_from(&kwargs(bad)).is_err());
        }

        let wrong_type = kwargs(json!({"machine": 3, "chip_x": 1, "chip_y": 2}));
        assert!(WhereIs::try_from(&wrong_type).is_err());
    }

    #[test]
    fn test_decode_reply_shape_error() {
        let err = decode_reply::<Vec<JobSummary>>("list_jobs", json!({"not": "a list"})).unwrap_err();
        assert!(matches!(err, SpallocError::Protocol(_)));
    }
}
