//! Newline-delimited JSON codec for the spalloc protocol.
//!
//! # Wire Format
//!
//! Every message is one JSON object terminated by `\n`:
//!
//! ```text
//! {"command":"get_job_state","args":[42],"kwargs":{},"correlation_id":7}\n
//! {"correlation_id":7,"return":{"state":3,"power":true,...}}\n
//! {"kind":"job_state_changed","job_id":42,"payload":{"state":4,"reason":"timeout"}}\n
//! ```
//!
//! A frame that fails to parse yields [`SpallocError::MalformedMessage`];
//! the caller drops it and keeps reading. Framing problems reported by
//! [`LineBuffer`] (oversized lines, a truncated frame at EOF) are fatal.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{Result, SpallocError};
use crate::models::JobState;

/// Maximum frame size (1MiB) before the stream is considered corrupt.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Notification kind for job state changes.
pub const JOB_STATE_CHANGED: &str = "job_state_changed";
/// Notification kind for machine state changes.
pub const MACHINE_STATE_CHANGED: &str = "machine_state_changed";

/// An outgoing command frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command {
    pub command: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub correlation_id: u64,
}

impl Command {
    pub fn new(
        command: impl Into<String>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        correlation_id: u64,
    ) -> Self {
        Self {
            command: command.into(),
            args,
            kwargs,
            correlation_id,
        }
    }
}

/// A response to a previously sent command.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub correlation_id: u64,
    /// The returned value, or the exception message reported by the server
    pub outcome: std::result::Result<Value, String>,
}

/// Kind of an unsolicited notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationKind {
    JobStateChanged,
    MachineStateChanged,
    Other(String),
}

impl NotificationKind {
    fn parse(kind: &str) -> Self {
        match kind {
            JOB_STATE_CHANGED => NotificationKind::JobStateChanged,
            MACHINE_STATE_CHANGED => NotificationKind::MachineStateChanged,
            other => NotificationKind::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            NotificationKind::JobStateChanged => JOB_STATE_CHANGED,
            NotificationKind::MachineStateChanged => MACHINE_STATE_CHANGED,
            NotificationKind::Other(kind) => kind,
        }
    }
}

/// An unsolicited message pushed by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub job_id: Option<u64>,
    pub payload: Value,
}

impl Notification {
    /// Job identifiers this notification concerns.
    ///
    /// Uses `job_id` when present, otherwise an integer array payload
    /// (the `jobs_changed` form).
    pub fn job_ids(&self) -> Vec<u64> {
        if let Some(id) = self.job_id {
            return vec![id];
        }
        match &self.payload {
            Value::Array(items) => items.iter().filter_map(Value::as_u64).collect(),
            _ => Vec::new(),
        }
    }

    /// True if this is a job notification naming `job_id`.
    pub fn concerns_job(&self, job_id: u64) -> bool {
        self.kind == NotificationKind::JobStateChanged && self.job_ids().contains(&job_id)
    }

    /// New job state carried in the payload, if the server included one.
    pub fn job_state(&self) -> Option<JobState> {
        let state = self.payload.get("state")?;
        serde_json::from_value(state.clone()).ok()
    }

    /// Destruction reason carried in the payload.
    pub fn reason(&self) -> Option<&str> {
        self.payload.get("reason").and_then(Value::as_str)
    }
}

/// A decoded incoming frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Response(Response),
    Notification(Notification),
}

/// Encode a command as a newline-terminated frame.
pub fn encode(command: &Command) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(command)
        .map_err(|e| SpallocError::malformed(format!("Failed to encode command: {}", e)))?;
    if bytes.len() >= MAX_FRAME_SIZE {
        return Err(SpallocError::malformed(format!(
            "Command '{}' exceeds maximum frame size",
            command.command
        )));
    }
    bytes.push(b'\n');
    Ok(bytes)
}

/// Decode one frame (without its trailing newline).
pub fn decode(frame: &[u8]) -> Result<Frame> {
    let value: Value = serde_json::from_slice(frame)
        .map_err(|e| SpallocError::malformed(format!("Invalid JSON: {}", e)))?;
    let Value::Object(mut obj) = value else {
        return Err(SpallocError::malformed("Frame is not a JSON object"));
    };

    if obj.contains_key("return") || obj.contains_key("exception") {
        let correlation_id = obj
            .get("correlation_id")
            .and_then(Value::as_u64)
            .ok_or_else(|| SpallocError::malformed("Response without correlation_id"))?;

        let outcome = match obj.remove("exception") {
            Some(Value::String(message)) => Err(message),
            Some(other) => Err(other.to_string()),
            None => Ok(obj.remove("return").unwrap_or(Value::Null)),
        };

        return Ok(Frame::Response(Response {
            correlation_id,
            outcome,
        }));
    }

    if let Some(kind) = obj.get("kind").and_then(Value::as_str) {
        let kind = NotificationKind::parse(kind);
        let job_id = match obj.get("job_id") {
            None | Some(Value::Null) => None,
            Some(id) => Some(
                id.as_u64()
                    .ok_or_else(|| SpallocError::malformed(format!("Invalid job_id: {}", id)))?,
            ),
        };
        let payload = obj.remove("payload").unwrap_or(Value::Null);
        return Ok(Frame::Notification(Notification {
            kind,
            job_id,
            payload,
        }));
    }

    // Older servers push bare change lists
    if let Some(ids) = obj.remove("jobs_changed") {
        return Ok(Frame::Notification(Notification {
            kind: NotificationKind::JobStateChanged,
            job_id: None,
            payload: ids,
        }));
    }
    if let Some(names) = obj.remove("machines_changed") {
        return Ok(Frame::Notification(Notification {
            kind: NotificationKind::MachineStateChanged,
            job_id: None,
            payload: names,
        }));
    }

    Err(SpallocError::malformed("Frame is neither a response nor a notification"))
}

/// Accumulates stream bytes and splits them into newline-terminated frames.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Take the next complete frame, without its newline.
    ///
    /// Blank lines are skipped. Fails if the buffered partial line has
    /// grown past [`MAX_FRAME_SIZE`].
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            let Some(pos) = self.buf.iter().position(|&b| b == b'\n') else {
                if self.buf.len() > MAX_FRAME_SIZE {
                    return Err(SpallocError::connection(format!(
                        "Frame exceeds maximum size of {} bytes",
                        MAX_FRAME_SIZE
                    )));
                }
                return Ok(None);
            };

            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            if line.len() > MAX_FRAME_SIZE {
                return Err(SpallocError::connection(format!(
                    "Frame exceeds maximum size of {} bytes",
                    MAX_FRAME_SIZE
                )));
            }
            return Ok(Some(line));
        }
    }

    /// Check the buffer at end of stream.
    ///
    /// Leftover non-whitespace bytes mean the peer closed mid-frame.
    pub fn finish(&mut self) -> Result<()> {
        let leftover = std::mem::take(&mut self.buf);
        if leftover.iter().all(u8::is_ascii_whitespace) {
            Ok(())
        } else {
            Err(SpallocError::connection(format!(
                "Stream ended inside a frame ({} bytes unterminated)",
                leftover.len()
            )))
        }
    }
}
