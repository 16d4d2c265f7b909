//! Client-side lifecycle of a job.

use std::fmt;

use crate::models::JobState;

/// Reason recorded when the server no longer knows a job.
pub(crate) const REASON_UNKNOWN_JOB: &str = "server no longer recognises job";

/// Where a job is in its life, as seen by this client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    /// `create_job` has not yet returned
    Creating,
    Queued,
    Powering,
    Ready,
    /// Terminal
    Destroyed { reason: Option<String> },
    /// The server replied with something unusable
    Errored { message: String },
}

impl Lifecycle {
    /// Lifecycle matching a server-reported state.
    pub fn from_server(state: JobState, reason: Option<&str>) -> Self {
        match state {
            JobState::Queued => Lifecycle::Queued,
            JobState::Power => Lifecycle::Powering,
            JobState::Ready => Lifecycle::Ready,
            JobState::Destroyed => Lifecycle::Destroyed {
                reason: reason.map(str::to_string),
            },
            JobState::Unknown => Lifecycle::Destroyed {
                reason: Some(reason.unwrap_or(REASON_UNKNOWN_JOB).to_string()),
            },
        }
    }

    /// The server state this corresponds to.
    pub fn job_state(&self) -> JobState {
        match self {
            Lifecycle::Creating | Lifecycle::Errored { .. } => JobState::Unknown,
            Lifecycle::Queued => JobState::Queued,
            Lifecycle::Powering => JobState::Power,
            Lifecycle::Ready => JobState::Ready,
            Lifecycle::Destroyed { .. } => JobState::Destroyed,
        }
    }

    pub fn is_destroyed(&self) -> bool {
        matches!(self, Lifecycle::Destroyed { .. })
    }

    /// Position along creating → queued → powering → ready.
    fn rank(&self) -> Option<u8> {
        match self {
            Lifecycle::Creating => Some(0),
            Lifecycle::Queued => Some(1),
            Lifecycle::Powering => Some(2),
            Lifecycle::Ready => Some(3),
            Lifecycle::Destroyed { .. } | Lifecycle::Errored { .. } => None,
        }
    }

    /// The state to move to after observing `next`, if any.
    ///
    /// Progress only moves forward (skipping a lost step is fine), anything
    /// may be destroyed or errored, and nothing leaves destroyed. Errored
    /// only gives way to destroyed.
    pub(crate) fn advance(&self, next: &Lifecycle) -> Option<Lifecycle> {
        match (self, next) {
            (Lifecycle::Destroyed { .. }, _) => None,
            (_, Lifecycle::Destroyed { .. }) => Some(next.clone()),
            (Lifecycle::Errored { .. }, _) => None,
            (_, Lifecycle::Errored { .. }) => Some(next.clone()),
            (current, next) => match (current.rank(), next.rank()) {
                (Some(from), Some(to)) if to > from => Some(next.clone()),
                _ => None,
            },
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lifecycle::Creating => f.write_str("creating"),
            Lifecycle::Queued => f.write_str("queued"),
            Lifecycle::Powering => f.write_str("powering"),
            Lifecycle::Ready => f.write_str("ready"),
            Lifecycle::Destroyed { reason: Some(reason) } => write!(f, "destroyed ({reason})"),
            Lifecycle::Destroyed { reason: None } => f.write_str("destroyed"),
            Lifecycle::Errored { message } => write!(f, "errored ({message})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn destroyed(reason: &str) -> Lifecycle {
        Lifecycle::Destroyed {
            reason: Some(reason.to_string()),
        }
    }

    #[test]
    fn test_forward_only() {
        assert_eq!(Lifecycle::Queued.advance(&Lifecycle::Powering), Some(Lifecycle::Powering));
        assert_eq!(Lifecycle::Queued.advance(&Lifecycle::Ready), Some(Lifecycle::Ready));
        assert_eq!(Lifecycle::Ready.advance(&Lifecycle::Powering), None);
        assert_eq!(Lifecycle::Powering.advance(&Lifecycle::Powering), None);
        assert_eq!(Lifecycle::Creating.advance(&Lifecycle::Queued), Some(Lifecycle::Queued));
    }

    #[test]
    fn test_destroyed_is_terminal() {
        let gone = destroyed("timeout");
        assert_eq!(Lifecycle::Ready.advance(&gone), Some(gone.clone()));
        assert_eq!(gone.advance(&Lifecycle::Ready), None);
        assert_eq!(gone.advance(&destroyed("again")), None);

        let errored = Lifecycle::Errored {
            message: "bad reply".to_string(),
        };
        assert_eq!(gone.advance(&errored), None);
        assert_eq!(errored.advance(&Lifecycle::Ready), None);
        assert_eq!(errored.advance(&gone), Some(gone.clone()));
    }

    #[test]
    fn test_from_server() {
        assert_eq!(Lifecycle::from_server(JobState::Power, None), Lifecycle::Powering);
        assert_eq!(
            Lifecycle::from_server(JobState::Destroyed, Some("user requested")),
            destroyed("user requested")
        );
        assert_eq!(
            Lifecycle::from_server(JobState::Unknown, None),
            destroyed(REASON_UNKNOWN_JOB)
        );
        assert_eq!(Lifecycle::Powering.job_state(), JobState::Power);
        assert_eq!(destroyed("x").to_string(), "destroyed (x)");
    }
}
