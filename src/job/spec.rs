//! Allocation requests.

use std::time::Duration;

use serde_json::{json, Map, Value};

use crate::config::Config;
use crate::error::{Result, SpallocError};

/// What to allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    /// Any `n` boards
    Boards(u32),
    /// The board at logical coordinate `(x, y, z)`
    Board { x: u32, y: u32, z: u32 },
    /// A rectangle of `width` by `height` triads
    Rectangle { width: u32, height: u32 },
}

impl Allocation {
    fn args(&self) -> Vec<Value> {
        match *self {
            Allocation::Boards(n) => vec![json!(n)],
            Allocation::Board { x, y, z } => vec![json!(x), json!(y), json!(z)],
            Allocation::Rectangle { width, height } => vec![json!(width), json!(height)],
        }
    }
}

impl Default for Allocation {
    fn default() -> Self {
        Allocation::Boards(1)
    }
}

/// A job request: the allocation plus the constraints the server applies.
///
/// ```ignore
/// let spec = JobSpec::from_config(Allocation::Boards(3), &config)
///     .with_owner("me@example.com")
///     .with_machine("spinn-48");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub allocation: Allocation,
    pub owner: Option<String>,
    /// Keepalive interval requested from the server; `None` disables it
    pub keepalive: Option<Duration>,
    /// Delay between attempts while reconnecting
    pub reconnect_delay: Duration,
    pub machine: Option<String>,
    pub tags: Option<Vec<String>>,
    pub min_ratio: f64,
    pub max_dead_boards: Option<u32>,
    pub max_dead_links: Option<u32>,
    pub require_torus: bool,
}

impl JobSpec {
    /// A request using the built-in defaults.
    pub fn new(allocation: Allocation) -> Self {
        Self::from_config(allocation, &Config::default())
    }

    /// A request taking every constraint from `config`.
    pub fn from_config(allocation: Allocation, config: &Config) -> Self {
        Self {
            allocation,
            owner: config.owner.clone(),
            keepalive: config.keepalive,
            reconnect_delay: config.reconnect_delay,
            machine: config.machine.clone(),
            tags: config.tags.clone(),
            min_ratio: config.min_ratio,
            max_dead_boards: config.max_dead_boards,
            max_dead_links: config.max_dead_links,
            require_torus: config.require_torus,
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Pin the job to one machine, clearing any tags.
    pub fn with_machine(mut self, machine: impl Into<String>) -> Self {
        self.machine = Some(machine.into());
        self.tags = None;
        self
    }

    /// Require machines carrying every one of `tags`, clearing any machine.
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = Some(tags);
        self.machine = None;
        self
    }

    pub fn with_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Reject requests the server would refuse anyway.
    pub fn validate(&self) -> Result<()> {
        match self.owner.as_deref() {
            None | Some("") => {
                return Err(SpallocError::Allocation(
                    "An owner must be specified for all jobs".to_string(),
                ))
            }
            Some(_) => {}
        }
        if self.machine.is_some() && self.tags.is_some() {
            return Err(SpallocError::Allocation(
                "Only one of tags and machine may be specified".to_string(),
            ));
        }
        match self.allocation {
            Allocation::Boards(0) => Err(SpallocError::Allocation(
                "At least one board must be requested".to_string(),
            )),
            Allocation::Rectangle { width, height } if width == 0 || height == 0 => Err(
                SpallocError::Allocation(format!("Invalid rectangle {}x{}", width, height)),
            ),
            _ => Ok(()),
        }
    }

    /// Positional and keyword arguments for `create_job`.
    pub(crate) fn to_call(&self) -> Result<(Vec<Value>, Map<String, Value>)> {
        self.validate()?;

        let mut kwargs = Map::new();
        kwargs.insert("owner".to_string(), json!(self.owner));
        kwargs.insert(
            "keepalive".to_string(),
            json!(self.keepalive.map(|k| k.as_secs_f64())),
        );
        kwargs.insert("machine".to_string(), json!(self.machine));
        kwargs.insert("tags".to_string(), json!(self.tags));
        kwargs.insert("min_ratio".to_string(), json!(self.min_ratio));
        kwargs.insert("max_dead_boards".to_string(), json!(self.max_dead_boards));
        kwargs.insert("max_dead_links".to_string(), json!(self.max_dead_links));
        kwargs.insert("require_torus".to_string(), json!(self.require_torus));

        Ok((self.allocation.args(), kwargs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_to_call_arguments() {
        let spec = JobSpec::new(Allocation::Rectangle {
            width: 4,
            height: 2,
        })
        .with_owner("me")
        .with_machine("m");

        let (args, kwargs) = spec.to_call().unwrap();
        assert_eq!(args, vec![json!(4), json!(2)]);
        assert_eq!(
            Value::Object(kwargs),
            json!({
                "owner": "me",
                "keepalive": 60.0,
                "machine": "m",
                "tags": null,
                "min_ratio": 0.333,
                "max_dead_boards": 0,
                "max_dead_links": null,
                "require_torus": false
            })
        );
    }

    #[test]
    fn test_allocation_forms() {
        assert_eq!(Allocation::default().args(), vec![json!(1)]);
        assert_eq!(
            Allocation::Board { x: 3, y: 2, z: 1 }.args(),
            vec![json!(3), json!(2), json!(1)]
        );
    }

    #[test]
    fn test_validation() {
        let err = JobSpec::new(Allocation::Boards(3)).validate().unwrap_err();
        assert!(matches!(err, SpallocError::Allocation(_)));

        let mut both = JobSpec::new(Allocation::Boards(3)).with_owner("me");
        both.machine = Some("m".to_string());
        both.tags = Some(vec!["default".to_string()]);
        assert!(matches!(both.validate(), Err(SpallocError::Allocation(_))));

        let empty = JobSpec::new(Allocation::Boards(0)).with_owner("me");
        assert!(empty.validate().is_err());

        let ok = JobSpec::new(Allocation::Boards(3))
            .with_owner("me")
            .with_tags(vec!["default".to_string()]);
        assert!(ok.validate().is_ok());
        assert_eq!(ok.machine, None);
    }

    #[test]
    fn test_from_config() {
        let config = Config {
            owner: Some("cfg-owner".to_string()),
            keepalive: None,
            require_torus: true,
            ..Config::default()
        };
        let spec = JobSpec::from_config(Allocation::Boards(1), &config);
        assert_eq!(spec.owner.as_deref(), Some("cfg-owner"));
        assert_eq!(spec.keepalive, None);
        assert!(spec.require_torus);
    }
}
