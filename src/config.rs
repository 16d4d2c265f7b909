//! Client configuration.
//!
//! Settings live in a `[spalloc]` table of TOML files read from, lowest
//! priority first:
//!
//! 1. `/etc/xdg/spalloc`
//! 2. `<user config dir>/spalloc`
//! 3. `./.spalloc`
//!
//! Later files override earlier ones key by key; missing files are
//! skipped. Optional settings accept the string `"None"` to switch them
//! off again, so a user file can undo a site-wide default.
//!
//! ```toml
//! [spalloc]
//! hostname = "spalloc.example.com"
//! owner = "me@example.com"
//! keepalive = 60.0
//! tags = ["default"]
//! max_dead_links = "None"
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use tracing::debug;

use crate::error::{Result, SpallocError};
use crate::protocol::DEFAULT_PORT;

/// Name used for config file paths.
const APP_NAME: &str = "spalloc";

/// Resolved client configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Server hostname; required before connecting
    pub hostname: Option<String>,
    pub port: u16,
    /// Owner recorded against new jobs
    pub owner: Option<String>,
    /// Job keepalive interval; `None` disables the server-side timeout
    pub keepalive: Option<Duration>,
    /// Delay between reconnection attempts
    pub reconnect_delay: Duration,
    /// Default timeout for server calls; `None` waits forever
    pub timeout: Option<Duration>,
    /// Machine to allocate on; mutually exclusive with `tags`
    pub machine: Option<String>,
    /// Tags a machine must carry to be allocated on
    pub tags: Option<Vec<String>>,
    /// Minimum aspect ratio of an allocation
    pub min_ratio: f64,
    pub max_dead_boards: Option<u32>,
    pub max_dead_links: Option<u32>,
    /// Only allocate wrap-around (torus) connected partitions
    pub require_torus: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: None,
            port: DEFAULT_PORT,
            owner: None,
            keepalive: Some(Duration::from_secs(60)),
            reconnect_delay: Duration::from_secs(5),
            timeout: Some(Duration::from_secs(5)),
            machine: None,
            tags: None,
            min_ratio: 0.333,
            max_dead_boards: Some(0),
            max_dead_links: None,
            require_torus: false,
        }
    }
}

/// Settings present in one file. The outer `Option` says whether the key
/// appeared; the inner one whether it was `"None"`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigOverlay {
    #[serde(default, deserialize_with = "text")]
    hostname: Option<Option<String>>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default, deserialize_with = "text")]
    owner: Option<Option<String>>,
    #[serde(default, deserialize_with = "seconds")]
    keepalive: Option<Option<Duration>>,
    #[serde(default, deserialize_with = "delay")]
    reconnect_delay: Option<Duration>,
    #[serde(default, deserialize_with = "seconds")]
    timeout: Option<Option<Duration>>,
    #[serde(default, deserialize_with = "text")]
    machine: Option<Option<String>>,
    #[serde(default, deserialize_with = "tag_list")]
    tags: Option<Option<Vec<String>>>,
    #[serde(default)]
    min_ratio: Option<f64>,
    #[serde(default, deserialize_with = "count")]
    max_dead_boards: Option<Option<u32>>,
    #[serde(default, deserialize_with = "count")]
    max_dead_links: Option<Option<u32>>,
    #[serde(default)]
    require_torus: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    spalloc: Option<ConfigOverlay>,
}

/// A value that may be replaced by the literal `"None"`.
#[derive(Deserialize)]
#[serde(untagged)]
enum Nullable<T> {
    Value(T),
    Text(String),
}

fn nullable<'de, D, T>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    match Nullable::<T>::deserialize(deserializer)? {
        Nullable::Value(value) => Ok(Some(Some(value))),
        Nullable::Text(text) if text == "None" => Ok(Some(None)),
        Nullable::Text(text) => Err(serde::de::Error::custom(format!(
            "expected a value or \"None\", found \"{text}\""
        ))),
    }
}

fn duration<E: serde::de::Error>(secs: f64) -> std::result::Result<Duration, E> {
    Duration::try_from_secs_f64(secs).map_err(|_| {
        E::custom(format!(
            "expected a non-negative number of seconds, found {secs}"
        ))
    })
}

fn seconds<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<Option<Duration>>, D::Error> {
    let value: Option<Option<f64>> = nullable(deserializer)?;
    Ok(match value {
        Some(Some(secs)) => Some(Some(duration(secs)?)),
        Some(None) => Some(None),
        None => None,
    })
}

fn delay<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error> {
    duration(f64::deserialize(deserializer)?).map(Some)
}

fn count<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<Option<u32>>, D::Error> {
    nullable(deserializer)
}

fn text<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<Option<String>>, D::Error> {
    let value = String::deserialize(deserializer)?;
    Ok(Some((value != "None").then_some(value)))
}

/// Tags as a TOML array or a comma separated string.
fn tag_list<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<Option<Vec<String>>>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Tags {
        List(Vec<String>),
        Text(String),
    }
    Ok(Some(match Tags::deserialize(deserializer)? {
        Tags::List(tags) => Some(tags),
        Tags::Text(text) if text == "None" => None,
        Tags::Text(text) => Some(
            text.split(',')
                .map(str::trim)
                .filter(|tag| !tag.is_empty())
                .map(str::to_string)
                .collect(),
        ),
    }))
}

impl Config {
    /// Standard config file locations, lowest priority first.
    pub fn search_path() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/xdg").join(APP_NAME)];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join(APP_NAME));
        }
        paths.push(PathBuf::from(format!(".{APP_NAME}")));
        paths
    }

    /// Load configuration from the standard search path.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::search_path())
    }

    /// Load configuration from `paths`, later files taking priority.
    pub fn load_from<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut config = Config::default();
        for path in paths {
            let path = path.as_ref();
            let content = match fs::read_to_string(path) {
                Ok(content) => content,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(SpallocError::Config(format!(
                        "Failed to read '{}': {}",
                        path.display(),
                        e
                    )))
                }
            };
            config.apply_toml(&content).map_err(|e| match e {
                SpallocError::Config(message) => {
                    SpallocError::Config(format!("{}: {}", path.display(), message))
                }
                other => other,
            })?;
            debug!("Loaded configuration from {}", path.display());
        }
        Ok(config)
    }

    /// Parse one TOML document and apply it on top of `self`.
    pub fn apply_toml(&mut self, content: &str) -> Result<()> {
        let file: ConfigFile = toml::from_str(content)
            .map_err(|e| SpallocError::Config(format!("Invalid configuration: {}", e)))?;
        if let Some(overlay) = file.spalloc {
            self.apply(overlay);
        }
        Ok(())
    }

    fn apply(&mut self, overlay: ConfigOverlay) {
        if let Some(hostname) = overlay.hostname {
            self.hostname = hostname;
        }
        if let Some(port) = overlay.port {
            self.port = port;
        }
        if let Some(owner) = overlay.owner {
            self.owner = owner;
        }
        if let Some(keepalive) = overlay.keepalive {
            self.keepalive = keepalive;
        }
        if let Some(delay) = overlay.reconnect_delay {
            self.reconnect_delay = delay;
        }
        if let Some(timeout) = overlay.timeout {
            self.timeout = timeout;
        }
        if let Some(machine) = overlay.machine {
            self.machine = machine;
        }
        if let Some(tags) = overlay.tags {
            self.tags = tags;
        }
        if let Some(min_ratio) = overlay.min_ratio {
            self.min_ratio = min_ratio;
        }
        if let Some(max_dead_boards) = overlay.max_dead_boards {
            self.max_dead_boards = max_dead_boards;
        }
        if let Some(max_dead_links) = overlay.max_dead_links {
            self.max_dead_links = max_dead_links;
        }
        if let Some(require_torus) = overlay.require_torus {
            self.require_torus = require_torus;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 22244);
        assert_eq!(config.keepalive, Some(Duration::from_secs(60)));
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.max_dead_boards, Some(0));
        assert_eq!(config.max_dead_links, None);
        assert!(!config.require_torus);
    }

    #[test]
    fn test_later_files_override_earlier_ones() {
        let temp_dir = TempDir::new().unwrap();
        let site = temp_dir.path().join("site");
        let user = temp_dir.path().join("user");
        let missing = temp_dir.path().join("missing");

        fs::write(
            &site,
            r#"
[spalloc]
hostname = "site.example.com"
port = 1234
keepalive = 30
tags = "default, fast"
"#,
        )
        .unwrap();
        fs::write(
            &user,
            r#"
[spalloc]
hostname = "user.example.com"
owner = "me"
keepalive = "None"
timeout = 2.5
max_dead_boards = "None"
"#,
        )
        .unwrap();

        let config = Config::load_from(&[site, missing, user]).unwrap();
        assert_eq!(config.hostname.as_deref(), Some("user.example.com"));
        assert_eq!(config.port, 1234);
        assert_eq!(config.owner.as_deref(), Some("me"));
        assert_eq!(config.keepalive, None);
        assert_eq!(config.timeout, Some(Duration::from_millis(2500)));
        assert_eq!(
            config.tags,
            Some(vec!["default".to_string(), "fast".to_string()])
        );
        assert_eq!(config.max_dead_boards, None);
    }

    #[test]
    fn test_none_string_clears_text_settings() {
        let mut config = Config::default();
        config
            .apply_toml("[spalloc]\nmachine = \"m1\"\ntags = [\"a\"]")
            .unwrap();
        assert_eq!(config.machine.as_deref(), Some("m1"));

        config
            .apply_toml("[spalloc]\nmachine = \"None\"\ntags = \"None\"")
            .unwrap();
        assert_eq!(config.machine, None);
        assert_eq!(config.tags, None);
    }

    #[test]
    fn test_file_without_spalloc_table_is_ignored() {
        let mut config = Config::default();
        config.apply_toml("[other]\nkey = 1").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_invalid_files_are_errors() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broken");
        fs::write(&path, "[spalloc]\nport = \"not a port\"").unwrap();

        let err = Config::load_from(&[&path]).unwrap_err();
        assert!(matches!(err, SpallocError::Config(_)));

        let mut config = Config::default();
        assert!(config.apply_toml("[spalloc]\nkeepalive = -1").is_err());
        assert!(config.apply_toml("[spalloc]\nunknown_key = 1").is_err());
        assert!(config.apply_toml("[spalloc]\nmax_dead_links = \"lots\"").is_err());
    }

    #[test]
    fn test_out_of_range_durations_are_errors() {
        let mut config = Config::default();
        for content in [
            "[spalloc]\nkeepalive = 1e30",
            "[spalloc]\ntimeout = inf",
            "[spalloc]\nreconnect_delay = inf",
            "[spalloc]\nreconnect_delay = nan",
            "[spalloc]\nreconnect_delay = -2",
        ] {
            let err = config.apply_toml(content).unwrap_err();
            assert!(matches!(err, SpallocError::Config(_)), "{content}: {err:?}");
        }
        assert_eq!(config.keepalive, Some(Duration::from_secs(60)));
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));

        config.apply_toml("[spalloc]\nreconnect_delay = 0.5").unwrap();
        assert_eq!(config.reconnect_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_search_path_order() {
        let paths = Config::search_path();
        assert_eq!(paths.first(), Some(&PathBuf::from("/etc/xdg/spalloc")));
        assert_eq!(paths.last(), Some(&PathBuf::from(".spalloc")));
    }
}
