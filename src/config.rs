//! Configuration file loading and source discovery.
//!
//! The configuration is a JSON document, by default `./log_files.json`:
//!
//! ```json
//! {
//!   "logFilesGlob": ["/var/log/app/*.log"],
//!   "logFiles": [{ "logName": "sys log", "logPath": "/var/log/syslog" }],
//!   "listen": "127.0.0.1:8888",
//!   "historyLines": 20,
//!   "allowedOrigins": ["http://127.0.0.1:5500"],
//!   "secret": null,
//!   "log": { "level": "info", "format": "console" }
//! }
//! ```
//!
//! Every field is optional, but at least one source has to be found.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::net::{AddrParseError, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::logging::LogConfig;
use crate::source::endpoint_for;

pub const DEFAULT_CONFIG_PATH: &str = "./log_files.json";
pub const DEFAULT_LISTEN: &str = "127.0.0.1:8888";
pub const DEFAULT_HISTORY_LINES: usize = 20;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;
pub const DEFAULT_PUBLISH_BUFFER: usize = 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid listen address {addr:?}: {source}")]
    InvalidListen {
        addr: String,
        #[source]
        source: AddrParseError,
    },
    #[error("no log files matched the configuration")]
    NoSources,
}

/// A file listed explicitly, under a chosen name.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StaticSource {
    pub log_name: String,
    pub log_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Glob patterns; every matching file becomes a source named after the
    /// file.
    pub log_files_glob: Vec<String>,
    /// Explicitly named files.
    pub log_files: Vec<StaticSource>,
    pub listen: String,
    /// Lines of history replayed to a joining subscriber.
    pub history_lines: usize,
    /// Origins allowed by CORS. Empty allows any origin.
    pub allowed_origins: Vec<String>,
    /// Shared secret required from clients, if set.
    pub secret: Option<String>,
    /// Fallback re-check interval for followed files.
    pub poll_interval_ms: u64,
    /// Lines a subscriber may fall behind before it is disconnected.
    pub subscriber_buffer: usize,
    /// Lines a source's tailer may run ahead of its broadcaster.
    pub publish_buffer: usize,
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_files_glob: Vec::new(),
            log_files: Vec::new(),
            listen: DEFAULT_LISTEN.to_string(),
            history_lines: DEFAULT_HISTORY_LINES,
            allowed_origins: Vec::new(),
            secret: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            publish_buffer: DEFAULT_PUBLISH_BUFFER,
            log: LogConfig::default(),
        }
    }
}

/// A file to follow and the name it is published under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    pub name: String,
    pub path: PathBuf,
}

impl SourceSpec {
    /// Names the source after the file's base name, extension stripped.
    pub fn from_path(path: impl Into<PathBuf>) -> Option<Self> {
        let path = path.into();
        let name = path.file_stem()?.to_string_lossy().into_owned();
        Some(SourceSpec { name, path })
    }

    pub fn endpoint(&self) -> String {
        endpoint_for(&self.name)
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen
            .parse()
            .map_err(|source| ConfigError::InvalidListen {
                addr: self.listen.clone(),
                source,
            })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// The secret, treating an empty string as unset.
    pub fn secret(&self) -> Option<&str> {
        self.secret.as_deref().filter(|s| !s.is_empty())
    }

    /// Resolves the configured files into sources.
    ///
    /// Explicit `logFiles` come first, then glob matches in pattern order.
    /// Duplicate patterns are expanded once, a file matched twice is kept
    /// once, and a source whose endpoint is already taken is skipped with a
    /// warning, as is an invalid pattern.
    pub fn sources(&self) -> Result<Vec<SourceSpec>, ConfigError> {
        let mut specs = Vec::new();
        let mut seen_paths = HashSet::new();
        let mut seen_endpoints = HashSet::new();

        let mut push = |spec: SourceSpec| {
            let key = spec
                .path
                .canonicalize()
                .unwrap_or_else(|_| spec.path.clone());
            if !seen_paths.insert(key) {
                return;
            }
            if !seen_endpoints.insert(spec.endpoint()) {
                warn!(
                    name = %spec.name,
                    path = %spec.path.display(),
                    "another source already uses this name, skipping"
                );
                return;
            }
            specs.push(spec);
        };

        for file in &self.log_files {
            push(SourceSpec {
                name: file.log_name.clone(),
                path: file.log_path.clone(),
            });
        }

        let mut seen_patterns = HashSet::new();
        for pattern in &self.log_files_glob {
            if !seen_patterns.insert(pattern.as_str()) {
                continue;
            }

            let paths = match glob::glob(pattern) {
                Ok(paths) => paths,
                Err(e) => {
                    warn!(pattern = %pattern, error = %e, "skipping invalid glob pattern");
                    continue;
                }
            };

            for entry in paths {
                let path = match entry {
                    Ok(path) => path,
                    Err(e) => {
                        warn!(pattern = %pattern, error = %e, "skipping unreadable match");
                        continue;
                    }
                };
                if path.is_dir() {
                    continue;
                }
                if let Some(spec) = SourceSpec::from_path(path) {
                    push(spec);
                }
            }
        }

        if specs.is_empty() {
            return Err(ConfigError::NoSources);
        }

        Ok(specs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{LogFormat, LogLevel};
    use tempfile::tempdir;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, b"").unwrap();
        path
    }

    #[test]
    fn test_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.history_lines, 20);
        assert_eq!(config.listen, DEFAULT_LISTEN);
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert!(config.secret().is_none());
        assert!(config.listen_addr().is_ok());
        assert_eq!(config.log.level, LogLevel::Info);
    }

    #[test]
    fn test_parse_full() {
        let config: Config = serde_json::from_str(
            r#"{
                "logFilesGlob": ["/var/log/*.log"],
                "logFiles": [{ "logName": "sys log", "logPath": "/var/log/syslog" }],
                "listen": "0.0.0.0:6666",
                "historyLines": 5,
                "allowedOrigins": ["http://127.0.0.1:5500"],
                "secret": "",
                "log": { "level": "debug", "format": "json" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.log_files_glob, ["/var/log/*.log"]);
        assert_eq!(
            config.log_files,
            [StaticSource {
                log_name: "sys log".into(),
                log_path: "/var/log/syslog".into()
            }]
        );
        assert_eq!(config.history_lines, 5);
        assert_eq!(config.listen_addr().unwrap().port(), 6666);
        assert!(config.secret().is_none());
        assert_eq!(config.log.format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_listen() {
        let config = Config {
            listen: "localhost".into(),
            ..Config::default()
        };
        assert!(matches!(
            config.listen_addr(),
            Err(ConfigError::InvalidListen { .. })
        ));
    }

    #[test]
    fn test_load_errors() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            Config::load(dir.path().join("missing.json")),
            Err(ConfigError::Read { .. })
        ));

        let bad = dir.path().join("bad.json");
        fs::write(&bad, b"{ not json").unwrap();
        assert!(matches!(Config::load(&bad), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_source_name_from_path() {
        let spec = SourceSpec::from_path("/var/log/my app.log").unwrap();
        assert_eq!(spec.name, "my app");
        assert_eq!(spec.endpoint(), "my-app");

        let spec = SourceSpec::from_path("/var/log/app.log.1").unwrap();
        assert_eq!(spec.name, "app.log");
    }

    #[test]
    fn test_glob_expansion_dedups() {
        let dir = tempdir().unwrap();
        let a = touch(dir.path(), "a.log");
        let b = touch(dir.path(), "b.log");
        touch(dir.path(), "c.txt");
        fs::create_dir(dir.path().join("d.log")).unwrap();

        let pattern = format!("{}/*.log", dir.path().display());
        let config = Config {
            log_files_glob: vec![pattern.clone(), pattern.clone(), "[".into()],
            log_files: vec![StaticSource {
                log_name: "first".into(),
                log_path: a.clone(),
            }],
            ..Config::default()
        };

        let specs = config.sources().unwrap();
        assert_eq!(
            specs,
            [
                SourceSpec {
                    name: "first".into(),
                    path: a
                },
                SourceSpec {
                    name: "b".into(),
                    path: b
                },
            ]
        );
    }

    #[test]
    fn test_same_file_spelled_differently_is_kept_once() {
        let dir = tempdir().unwrap();
        let a = touch(dir.path(), "a.log");
        fs::create_dir(dir.path().join("sub")).unwrap();

        let config = Config {
            log_files_glob: vec![format!("{}/*.log", dir.path().display())],
            log_files: vec![StaticSource {
                log_name: "dotted".into(),
                log_path: dir.path().join("sub").join("..").join("a.log"),
            }],
            ..Config::default()
        };

        let specs = config.sources().unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "dotted");
        assert_ne!(specs[0].path, a);
    }

    #[test]
    fn test_name_collision_keeps_first() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("x")).unwrap();
        fs::create_dir(dir.path().join("y")).unwrap();
        let first = touch(&dir.path().join("x"), "app.log");
        touch(&dir.path().join("y"), "app.log");

        let config = Config {
            log_files_glob: vec![format!("{}/*/app.log", dir.path().display())],
            ..Config::default()
        };

        let specs = config.sources().unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].path, first);
    }

    #[test]
    fn test_no_sources() {
        let dir = tempdir().unwrap();
        let config = Config {
            log_files_glob: vec![format!("{}/*.log", dir.path().display())],
            ..Config::default()
        };
        assert!(matches!(config.sources(), Err(ConfigError::NoSources)));
    }
}
