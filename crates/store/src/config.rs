//! The service configuration record. Keys are enumerated explicitly;
//! unknown keys are rejected rather than silently carried. Only
//! `request-timeout` and `max-mgo-sessions` change the core's behavior;
//! the remaining keys are forwarded to collaborators at the boundary.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config file {path}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// Location of the document database.
    pub mongo_url: PathBuf,
    #[serde(default)]
    pub api_addr: Option<String>,
    #[serde(default)]
    pub auth_username: Option<String>,
    #[serde(default)]
    pub auth_password: Option<String>,
    #[serde(default)]
    pub identity_location: Option<String>,
    #[serde(default)]
    pub identity_public_key: Option<String>,
    #[serde(default)]
    pub audit_log_file: Option<PathBuf>,
    /// Megabytes before the audit log rotates.
    #[serde(default)]
    pub audit_log_max_size: Option<u64>,
    /// Days an audit log file is retained.
    #[serde(default)]
    pub audit_log_max_age: Option<u64>,
    #[serde(default, with = "humantime_serde")]
    pub stats_cache_max_age: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub search_cache_max_age: Option<Duration>,
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
    #[serde(default = "default_max_sessions")]
    pub max_mgo_sessions: usize,
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_sessions() -> usize {
    100
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let body = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_slice(&body).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_full_config() {
        let config: Config = serde_yaml::from_str(
            r#"
mongo-url: /var/lib/charmstore/db
api-addr: "localhost:8080"
auth-username: admin
auth-password: secret
identity-location: https://identity.example.com
identity-public-key: deadbeef
audit-log-file: /var/log/charmstore/audit.log
audit-log-max-size: 500
audit-log-max-age: 30
stats-cache-max-age: 1h
search-cache-max-age: 15m
request-timeout: 45s
max-mgo-sessions: 250
"#,
        )
        .unwrap();
        assert_eq!(config.mongo_url, PathBuf::from("/var/lib/charmstore/db"));
        assert_eq!(config.request_timeout, Duration::from_secs(45));
        assert_eq!(config.max_mgo_sessions, 250);
        assert_eq!(config.stats_cache_max_age, Some(Duration::from_secs(3600)));
        assert_eq!(config.audit_log_max_size, Some(500));
    }

    #[test]
    fn defaults_apply() {
        let config: Config = serde_yaml::from_str("mongo-url: /tmp/db\n").unwrap();
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.max_mgo_sessions, 100);
        assert_eq!(config.api_addr, None);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(serde_yaml::from_str::<Config>("mongo-url: /tmp/db\nmystery: 1\n").is_err());
    }
}
