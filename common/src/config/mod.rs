use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::err::{ReplicationError, Result};

/// Replication stream configuration.
///
/// `gtid_start` accepts "", "newest", "oldest" or a comma-separated GTID
/// list; anything else is treated as a GTID list and validated at parse
/// time by the replication side.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplicationConfig {
    #[serde(default = "default_server_id")]
    pub server_id: u32,

    #[serde(default)]
    pub gtid_start: String,

    #[serde(default = "default_statedir")]
    pub statedir: PathBuf,

    /// Only process tables whose `db.table` matches.
    #[serde(default, rename = "match")]
    pub match_pattern: Option<String>,

    /// Skip tables whose `db.table` matches.
    #[serde(default)]
    pub exclude: Option<String>,

    /// Upstream connect and read timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Yield to a peer instance that holds the cluster lead.
    #[serde(default)]
    pub cooperate: bool,
}

fn default_server_id() -> u32 {
    1234
}

fn default_statedir() -> PathBuf {
    PathBuf::from(".")
}

fn default_timeout() -> u64 {
    10
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        ReplicationConfig {
            server_id: default_server_id(),
            gtid_start: String::new(),
            statedir: default_statedir(),
            match_pattern: None,
            exclude: None,
            timeout: default_timeout(),
            cooperate: false,
        }
    }
}

/// Per-service configuration of the protocol bridge.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    #[serde(default)]
    pub auto_create_tables: bool,

    #[serde(default)]
    pub auto_create_databases: bool,

    /// Length of the computed `id` VARCHAR column.
    #[serde(default = "default_id_column_length")]
    pub id_column_length: i64,

    #[serde(default)]
    pub log_input: bool,

    #[serde(default)]
    pub log_output: bool,

    #[serde(default)]
    pub authenticate: bool,

    #[serde(default)]
    pub authorize: bool,

    /// Enable the response cache.
    #[serde(default)]
    pub cache: bool,
}

fn default_id_column_length() -> i64 {
    35
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            auto_create_tables: false,
            auto_create_databases: false,
            id_column_length: default_id_column_length(),
            log_input: false,
            log_output: false,
            authenticate: false,
            authorize: false,
            cache: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub replication: ReplicationConfig,

    #[serde(default)]
    pub bridge: BridgeConfig,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path)?;
        Config::from_str(&text)
    }

    pub fn from_str(text: &str) -> Result<Config> {
        toml::from_str(text).map_err(|e| ReplicationError::Config(e.to_string()))
    }

    /// Compile the match/exclude options, surfacing bad patterns early.
    pub fn compile_filters(&self) -> Result<(Option<regex::Regex>, Option<regex::Regex>)> {
        let compile = |src: &Option<String>| -> Result<Option<regex::Regex>> {
            match src {
                Some(s) => regex::Regex::new(s)
                    .map(Some)
                    .map_err(|e| ReplicationError::Config(format!("bad pattern '{}': {}", s, e))),
                None => Ok(None),
            }
        };

        Ok((
            compile(&self.replication.match_pattern)?,
            compile(&self.replication.exclude)?,
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::from_str("").unwrap();
        assert_eq!(config.replication.server_id, 1234);
        assert_eq!(config.replication.timeout, 10);
        assert_eq!(config.replication.statedir, PathBuf::from("."));
        assert_eq!(config.bridge.id_column_length, 35);
        assert!(!config.bridge.auto_create_tables);
    }

    #[test]
    fn full_file() {
        let text = r#"
            [replication]
            server_id = 3000
            gtid_start = "newest"
            statedir = "/var/lib/maxbridge"
            match = "^test\\."
            exclude = "\\.hidden$"
            timeout = 30
            cooperate = true

            [bridge]
            auto_create_tables = true
            id_column_length = 64
            cache = true
        "#;

        let config = Config::from_str(text).unwrap();
        assert_eq!(config.replication.server_id, 3000);
        assert_eq!(config.replication.gtid_start, "newest");
        assert!(config.replication.cooperate);
        assert!(config.bridge.auto_create_tables);
        assert_eq!(config.bridge.id_column_length, 64);

        let (m, e) = config.compile_filters().unwrap();
        assert!(m.unwrap().is_match("test.t1"));
        assert!(e.unwrap().is_match("db.hidden"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Config::from_str("[replication]\nbogus = 1\n").is_err());
    }

    #[test]
    fn bad_pattern_is_a_config_error() {
        let text = "[replication]\nmatch = \"(\"\n";
        let config = Config::from_str(text).unwrap();
        assert!(config.compile_filters().is_err());
    }
}
