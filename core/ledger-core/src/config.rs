//! Runtime configuration, loaded once from TOML at startup.
//!
//! The resulting `TrackerConfig` is immutable and handed by reference to the
//! source, filter, and scheduler.

use encoding_rs::Encoding;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{LedgerError, Result};

const DEFAULT_DATA_DIR: &str = ".logon-ledger";
const DEFAULT_CONFIG_FILE: &str = "config.toml";
const DEFAULT_DB_FILE: &str = "sessions.db";
/// Upper bound for `poll_interval_secs` and `fetch_timeout_secs` (one day).
pub const MAX_DURATION_SECS: u64 = 86_400;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    #[default]
    Table,
    Json,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SourceConfig {
    #[serde(default = "default_command")]
    pub command: String,
    /// Arguments; `{host}` is replaced with the polled host name.
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub format: SourceFormat,
    #[serde(default = "default_logon_time_format")]
    pub logon_time_format: String,
    /// Number of whitespace-separated tokens making up the logon time column.
    #[serde(default = "default_logon_time_tokens")]
    pub logon_time_tokens: usize,
    /// Encoding label of the command output, e.g. `utf-8` or `ibm866`
    /// for a console running the OEM Cyrillic codepage.
    #[serde(default = "default_encoding")]
    pub encoding: String,
    /// Output beyond this many bytes on either stream fails the fetch.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: default_args(),
            format: SourceFormat::default(),
            logon_time_format: default_logon_time_format(),
            logon_time_tokens: default_logon_time_tokens(),
            encoding: default_encoding(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

impl SourceConfig {
    /// Resolves `encoding` through the WHATWG label table.
    pub fn output_encoding(&self) -> Option<&'static Encoding> {
        Encoding::for_label(self.encoding.trim().as_bytes())
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            max_files: default_max_log_files(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TrackerConfig {
    pub hosts: Vec<String>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_ignored_users")]
    pub ignored_users: Vec<String>,
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TrackerConfig {
    pub fn for_hosts(hosts: &[&str]) -> Self {
        Self {
            hosts: hosts.iter().map(|host| host.to_string()).collect(),
            poll_interval_secs: default_poll_interval_secs(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            ignored_users: default_ignored_users(),
            database_path: None,
            source: SourceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Lower-cased ignore set; account names compare case-insensitively.
    pub fn ignore_set(&self) -> BTreeSet<String> {
        self.ignored_users
            .iter()
            .map(|name| name.trim().to_lowercase())
            .filter(|name| !name.is_empty())
            .collect()
    }

    pub fn resolved_database_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(path) => expand_home(path),
            None => Ok(default_data_dir()?.join(DEFAULT_DB_FILE)),
        }
    }

    pub fn resolved_log_directory(&self) -> Result<Option<PathBuf>> {
        self.logging
            .directory
            .as_deref()
            .map(expand_home)
            .transpose()
    }

    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(LedgerError::ConfigInvalid(
                "at least one host is required".to_string(),
            ));
        }
        let mut seen = BTreeSet::new();
        for host in &self.hosts {
            if host.trim().is_empty() {
                return Err(LedgerError::ConfigInvalid(
                    "host names must not be empty".to_string(),
                ));
            }
            if !seen.insert(host.as_str()) {
                return Err(LedgerError::ConfigInvalid(format!(
                    "duplicate host: {}",
                    host
                )));
            }
        }
        if self.poll_interval_secs == 0 || self.poll_interval_secs > MAX_DURATION_SECS {
            return Err(LedgerError::ConfigInvalid(format!(
                "poll_interval_secs must be between 1 and {}",
                MAX_DURATION_SECS
            )));
        }
        if self.fetch_timeout_secs == 0 || self.fetch_timeout_secs > MAX_DURATION_SECS {
            return Err(LedgerError::ConfigInvalid(format!(
                "fetch_timeout_secs must be between 1 and {}",
                MAX_DURATION_SECS
            )));
        }
        if self.source.command.trim().is_empty() {
            return Err(LedgerError::ConfigInvalid(
                "source.command must not be empty".to_string(),
            ));
        }
        if self.source.logon_time_tokens == 0 {
            return Err(LedgerError::ConfigInvalid(
                "source.logon_time_tokens must be at least 1".to_string(),
            ));
        }
        if self.source.output_encoding().is_none() {
            return Err(LedgerError::ConfigInvalid(format!(
                "unknown source.encoding: {}",
                self.source.encoding
            )));
        }
        if self.source.max_output_bytes == 0 {
            return Err(LedgerError::ConfigInvalid(
                "source.max_output_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn default_data_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or(LedgerError::HomeDirNotFound)?;
    Ok(home.join(DEFAULT_DATA_DIR))
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(default_data_dir()?.join(DEFAULT_CONFIG_FILE))
}

/// Reads and validates the configuration file.
pub fn load_config(path: Option<PathBuf>) -> Result<TrackerConfig> {
    let config_path = match path {
        Some(path) => expand_home(&path)?,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Err(LedgerError::ConfigNotFound(config_path));
    }

    let content = fs_err::read_to_string(&config_path).map_err(|source| LedgerError::Io {
        context: format!("Failed to read config {}", config_path.display()),
        source,
    })?;
    let config = parse_config(&content, &config_path)?;
    config.validate()?;
    Ok(config)
}

fn parse_config(content: &str, path: &Path) -> Result<TrackerConfig> {
    toml::from_str::<TrackerConfig>(content).map_err(|err| LedgerError::ConfigMalformed {
        path: path.to_path_buf(),
        details: err.to_string(),
    })
}

fn expand_home(path: &Path) -> Result<PathBuf> {
    match path.strip_prefix("~") {
        Ok(rest) => {
            let home = dirs::home_dir().ok_or(LedgerError::HomeDirNotFound)?;
            Ok(home.join(rest))
        }
        Err(_) => Ok(path.to_path_buf()),
    }
}

fn default_command() -> String {
    "quser".to_string()
}

fn default_args() -> Vec<String> {
    vec!["/server:{host}".to_string()]
}

fn default_logon_time_format() -> String {
    "%d.%m.%Y %H:%M".to_string()
}

fn default_logon_time_tokens() -> usize {
    2
}

fn default_encoding() -> String {
    "utf-8".to_string()
}

fn default_max_output_bytes() -> u64 {
    1024 * 1024
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_ignored_users() -> Vec<String> {
    vec!["admin".to_string()]
}

fn default_max_log_files() -> usize {
    2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_config_reports_missing_file() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("missing.toml");
        let err = load_config(Some(path.clone())).expect_err("missing file");
        assert!(matches!(err, LedgerError::ConfigNotFound(p) if p == path));
    }

    #[test]
    fn load_config_applies_defaults() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(&path, r#"hosts = ["server1", "server2"]"#).expect("write config");

        let config = load_config(Some(path)).expect("load config");
        assert_eq!(config.hosts, vec!["server1", "server2"]);
        assert_eq!(config.poll_interval_secs, 60);
        assert_eq!(config.fetch_timeout_secs, 30);
        assert_eq!(config.ignored_users, vec!["admin"]);
        assert_eq!(config.source, SourceConfig::default());
        assert_eq!(config.source.args, vec!["/server:{host}"]);
        assert!(config.logging.directory.is_none());
    }

    #[test]
    fn load_config_parses_all_sections() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(
            &path,
            r#"
hosts = ["ts01"]
poll_interval_secs = 120
fetch_timeout_secs = 5
ignored_users = ["Administrator", "svc_backup"]
database_path = "/var/lib/ledger/sessions.db"

[source]
command = "ssh"
args = ["{host}", "quser"]
format = "json"
logon_time_format = "%m/%d/%Y %I:%M %p"
logon_time_tokens = 3

[logging]
directory = "/var/log/ledger"
max_files = 7
"#,
        )
        .expect("write config");

        let config = load_config(Some(path)).expect("load config");
        assert_eq!(config.poll_interval(), Duration::from_secs(120));
        assert_eq!(config.fetch_timeout(), Duration::from_secs(5));
        assert_eq!(config.source.command, "ssh");
        assert_eq!(config.source.format, SourceFormat::Json);
        assert_eq!(config.source.logon_time_tokens, 3);
        assert_eq!(
            config.resolved_database_path().expect("db path"),
            PathBuf::from("/var/lib/ledger/sessions.db")
        );
        assert_eq!(
            config.resolved_log_directory().expect("log dir"),
            Some(PathBuf::from("/var/log/ledger"))
        );
        assert_eq!(config.logging.max_files, 7);
        assert!(config.ignore_set().contains("administrator"));
    }

    #[test]
    fn load_config_rejects_malformed_toml() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(&path, "hosts = [").expect("write config");

        let err = load_config(Some(path)).expect_err("malformed");
        assert!(matches!(err, LedgerError::ConfigMalformed { .. }));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = TrackerConfig::for_hosts(&[]);
        assert!(config.validate().is_err());

        config = TrackerConfig::for_hosts(&["a", "a"]);
        assert!(config.validate().is_err());

        config = TrackerConfig::for_hosts(&["a"]);
        config.poll_interval_secs = 0;
        assert!(config.validate().is_err());

        config = TrackerConfig::for_hosts(&["a"]);
        config.fetch_timeout_secs = 0;
        assert!(config.validate().is_err());

        config = TrackerConfig::for_hosts(&["a"]);
        config.source.logon_time_tokens = 0;
        assert!(config.validate().is_err());

        config = TrackerConfig::for_hosts(&["a"]);
        config.source.encoding = "klingon".to_string();
        assert!(config.validate().is_err());

        config = TrackerConfig::for_hosts(&["a"]);
        config.source.max_output_bytes = 0;
        assert!(config.validate().is_err());

        config = TrackerConfig::for_hosts(&["a", "b"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_caps_durations_at_one_day() {
        let mut config = TrackerConfig::for_hosts(&["a"]);
        config.poll_interval_secs = u64::MAX;
        assert!(config.validate().is_err());

        config = TrackerConfig::for_hosts(&["a"]);
        config.fetch_timeout_secs = MAX_DURATION_SECS + 1;
        assert!(config.validate().is_err());

        config = TrackerConfig::for_hosts(&["a"]);
        config.poll_interval_secs = MAX_DURATION_SECS;
        config.fetch_timeout_secs = MAX_DURATION_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn source_encoding_accepts_oem_codepage_labels() {
        let mut source = SourceConfig::default();
        assert_eq!(source.output_encoding(), Some(encoding_rs::UTF_8));

        source.encoding = "ibm866".to_string();
        assert_eq!(source.output_encoding(), Some(encoding_rs::IBM866));

        source.encoding = "cp866".to_string();
        assert_eq!(source.output_encoding(), Some(encoding_rs::IBM866));
    }
}
