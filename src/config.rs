//! Host and directory configuration.
//!
//! `HOST_CONFIG`/`DIR_CONFIG` parsing itself lives with the daemon wiring
//! (out of scope, per the design notes); this module only owns the
//! resolved values the core's operations are parameterized by, loaded from
//! TOML the same way the pack's remote-filesystem client loads its own
//! config: `toml::from_str` into a `#[derive(Deserialize)]` struct with a
//! documented `Default`.

use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::auth::AuthType;
use crate::auth::sigv4::ListingVersion;
use crate::wire::TlsVerifyMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relation {
    LessThan,
    Equal,
    GreaterThan,
}

impl Relation {
    pub fn holds(self, lhs: i64, rhs: i64) -> bool {
        match self {
            Relation::LessThan => lhs < rhs,
            Relation::Equal => lhs == rhs,
            Relation::GreaterThan => lhs > rhs,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SizeFilter {
    pub relation: Relation,
    pub ignore_size: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeFilter {
    pub relation: Relation,
    pub ignore_file_time: i64,
}

/// Sentinel for `unknown_file_time`: delete unknown files as soon as seen.
pub const DELETE_UNKNOWN_IMMEDIATELY: i64 = -2;

#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    pub hostname: String,
    pub port: u16,
    #[serde(default)]
    pub http_proxy: Option<String>,
    #[serde(default = "default_transfer_timeout_secs")]
    pub transfer_timeout_secs: u64,
    #[serde(default)]
    pub tls_auth: TlsVerifyMode,
    #[serde(default)]
    pub allow_legacy_renegotiation: bool,
    #[serde(default)]
    pub auth_type: AuthType,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub aws_access_key_id: Option<String>,
    #[serde(default)]
    pub aws_secret_access_key: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_service")]
    pub service: String,
    #[serde(default)]
    pub sigv4_listing_version: ListingVersion,
}

fn default_transfer_timeout_secs() -> u64 {
    120
}

fn default_region() -> String {
    "us-east-1".to_owned()
}

fn default_service() -> String {
    "s3".to_owned()
}

impl HostConfig {
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            hostname: String::new(),
            port: 443,
            http_proxy: None,
            transfer_timeout_secs: default_transfer_timeout_secs(),
            tls_auth: TlsVerifyMode::Strict,
            allow_legacy_renegotiation: false,
            auth_type: AuthType::None,
            user: None,
            password: None,
            aws_access_key_id: None,
            aws_secret_access_key: None,
            region: default_region(),
            service: default_service(),
            sigv4_listing_version: ListingVersion::V2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryConfig {
    pub remote_path: String,
    #[serde(default)]
    pub file_masks: Vec<String>,
    #[serde(default)]
    pub negate_masks: Vec<String>,
    #[serde(default)]
    pub size_filter: Option<SizeFilter>,
    #[serde(default)]
    pub time_filter: Option<TimeFilter>,
    #[serde(default = "default_max_copied_files")]
    pub max_copied_files: u32,
    #[serde(default = "default_max_copied_file_size")]
    pub max_copied_file_size: u64,
    #[serde(default)]
    pub delete_unknown_files: bool,
    #[serde(default = "default_unknown_file_time")]
    pub unknown_file_time: i64,
    #[serde(default)]
    pub keep_history_mode: bool,
    #[serde(default)]
    pub append_only: bool,
    #[serde(default)]
    pub allow_dotfiles: bool,
}

fn default_max_copied_files() -> u32 {
    1000
}

fn default_max_copied_file_size() -> u64 {
    u64::MAX
}

fn default_unknown_file_time() -> i64 {
    3600
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        DirectoryConfig {
            remote_path: "/".to_owned(),
            file_masks: vec!["*".to_owned()],
            negate_masks: Vec::new(),
            size_filter: None,
            time_filter: None,
            max_copied_files: default_max_copied_files(),
            max_copied_file_size: default_max_copied_file_size(),
            delete_unknown_files: false,
            unknown_file_time: default_unknown_file_time(),
            keep_history_mode: false,
            append_only: false,
            allow_dotfiles: false,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Read(std::io::Error),
    Parse(toml::de::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read(e) => write!(f, "failed to read config file: {e}"),
            ConfigError::Parse(e) => write!(f, "failed to parse config file: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

pub fn load_host_config(path: &Path) -> std::result::Result<HostConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(ConfigError::Read)?;
    toml::from_str(&content).map_err(ConfigError::Parse)
}

pub fn load_directory_config(path: &Path) -> std::result::Result<DirectoryConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(ConfigError::Read)?;
    toml::from_str(&content).map_err(ConfigError::Parse)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relation_holds() {
        assert!(Relation::LessThan.holds(1, 2));
        assert!(Relation::Equal.holds(2, 2));
        assert!(Relation::GreaterThan.holds(3, 2));
        assert!(!Relation::GreaterThan.holds(2, 2));
    }

    #[test]
    fn host_config_parses_minimal_toml() {
        let toml_src = r#"
            hostname = "example.com"
            port = 443
        "#;
        let cfg: HostConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(cfg.hostname, "example.com");
        assert_eq!(cfg.region, "us-east-1");
        assert_eq!(cfg.transfer_timeout_secs, 120);
    }

    #[test]
    fn directory_config_defaults_budget() {
        let toml_src = r#"
            remote_path = "/incoming"
        "#;
        let cfg: DirectoryConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(cfg.max_copied_files, 1000);
        assert!(!cfg.delete_unknown_files);
    }
}
