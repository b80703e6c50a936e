//! Service configuration.
//!
//! Read from a TOML file, then overridden by `COMPILE_*` environment
//! variables, then by CLI flags. Every field has a default, so an empty or
//! missing file is a valid configuration.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 8081
//! dev_mode = false
//!
//! [limits]
//! max_concurrent_builds = 3
//! max_queue_backlog = 100
//! fetch_max_bytes = 52428800
//! fetch_max_objects = 10000
//!
//! [timeouts]
//! write_secs = 2
//! fetch_secs = 60
//! ping_interval_secs = 10
//! pong_secs = 20
//! instruction_secs = 5
//!
//! [storage]
//! backend = "local"
//! data_dir = "/var/lib/compile-server"
//! workspace_dir = "/srv/src"
//! cloud_url = "https://storage.example.com/compile"
//!
//! [compiler]
//! command = "gopherjs"
//! args = ["build", "-o", "{out}", "{src}"]
//! valid_extensions = [".go", ".jsgo.html", ".inc.js", ".md"]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::admission::AdmissionSettings;
use crate::cache::CacheSettings;
use crate::service::ws::ChannelSettings;

/// Which family of storage and fetch backends to wire up at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendMode {
    /// Local filesystem stores, sources read from a workspace directory.
    #[default]
    Local,
    /// HTTP object store, sources cloned with git.
    Cloud,
    /// In-process stores, sources read from a workspace directory.
    Memory,
}

impl std::fmt::Display for StorageBackendMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageBackendMode::Local => write!(f, "local"),
            StorageBackendMode::Cloud => write!(f, "cloud"),
            StorageBackendMode::Memory => write!(f, "memory"),
        }
    }
}

impl std::str::FromStr for StorageBackendMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(StorageBackendMode::Local),
            "cloud" => Ok(StorageBackendMode::Cloud),
            "memory" => Ok(StorageBackendMode::Memory),
            _ => bail!(
                "Invalid storage backend '{}'. Valid values: local, cloud, memory",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Permissive CORS for front-end development.
    #[serde(default)]
    pub dev_mode: bool,
    /// Write logs to daily-rolling files in this directory.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8081
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dev_mode: false,
            log_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsSection {
    /// Builds allowed to run at once.
    #[serde(default = "default_max_concurrent_builds")]
    pub max_concurrent_builds: usize,
    /// Requests allowed to wait for a slot; beyond this they are refused.
    #[serde(default = "default_max_queue_backlog")]
    pub max_queue_backlog: usize,
    #[serde(default = "default_fetch_max_bytes")]
    pub fetch_max_bytes: u64,
    #[serde(default = "default_fetch_max_objects")]
    pub fetch_max_objects: u64,
}

fn default_max_concurrent_builds() -> usize {
    3
}

fn default_max_queue_backlog() -> usize {
    100
}

fn default_fetch_max_bytes() -> u64 {
    50 * 1024 * 1024
}

fn default_fetch_max_objects() -> u64 {
    10_000
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_concurrent_builds: default_max_concurrent_builds(),
            max_queue_backlog: default_max_queue_backlog(),
            fetch_max_bytes: default_fetch_max_bytes(),
            fetch_max_objects: default_fetch_max_objects(),
        }
    }
}

/// Wall-clock bounds, all in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsSection {
    /// Static assets and artifacts.
    #[serde(default = "default_write_secs")]
    pub write_secs: u64,
    /// A single progress message.
    #[serde(default = "default_websocket_write_secs")]
    pub websocket_write_secs: u64,
    #[serde(default = "default_fetch_secs")]
    pub fetch_secs: u64,
    /// Remote revision lookup.
    #[serde(default = "default_list_secs")]
    pub list_secs: u64,
    #[serde(default = "default_compile_secs")]
    pub compile_secs: u64,
    #[serde(default = "default_storage_secs")]
    pub storage_secs: u64,
    #[serde(default = "default_page_secs")]
    pub page_secs: u64,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_pong_secs")]
    pub pong_secs: u64,
    #[serde(default = "default_instruction_secs")]
    pub instruction_secs: u64,
    #[serde(default = "default_shutdown_secs")]
    pub shutdown_secs: u64,
}

fn default_write_secs() -> u64 {
    2
}

fn default_websocket_write_secs() -> u64 {
    20
}

fn default_fetch_secs() -> u64 {
    60
}

fn default_list_secs() -> u64 {
    10
}

fn default_compile_secs() -> u64 {
    300
}

fn default_storage_secs() -> u64 {
    300
}

fn default_page_secs() -> u64 {
    5
}

fn default_ping_interval_secs() -> u64 {
    10
}

fn default_pong_secs() -> u64 {
    20
}

fn default_instruction_secs() -> u64 {
    5
}

fn default_shutdown_secs() -> u64 {
    5
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            write_secs: default_write_secs(),
            websocket_write_secs: default_websocket_write_secs(),
            fetch_secs: default_fetch_secs(),
            list_secs: default_list_secs(),
            compile_secs: default_compile_secs(),
            storage_secs: default_storage_secs(),
            page_secs: default_page_secs(),
            ping_interval_secs: default_ping_interval_secs(),
            pong_secs: default_pong_secs(),
            instruction_secs: default_instruction_secs(),
            shutdown_secs: default_shutdown_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSection {
    #[serde(default)]
    pub backend: StorageBackendMode,
    /// Root for local blobs, metadata and scratch space.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Root that local sources are read from.
    #[serde(default)]
    pub workspace_dir: Option<PathBuf>,
    /// Base URL of the object store used in cloud mode.
    #[serde(default)]
    pub cloud_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilerSection {
    #[serde(default = "default_compiler_command")]
    pub command: String,
    /// `{src}` and `{out}` are replaced with the source and output paths.
    #[serde(default = "default_compiler_args")]
    pub args: Vec<String>,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    /// Source files with any other extension are not fetched.
    #[serde(default = "default_valid_extensions")]
    pub valid_extensions: Vec<String>,
}

fn default_compiler_command() -> String {
    "gopherjs".to_string()
}

fn default_compiler_args() -> Vec<String> {
    ["build", "-o", "{out}", "{src}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_content_type() -> String {
    "application/javascript".to_string()
}

fn default_valid_extensions() -> Vec<String> {
    [".go", ".jsgo.html", ".inc.js", ".md"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for CompilerSection {
    fn default() -> Self {
        Self {
            command: default_compiler_command(),
            args: default_compiler_args(),
            content_type: default_content_type(),
            valid_extensions: default_valid_extensions(),
        }
    }
}

/// Root of the configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub compiler: CompilerSection,
}

impl ServiceConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse compile-server config")
    }

    /// Load from `path` if given, otherwise defaults; then apply the
    /// environment.
    pub fn load_layered(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `COMPILE_*` overrides. `lookup` abstracts the environment so
    /// tests do not have to mutate process state.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup("COMPILE_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("COMPILE_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid COMPILE_PORT '{}'", port))?;
        }
        if let Some(backend) = lookup("COMPILE_STORAGE_BACKEND") {
            self.storage.backend = backend.parse()?;
        }
        if let Some(dir) = lookup("COMPILE_DATA_DIR") {
            self.storage.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = lookup("COMPILE_WORKSPACE_DIR") {
            self.storage.workspace_dir = Some(PathBuf::from(dir));
        }
        if let Some(url) = lookup("COMPILE_CLOUD_URL") {
            self.storage.cloud_url = Some(url);
        }
        if let Some(cmd) = lookup("COMPILE_COMPILER") {
            self.compiler.command = cmd;
        }
        Ok(())
    }

    /// Reject configurations the service cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.limits.max_concurrent_builds == 0 {
            bail!("limits.max_concurrent_builds must be greater than 0");
        }
        if self.limits.fetch_max_bytes == 0 || self.limits.fetch_max_objects == 0 {
            bail!("fetch caps must be greater than 0");
        }
        let timeouts = [
            ("write_secs", self.timeouts.write_secs),
            ("websocket_write_secs", self.timeouts.websocket_write_secs),
            ("fetch_secs", self.timeouts.fetch_secs),
            ("list_secs", self.timeouts.list_secs),
            ("compile_secs", self.timeouts.compile_secs),
            ("storage_secs", self.timeouts.storage_secs),
            ("page_secs", self.timeouts.page_secs),
            ("ping_interval_secs", self.timeouts.ping_interval_secs),
            ("instruction_secs", self.timeouts.instruction_secs),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, secs)| *secs == 0) {
            bail!("timeouts.{} must be greater than 0", name);
        }
        if self.timeouts.pong_secs <= self.timeouts.ping_interval_secs {
            bail!(
                "timeouts.pong_secs ({}) must be greater than timeouts.ping_interval_secs ({})",
                self.timeouts.pong_secs,
                self.timeouts.ping_interval_secs
            );
        }
        if self.storage.backend == StorageBackendMode::Cloud && self.storage.cloud_url.is_none() {
            bail!("storage.cloud_url is required for the cloud backend");
        }
        Ok(())
    }

    /// Local data root, defaulting to the user's data directory.
    pub fn data_dir(&self) -> PathBuf {
        self.storage.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("compile-server")
        })
    }

    /// Local source root, defaulting to `<data_dir>/src`.
    pub fn workspace_dir(&self) -> PathBuf {
        self.storage
            .workspace_dir
            .clone()
            .unwrap_or_else(|| self.data_dir().join("src"))
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.write_secs)
    }

    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.page_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.shutdown_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.fetch_secs)
    }

    pub fn list_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.list_secs)
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.compile_secs)
    }

    pub fn admission_settings(&self) -> AdmissionSettings {
        AdmissionSettings {
            max_concurrent: self.limits.max_concurrent_builds,
            max_backlog: self.limits.max_queue_backlog,
        }
    }

    pub fn cache_settings(&self) -> CacheSettings {
        CacheSettings {
            fetch_timeout: self.fetch_timeout(),
            compile_timeout: self.compile_timeout(),
            storage_timeout: Duration::from_secs(self.timeouts.storage_secs),
            fetch_max_bytes: self.limits.fetch_max_bytes,
            fetch_max_objects: self.limits.fetch_max_objects,
        }
    }

    pub fn channel_settings(&self) -> ChannelSettings {
        ChannelSettings {
            ping_interval: Duration::from_secs(self.timeouts.ping_interval_secs),
            pong_timeout: Duration::from_secs(self.timeouts.pong_secs),
            write_timeout: Duration::from_secs(self.timeouts.websocket_write_secs),
            instruction_timeout: Duration::from_secs(self.timeouts.instruction_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.limits.max_concurrent_builds, 3);
        assert_eq!(config.limits.max_queue_backlog, 100);
        assert_eq!(config.write_timeout(), Duration::from_secs(2));
        assert_eq!(config.storage.backend, StorageBackendMode::Local);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_empty_is_default() {
        let config = ServiceConfig::parse("").unwrap();
        assert_eq!(config.server.port, 8081);
        assert_eq!(config.timeouts.pong_secs, 20);
        assert_eq!(config.compiler.valid_extensions.len(), 4);
    }

    #[test]
    fn test_parse_sections() {
        let config = ServiceConfig::parse(
            r#"
            [limits]
            max_concurrent_builds = 8
            max_queue_backlog = 4

            [timeouts]
            write_secs = 7

            [storage]
            backend = "memory"
            "#,
        )
        .unwrap();
        assert_eq!(config.limits.max_concurrent_builds, 8);
        assert_eq!(config.limits.max_queue_backlog, 4);
        assert_eq!(config.write_timeout(), Duration::from_secs(7));
        assert_eq!(config.storage.backend, StorageBackendMode::Memory);
        // Untouched fields keep their defaults
        assert_eq!(config.limits.fetch_max_objects, 10_000);
    }

    #[test]
    fn test_parse_rejects_unknown_backend() {
        let err = ServiceConfig::parse("[storage]\nbackend = \"s3\"").unwrap_err();
        assert!(err.to_string().contains("parse"));
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = ServiceConfig::default();
        let env: HashMap<&str, &str> = [
            ("COMPILE_PORT", "9000"),
            ("COMPILE_STORAGE_BACKEND", "cloud"),
            ("COMPILE_CLOUD_URL", "http://store.local/bucket"),
        ]
        .into_iter()
        .collect();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.storage.backend, StorageBackendMode::Cloud);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_rejects_bad_port() {
        let mut config = ServiceConfig::default();
        let result = config.apply_env(|key| (key == "COMPILE_PORT").then(|| "http".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let config = ServiceConfig::parse("[timeouts]\nwrite_secs = 0\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("timeouts.write_secs"));

        let config = ServiceConfig::parse("[timeouts]\nfetch_secs = 0\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("timeouts.fetch_secs"));
    }

    #[test]
    fn test_validate_pong_must_exceed_ping() {
        let mut config = ServiceConfig::default();
        config.timeouts.pong_secs = config.timeouts.ping_interval_secs;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_cloud_requires_url() {
        let mut config = ServiceConfig::default();
        config.storage.backend = StorageBackendMode::Cloud;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_concurrency() {
        let mut config = ServiceConfig::default();
        config.limits.max_concurrent_builds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backend_mode_from_str() {
        assert_eq!(
            "Cloud".parse::<StorageBackendMode>().unwrap(),
            StorageBackendMode::Cloud
        );
        assert!("gcs".parse::<StorageBackendMode>().is_err());
    }

    #[test]
    fn test_data_dir_override() {
        let mut config = ServiceConfig::default();
        config.storage.data_dir = Some(PathBuf::from("/tmp/cs"));
        assert_eq!(config.data_dir(), PathBuf::from("/tmp/cs"));
        assert_eq!(config.workspace_dir(), PathBuf::from("/tmp/cs/src"));
    }

    #[test]
    fn test_channel_settings_follow_timeouts() {
        let config = ServiceConfig::default();
        let settings = config.channel_settings();
        assert!(settings.pong_timeout > settings.ping_interval);
        assert_eq!(settings.instruction_timeout, Duration::from_secs(5));
    }
}
