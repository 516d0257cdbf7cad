//! Configuration types for the Hearth server

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HearthConfig {
    /// Listener, secrets and document store settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Management API settings
    #[serde(default)]
    pub management: ManagementConfig,

    /// Site-wide settings handed to every request
    #[serde(default)]
    pub site: SiteConfig,

    /// Traffic statistics persistence
    #[serde(default)]
    pub stats: StatsConfig,

    /// Access log file and rotation
    #[serde(default)]
    pub access_log: AccessLogConfig,

    /// Template lookup
    #[serde(default)]
    pub templates: TemplateConfig,
}

/// Server listening configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Secret the session cookie signing key is derived from
    #[serde(default = "default_secret")]
    pub secret: String,

    /// Mark the session cookie `Secure`
    #[serde(default)]
    pub secure_cookies: bool,

    /// Document store location
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Largest accepted request body, in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            secret: default_secret(),
            secure_cookies: false,
            database_url: default_database_url(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Management API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagementConfig {
    /// Enable management API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// WebSocket address for management connections
    #[serde(default = "default_management_address")]
    pub address: String,

    /// Management port
    #[serde(default = "default_management_port")]
    pub port: u16,
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_management_address(),
            port: default_management_port(),
        }
    }
}

/// Read-only site settings, snapshotted into each request context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteConfig {
    #[serde(default = "default_domain")]
    pub domain: String,

    #[serde(default = "default_title")]
    pub title: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub allow_registration: bool,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            title: default_title(),
            description: String::new(),
            allow_registration: false,
        }
    }
}

/// Statistics persistence configuration
///
/// ```json
/// "stats": {
///   "file": "stats.dat",
///   "save_interval_secs": 0,
///   "exclude": ["/api/", "identicon"]
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Path of the persisted counters file
    #[serde(default = "default_stats_file")]
    pub file: PathBuf,

    /// Seconds between background saves. 0 saves after every request.
    #[serde(default)]
    pub save_interval_secs: u64,

    /// Paths containing any of these substrings are left out of the
    /// per-path and per-referrer tables (they still count toward totals)
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            file: default_stats_file(),
            save_interval_secs: 0,
            exclude: Vec::new(),
        }
    }
}

/// Access log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessLogConfig {
    /// Enable the access log
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Log file path
    #[serde(default = "default_access_log_path")]
    pub path: PathBuf,

    /// Size in megabytes at which the log is rotated
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,

    /// Rotated files to keep (0 = keep all)
    #[serde(default)]
    pub max_backups: usize,
}

impl AccessLogConfig {
    /// Rotation threshold in bytes
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb.saturating_mul(1024 * 1024)
    }
}

impl Default for AccessLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_access_log_path(),
            max_size_mb: default_max_size_mb(),
            max_backups: 0,
        }
    }
}

/// Template configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TemplateConfig {
    /// Directory whose `*.html` files override the built-in templates
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_secret() -> String {
    "change-me".to_string()
}

fn default_database_url() -> String {
    "memory://".to_string()
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_management_address() -> String {
    "127.0.0.1".to_string()
}

fn default_management_port() -> u16 {
    9090
}

fn default_true() -> bool {
    true
}

fn default_domain() -> String {
    "localhost".to_string()
}

fn default_title() -> String {
    "Hearth".to_string()
}

fn default_stats_file() -> PathBuf {
    PathBuf::from("stats.dat")
}

fn default_access_log_path() -> PathBuf {
    PathBuf::from("logs/access.log")
}

fn default_max_size_mb() -> u64 {
    500
}

/// On-disk configuration format, picked from the file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Toml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::Toml,
            _ => Self::Json,
        }
    }
}

impl HearthConfig {
    /// Load configuration from a JSON or TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        match ConfigFormat::from_path(path) {
            ConfigFormat::Json => Self::from_json(&content),
            ConfigFormat::Toml => Self::from_toml(&content),
        }
    }

    /// Load the configuration, creating the file first when it is missing.
    ///
    /// A sibling `<stem>.example.<ext>` is copied into place if present,
    /// otherwise the defaults are written out.
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            let example = example_path(path);
            if example.is_file() {
                std::fs::copy(&example, path).map_err(|e| ConfigError::IoError(e.to_string()))?;
            } else {
                Self::default().save(path)?;
            }
        }
        Self::load(path)
    }

    /// Parse configuration from a JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration, in the format matching the file extension
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = match ConfigFormat::from_path(path) {
            ConfigFormat::Json => self.to_json()?,
            ConfigFormat::Toml => toml::to_string_pretty(self)
                .map_err(|e| ConfigError::SerializeError(e.to_string()))?,
        };
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Ok(())
    }

    /// Convert to a pretty JSON string
    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))
    }

    /// Reject settings the server cannot start with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::ValidationError(
                "Server port cannot be 0".to_string(),
            ));
        }
        if self.management.enabled && self.management.port == 0 {
            return Err(ConfigError::ValidationError(
                "Management port cannot be 0".to_string(),
            ));
        }
        if self.server.secret.is_empty() {
            return Err(ConfigError::ValidationError(
                "Session secret cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// `hearth.json` -> `hearth.example.json`
fn example_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("config");
    let name = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}.example.{}", stem, ext),
        None => format!("{}.example", stem),
    };
    path.with_file_name(name)
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
