//! Management API messages between the server and its clients

use serde::{Deserialize, Serialize};
use crate::config::SiteConfig;

/// Messages sent from a management client to the server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientMessage {
    /// Request current server status
    GetStatus,

    /// Request traffic statistics, optionally limited to the top `limit`
    /// paths and referrers
    GetStats { limit: Option<usize> },

    /// Request the live site settings
    GetSite,

    /// Write the counters to disk now
    SaveStats,

    /// Reload configuration from file
    ReloadConfig,
}

/// Messages sent from the server to a management client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerMessage {
    /// Server status response
    Status(ServerStatus),

    /// Traffic statistics
    Stats(StatsReport),

    /// Current site settings
    Site(SiteConfig),

    /// Operation success
    Success(String),

    /// Operation error
    Error(String),
}

/// Server status information
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerStatus {
    /// Server is running
    pub running: bool,

    /// Uptime in seconds
    pub uptime_secs: u64,

    /// Server version
    pub version: String,

    /// Listening address
    pub listen_address: String,

    /// Location of the persisted counters
    pub stats_file: String,
}

/// Traffic statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StatsReport {
    /// Requests served over the lifetime of the stats file
    pub total_requests: u64,

    /// Bytes served over the lifetime of the stats file
    pub total_bytes: u64,

    /// Requests served since this process started
    pub session_requests: u64,

    /// Bytes served since this process started
    pub session_bytes: u64,

    /// Requests per second since this process started
    pub requests_per_second: f64,

    /// Most visited paths, highest count first
    pub paths: Vec<CountEntry>,

    /// Most frequent referrers, highest count first, names trimmed for display
    pub referrers: Vec<CountEntry>,
}

/// A named counter in a report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountEntry {
    pub name: String,
    pub count: u64,
}
