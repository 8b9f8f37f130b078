use std::path::PathBuf;
use std::time::Duration;

use crate::types::ToolName;

/// Client-side knobs for one scan session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Tools that must report before the session completes.
    pub expected_tools: Vec<ToolName>,
    /// Live clock refresh period.
    pub tick_interval: Duration,
    /// How long to keep the channel open after completion. `None` waits for the backend to close.
    pub grace_period: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            expected_tools: ToolName::DEFAULT.to_vec(),
            tick_interval: Duration::from_secs(1),
            grace_period: Some(Duration::from_secs(2)),
        }
    }
}

/// Backend service settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub history_path: PathBuf,
    pub amass_bin: PathBuf,
    pub harvester_bin: PathBuf,
    /// When set, subfinder runs alongside the default tools.
    pub subfinder_bin: Option<PathBuf>,
    pub tool_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".to_string(),
            history_path: PathBuf::from("scan_history.json"),
            amass_bin: PathBuf::from("amass"),
            harvester_bin: PathBuf::from("theHarvester"),
            subfinder_bin: None,
            tool_timeout: Duration::from_secs(15 * 60),
        }
    }
}
