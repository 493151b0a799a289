use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::duration;

/// Global server settings (`global.yaml`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub http_port: u16,
    #[serde(default)]
    pub https_port: u16,
    #[serde(default = "default_rw_timeout", with = "duration")]
    pub read_timeout: Duration,
    #[serde(default = "default_rw_timeout", with = "duration")]
    pub write_timeout: Duration,
    #[serde(default = "default_idle_timeout", with = "duration")]
    pub idle_timeout: Duration,
    /// Maximum accepted request head, in bytes.
    #[serde(default)]
    pub max_header_size: usize,
    #[serde(default)]
    pub http2_enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

fn default_rw_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(60)
}

impl GlobalConfig {
    pub fn apply_defaults(&mut self) {
        if self.server.http_port == 0 {
            self.server.http_port = 8080;
        }
        if self.server.https_port == 0 {
            self.server.https_port = 8443;
        }
        if self.server.max_header_size == 0 {
            self.server.max_header_size = 1024 * 1024;
        }
        if self.log.level.is_empty() {
            self.log.level = "info".to_string();
        }
        if self.log.format.is_empty() {
            self.log.format = "json".to_string();
        }
    }
}
