use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Server settings. Every field has a default so a partial TOML file, or
/// none at all, is enough.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// WebSocket listen address.
    pub addr: String,
    /// Directory holding accounts.json / devices.json / areas.json.
    pub data_dir: Option<PathBuf>,
    /// Per-connection outbound queue capacity.
    pub send_buffer: usize,
    pub hub_buffer: usize,
    pub audit_buffer: usize,
    /// Seconds without a command before a connection is logged out. 0 disables.
    pub idle_timeout_secs: u64,
    pub token_secret: String,
    pub token_ttl_secs: u64,
    /// Validity window of a mailed verification code.
    pub code_ttl_secs: u64,
    pub log_filter: String,
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
            data_dir: None,
            send_buffer: 256,
            hub_buffer: 256,
            audit_buffer: 1024,
            idle_timeout_secs: 120,
            token_secret: "insecure-secret".to_string(),
            token_ttl_secs: 86_400,
            code_ttl_secs: 300,
            log_filter: "info".to_string(),
            log_json: false,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}
