use crate::error::Result;
use crate::types::ServerId;
use directories::ProjectDirs;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// User settings. Every key is optional in the file; CLI flags override them.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub config_timeout_secs: u64,
    pub ping_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub upload_timeout_secs: u64,
    pub request_timeout_secs: Option<u64>,
    pub latency_samples: usize,
    pub closest_servers: usize,
    pub blocked_servers: Vec<ServerId>,
    pub fast_url_count: usize,
    pub show_bytes: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_timeout_secs: 20,
            ping_timeout_secs: 10,
            download_timeout_secs: 15,
            upload_timeout_secs: 15,
            request_timeout_secs: None,
            latency_samples: crate::latency::DEFAULT_LATENCY_SAMPLES,
            closest_servers: 5,
            blocked_servers: Vec::new(),
            fast_url_count: 5,
            show_bytes: false,
        }
    }
}

impl Settings {
    /// Default location: `<platform config dir>/speedprobe/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "speedprobe")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Loads the settings file at `path`, or the defaults when it does not
    /// exist. A file that exists but does not parse is an error.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        let settings = toml::from_str(&content)?;
        debug!(?path, "loaded settings");
        Ok(settings)
    }

    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn config_timeout(&self) -> Duration {
        Duration::from_secs(self.config_timeout_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}
