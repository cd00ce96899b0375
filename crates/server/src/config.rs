use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const CONFIG_VERSION: u32 = 1;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub version: u32,
    pub music_root: String,
    pub index_path: String,
    pub covers_path: String,
    pub uploads_path: String,
    pub extensions: Vec<String>,
    pub port: u16,
    pub watch_music: bool,
    pub watch_debounce_ms: u64,
    /// Zero disables the periodic rescan.
    pub rescan_interval_secs: u64,
    pub rescan_grace_secs: u64,
    pub workers: usize,
    pub job_timeout_secs: u64,
    pub lease_ttl_secs: u64,
    pub history_keep: usize,
    pub event_buffer: usize,
    pub extract_parallelism: usize,
    pub batch_size: usize,
    pub cover_small_size: u32,
    pub duration_tolerance_secs: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            music_root: "".to_string(),
            index_path: "catalog.redb".to_string(),
            covers_path: "covers".to_string(),
            uploads_path: "".to_string(),
            extensions: library::default_extensions(),
            port: 3000,
            watch_music: true,
            watch_debounce_ms: 500,
            rescan_interval_secs: 60 * 60,
            rescan_grace_secs: 10,
            workers: 4,
            job_timeout_secs: 300,
            lease_ttl_secs: library::DEFAULT_LEASE_TTL.as_secs(),
            history_keep: library::DEFAULT_HISTORY_KEEP,
            event_buffer: 256,
            extract_parallelism: 4,
            batch_size: 100,
            cover_small_size: 300,
            duration_tolerance_secs: library::DEFAULT_DURATION_TOLERANCE_SECS,
        }
    }
}

impl ServerConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs.max(1))
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs.max(1))
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(if self.watch_debounce_ms == 0 {
            500
        } else {
            self.watch_debounce_ms
        })
    }

    pub fn rescan_interval(&self) -> Option<Duration> {
        (self.rescan_interval_secs > 0).then(|| Duration::from_secs(self.rescan_interval_secs))
    }

    pub fn rescan_grace(&self) -> Duration {
        Duration::from_secs(self.rescan_grace_secs)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub fn config_path_from_env() -> PathBuf {
    match env::var("TRACKSYNC_CONFIG") {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
        _ => default_config_path(),
    }
}

fn default_config_path() -> PathBuf {
    match env::current_exe() {
        Ok(exe) => exe
            .parent()
            .map(|dir| dir.join("config.yaml"))
            .unwrap_or_else(|| PathBuf::from("config.yaml")),
        Err(_) => PathBuf::from("config.yaml"),
    }
}

pub fn load_or_create_config(path: &Path) -> Result<(ServerConfig, bool), ConfigError> {
    if path.exists() {
        let contents = fs::read_to_string(path)?;
        let mut config: ServerConfig = serde_yaml::from_str(&contents)?;
        if config.version < CONFIG_VERSION {
            config.version = CONFIG_VERSION;
        }
        if config.index_path.trim().is_empty() {
            config.index_path = "catalog.redb".to_string();
        }
        if config.covers_path.trim().is_empty() {
            config.covers_path = "covers".to_string();
        }
        if config.port == 0 {
            config.port = 3000;
        }
        if config.workers == 0 {
            config.workers = 1;
        }
        config.extensions = normalize_extensions(&config.extensions);
        if config.extensions.is_empty() {
            config.extensions = library::default_extensions();
        }
        return Ok((config, false));
    }

    let config = ServerConfig::default();
    save_config(path, &config)?;
    Ok((config, true))
}

pub fn save_config(path: &Path, config: &ServerConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let contents = serde_yaml::to_string(config)?;
    fs::write(path, contents)?;
    Ok(())
}

pub fn resolve_path(config_path: &Path, value: &str) -> PathBuf {
    let raw = PathBuf::from(value);
    if raw.is_absolute() {
        return raw;
    }
    let base = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    base.join(raw)
}

pub fn resolve_music_root(config_path: &Path, value: &str) -> Option<PathBuf> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(resolve_path(config_path, trimmed))
    }
}

fn normalize_extensions(extensions: &[String]) -> Vec<String> {
    let mut out: Vec<String> = extensions
        .iter()
        .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}
