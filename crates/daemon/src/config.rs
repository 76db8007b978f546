use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub db_path: PathBuf,
    pub bind: SocketAddr,
    /// Scripting bridge of the external editing surface
    pub surface_url: String,
    pub render_url: String,
    /// Optional JSON preset library replacing the built-in one
    pub color_library: Option<PathBuf>,
    pub materializer: MaterializerConfig,
    pub export: ExportConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            db_path: PathBuf::from(".cache/cutsmith.db"),
            bind: SocketAddr::from(([127, 0, 0, 1], 7777)),
            surface_url: "http://127.0.0.1:7780".to_string(),
            render_url: "http://127.0.0.1:7780".to_string(),
            color_library: None,
            materializer: MaterializerConfig::default(),
            export: ExportConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaterializerConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Ceiling on all attempts for one placement, backoff included
    pub placement_timeout_ms: u64,
    /// Frame rate of manual guide timecodes
    pub fps: f64,
}

impl Default for MaterializerConfig {
    fn default() -> Self {
        MaterializerConfig {
            max_attempts: 4,
            base_backoff_ms: 200,
            max_backoff_ms: 2000,
            placement_timeout_ms: 10_000,
            fps: 25.0,
        }
    }
}

/// Guide timecodes are only meaningful at real video frame rates
const FPS_RANGE: std::ops::RangeInclusive<f64> = 1.0..=240.0;

impl MaterializerConfig {
    /// Delay before retry number `attempt` (0-based), doubling up to the cap
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms))
    }

    pub fn placement_timeout(&self) -> Duration {
        Duration::from_millis(self.placement_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub poll_interval_ms: u64,
    /// Consecutive poll errors after which a job fails
    pub max_poll_errors: u32,
}

impl Default for ExportConfig {
    fn default() -> Self {
        ExportConfig {
            poll_interval_ms: 500,
            max_poll_errors: 5,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Config file named by `CUTSMITH_CONFIG`, then single-value overrides
    pub fn load_with(env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = match env("CUTSMITH_CONFIG") {
            Some(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config file {}", path))?;
                serde_json::from_str(&raw).with_context(|| format!("Invalid config file {}", path))?
            }
            None => Config::default(),
        };

        if let Some(db_path) = env("CUTSMITH_DB") {
            config.db_path = PathBuf::from(db_path);
        }
        if let Some(bind) = env("CUTSMITH_BIND") {
            config.bind = bind
                .parse()
                .with_context(|| format!("Invalid CUTSMITH_BIND address: {}", bind))?;
        }
        if let Some(url) = env("CUTSMITH_SURFACE_URL") {
            config.surface_url = url;
        }
        if let Some(url) = env("CUTSMITH_RENDER_URL") {
            config.render_url = url;
        }

        if !FPS_RANGE.contains(&config.materializer.fps) {
            bail!(
                "materializer.fps must be between {} and {}, got {}",
                FPS_RANGE.start(),
                FPS_RANGE.end(),
                config.materializer.fps
            );
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_environment() {
        let config = Config::load_with(env_from(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.materializer.max_attempts, 4);
        assert_eq!(config.export.max_poll_errors, 5);
    }

    #[test]
    fn test_file_then_env_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"surface_url": "http://bridge:9000", "materializer": {{"max_attempts": 2}}}}"#
        )
        .unwrap();
        let path = file.path().to_string_lossy().to_string();

        let config = Config::load_with(env_from(&[
            ("CUTSMITH_CONFIG", path.as_str()),
            ("CUTSMITH_DB", "/tmp/x.db"),
            ("CUTSMITH_BIND", "0.0.0.0:8080"),
        ]))
        .unwrap();

        assert_eq!(config.surface_url, "http://bridge:9000");
        assert_eq!(config.materializer.max_attempts, 2);
        assert_eq!(config.materializer.base_backoff_ms, 200);
        assert_eq!(config.db_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(config.bind.port(), 8080);
    }

    #[test]
    fn test_bad_bind_address_is_an_error() {
        assert!(Config::load_with(env_from(&[("CUTSMITH_BIND", "nowhere")])).is_err());
    }

    #[test]
    fn test_out_of_range_fps_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"materializer": {{"fps": 2000000.0}}}}"#).unwrap();
        let path = file.path().to_string_lossy().to_string();

        let err = Config::load_with(env_from(&[("CUTSMITH_CONFIG", path.as_str())])).unwrap_err();
        assert!(err.to_string().contains("materializer.fps"));
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let config = MaterializerConfig::default();
        assert_eq!(config.backoff(0), Duration::from_millis(200));
        assert_eq!(config.backoff(1), Duration::from_millis(400));
        assert_eq!(config.backoff(3), Duration::from_millis(1600));
        assert_eq!(config.backoff(4), Duration::from_millis(2000));
        assert_eq!(config.backoff(70), Duration::from_millis(2000));
    }
}
