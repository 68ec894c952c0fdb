//! Cache configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use keyiv_common::{Error, Result};
use keyiv_crypto::DEFAULT_BUFFER_SIZE;
use keyiv_storage::{RetryConfig, DEFAULT_MAX_ATTEMPTS};

/// File name of the cache in both the shared and the per-user location.
pub const CACHE_FILE_NAME: &str = "KeyIVCache.bin";

/// Application directory name under data roots.
const APP_DIR_NAME: &str = "keyiv";

/// Tunables for the key/IV cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Machine-wide cache file.
    pub cache_path: PathBuf,
    /// Per-user fallback directory. `None` uses the platform data dir.
    pub user_cache_dir: Option<PathBuf>,
    /// Delay between I/O attempts, in milliseconds.
    pub retry_delay_interval_ms: u64,
    /// Maximum I/O attempts.
    pub max_retry_attempts: u32,
    /// Reload when another process changes the file.
    pub reload_on_change: bool,
    /// Polling interval of the change notifier, in milliseconds.
    pub poll_interval_ms: u64,
    /// Plaintext bytes per framed stream record.
    pub stream_buffer_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_path: default_shared_dir().join(CACHE_FILE_NAME),
            user_cache_dir: None,
            retry_delay_interval_ms: 200,
            max_retry_attempts: DEFAULT_MAX_ATTEMPTS,
            reload_on_change: true,
            poll_interval_ms: 1000,
            stream_buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

#[cfg(windows)]
fn default_shared_dir() -> PathBuf {
    std::env::var_os("PROGRAMDATA")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(r"C:\ProgramData"))
        .join(APP_DIR_NAME)
}

#[cfg(not(windows))]
fn default_shared_dir() -> PathBuf {
    PathBuf::from("/var/lib").join(APP_DIR_NAME)
}

impl CacheConfig {
    /// Configuration with the shared cache at `cache_path` and defaults elsewhere.
    pub fn with_cache_path(cache_path: impl Into<PathBuf>) -> Self {
        Self {
            cache_path: cache_path.into(),
            ..Self::default()
        }
    }

    /// Parse a JSON configuration. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::Serialization(format!("Invalid cache configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::Serialization(format!("Failed to serialize configuration: {}", e)))
    }

    /// Load a JSON configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| Error::from_io(e, path))?;
        Self::from_json(&json)
    }

    /// Reject values that would make the cache unusable.
    pub fn validate(&self) -> Result<()> {
        if self.cache_path.as_os_str().is_empty() {
            return Err(Error::InvalidArgument(
                "cache_path cannot be empty".to_string(),
            ));
        }
        if self.max_retry_attempts == 0 {
            return Err(Error::InvalidArgument(
                "max_retry_attempts must be at least 1".to_string(),
            ));
        }
        if self.stream_buffer_size == 0 {
            return Err(Error::InvalidArgument(
                "stream_buffer_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Retry policy for cache file I/O.
    pub fn retry_policy(&self) -> RetryConfig {
        RetryConfig::new(self.max_retry_attempts)
            .with_delay(Duration::from_millis(self.retry_delay_interval_ms))
    }

    /// Upper bound on waiting for the first load.
    pub fn readiness_timeout(&self) -> Duration {
        self.retry_policy().budget()
    }

    /// Polling interval for the production change notifier.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Per-user fallback cache file.
    ///
    /// # Errors
    /// - `InvalidArgument` if no directory is configured and the platform has
    ///   no local data directory
    pub fn user_cache_path(&self) -> Result<PathBuf> {
        let dir = match &self.user_cache_dir {
            Some(dir) => dir.clone(),
            None => dirs::data_local_dir()
                .map(|dir| dir.join(APP_DIR_NAME))
                .ok_or_else(|| {
                    Error::InvalidArgument(
                        "No per-user data directory available; set user_cache_dir".to_string(),
                    )
                })?,
        };
        Ok(dir.join(CACHE_FILE_NAME))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();

        assert!(config.cache_path.ends_with(CACHE_FILE_NAME));
        assert_eq!(config.retry_delay_interval_ms, 200);
        assert_eq!(config.max_retry_attempts, 10);
        assert_eq!(config.readiness_timeout(), Duration::from_secs(2));
        assert_eq!(config.stream_buffer_size, 32 * 1024);
        assert!(config.reload_on_change);
        config.validate().unwrap();
    }

    #[test]
    fn test_json_fills_missing_fields() {
        let config =
            CacheConfig::from_json(r#"{"cache_path":"/tmp/keys.bin","max_retry_attempts":3}"#)
                .unwrap();

        assert_eq!(config.cache_path, PathBuf::from("/tmp/keys.bin"));
        assert_eq!(config.max_retry_attempts, 3);
        assert_eq!(config.retry_delay_interval_ms, 200);

        let back = CacheConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            CacheConfig::from_json(r#"{"max_retry_attempts":0}"#),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            CacheConfig::from_json(r#"{"stream_buffer_size":0}"#),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            CacheConfig::from_json("not json"),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn test_user_cache_path_override() {
        let config = CacheConfig {
            user_cache_dir: Some(PathBuf::from("/home/alice/.keyiv")),
            ..CacheConfig::default()
        };
        assert_eq!(
            config.user_cache_path().unwrap(),
            PathBuf::from("/home/alice/.keyiv").join(CACHE_FILE_NAME)
        );
    }

    #[test]
    fn test_from_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("keyiv.json");
        std::fs::write(&path, r#"{"retry_delay_interval_ms":50}"#).unwrap();

        let config = CacheConfig::from_file(&path).unwrap();
        assert_eq!(config.retry_policy().delay, Duration::from_millis(50));
    }
}
