//! Configuration constants and file loading for the CLI.
//!
//! This module provides default configuration values and functions to load
//! configuration from TOML files.
//!
//! Configuration sources (in order of precedence):
//! 1. Project-level config: `./.goxfer/config.toml`
//! 2. User-level config: `~/.goxfer/config.toml`
//! 3. Built-in defaults
//!
//! The API base URL default is set at compile time:
//! - Release builds: hardcoded production URL
//! - Debug builds: read from .env file if present, otherwise localhost

use std::fs;
use std::path::PathBuf;

use serde::Deserialize;
use tracing::{debug, warn};

/// API base URL (set at compile time by build.rs).
pub const API_URL: &str = env!("GOXFER_API_URL");

/// Keychain service name for remembered bucket passwords.
pub const KEYCHAIN_SERVICE: &str = "goxfer-creds-manager";

/// File name of the saved-credential manifest.
pub const CREDS_FILE_NAME: &str = ".goxfer.creds.json";

/// File name of the JSON-lines log file.
pub const LOG_FILE_NAME: &str = "logs.json";

/// Maximum log file size in bytes before rotation (15 MiB).
pub const LOG_MAX_BYTES: u64 = 15 * 1024 * 1024;

/// Size of the random payload POSTed by the upload bandwidth probe (4 MiB).
pub const PROBE_PAYLOAD_BYTES: usize = 4 * 1024 * 1024;

/// Maximum attempts per chunk upload (1 initial + 2 retries).
pub const CHUNK_MAX_ATTEMPTS: u32 = 3;

/// Base delay for chunk retry backoff in milliseconds.
pub const CHUNK_RETRY_BASE_DELAY_MS: u64 = 500;

/// Buffer size for streaming downloads to disk (64 KiB).
pub const DOWNLOAD_BUF_BYTES: usize = 64 * 1024;

/// Warn the user when the session has less than this many seconds left.
pub const SESSION_EXPIRY_WARN_SECS: i64 = 120;

/// Prefix for ciphertext temp files written next to the source file.
pub const ENC_FILE_PREFIX: &str = ".goXfer.";

/// Suffix for ciphertext temp files.
pub const ENC_FILE_SUFFIX: &str = ".enc";

/// Project-level config directory name.
pub const PROJECT_CONFIG_DIR: &str = ".goxfer";

/// Config file name.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// TOML configuration file structure.
#[derive(Debug, Default, Deserialize)]
pub struct GoxferConfig {
    /// Override for the API base URL.
    pub base_url: Option<String>,

    /// Override for the saved-credential manifest path.
    pub creds_path: Option<PathBuf>,

    /// Override for the log file path.
    pub log_path: Option<PathBuf>,
}

impl GoxferConfig {
    /// Resolved API base URL: config override or the compile-time default.
    pub fn api_url(&self) -> &str {
        self.base_url.as_deref().unwrap_or(API_URL)
    }

    /// Resolved path of the saved-credential manifest.
    pub fn creds_path(&self) -> PathBuf {
        self.creds_path.clone().unwrap_or_else(default_creds_path)
    }

    /// Resolved path of the log file.
    pub fn log_path(&self) -> PathBuf {
        self.log_path.clone().unwrap_or_else(default_log_path)
    }
}

/// Default saved-credential manifest path (`~/.config/goxfer/.goxfer.creds.json`).
fn default_creds_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("goxfer")
        .join(CREDS_FILE_NAME)
}

/// Default log file path (`~/.local/share/goxfer/logs.json` on Linux).
fn default_log_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("goxfer")
        .join(LOG_FILE_NAME)
}

/// Loads configuration, trying project-level first, then user-level.
///
/// Missing files are not an error; a file that fails to parse is logged
/// and skipped so a typo never locks the user out.
pub fn load_config() -> GoxferConfig {
    let candidates = [
        Some(PathBuf::from(PROJECT_CONFIG_DIR).join(CONFIG_FILE_NAME)),
        dirs::home_dir().map(|home| home.join(PROJECT_CONFIG_DIR).join(CONFIG_FILE_NAME)),
    ];

    for path in candidates.into_iter().flatten() {
        if !path.exists() {
            continue;
        }

        match fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str::<GoxferConfig>(&contents) {
                Ok(config) => {
                    debug!(path = %path.display(), "Loaded config");
                    return config;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unparseable config");
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable config");
            }
        }
    }

    GoxferConfig::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_uses_compile_time_url() {
        let config = GoxferConfig::default();
        assert_eq!(config.api_url(), API_URL);
    }

    #[test]
    fn test_base_url_override() {
        let config: GoxferConfig = toml::from_str(r#"base_url = "https://example.org""#).unwrap();
        assert_eq!(config.api_url(), "https://example.org");
    }

    #[test]
    fn test_path_overrides() {
        let config: GoxferConfig = toml::from_str(
            r#"
            creds_path = "/tmp/creds.json"
            log_path = "/tmp/logs.json"
            "#,
        )
        .unwrap();
        assert_eq!(config.creds_path(), PathBuf::from("/tmp/creds.json"));
        assert_eq!(config.log_path(), PathBuf::from("/tmp/logs.json"));
    }

    #[test]
    fn test_default_paths_end_with_expected_names() {
        let config = GoxferConfig::default();
        assert!(config.creds_path().ends_with("goxfer/.goxfer.creds.json"));
        assert!(config.log_path().ends_with("goxfer/logs.json"));
    }
}
