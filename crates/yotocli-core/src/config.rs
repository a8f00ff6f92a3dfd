//! Application configuration management.
//!
//! Handles loading and saving the user's settings, including the OAuth
//! tokens and client identifier obtained at login.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::DEFAULT_ICON;
use crate::upload::PollPolicy;

/// Production API endpoint.
pub const DEFAULT_API_BASE_URL: &str = "https://api.yotoplay.com";

/// Production login endpoint.
pub const DEFAULT_AUTH_BASE_URL: &str = "https://login.yotoplay.com";

/// Stored credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthConfig {
    /// Bearer token for API calls.
    #[serde(default)]
    pub access_token: String,
    /// Token used to renew the access token.
    #[serde(default)]
    pub refresh_token: String,
    /// OAuth client identifier.
    #[serde(default)]
    pub client_id: String,
}

const fn default_true() -> bool {
    true
}

const fn default_poll_interval() -> u64 {
    5
}

const fn default_transcode_timeout() -> u64 {
    30 * 60
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_auth_base_url() -> String {
    DEFAULT_AUTH_BASE_URL.to_string()
}

fn default_icon() -> String {
    DEFAULT_ICON.to_string()
}

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    /// Credentials.
    #[serde(default)]
    pub auth: AuthConfig,
    /// Base URL of the library API.
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// Base URL of the login service.
    #[serde(default = "default_auth_base_url")]
    pub auth_base_url: String,
    /// Normalize loudness before uploading.
    #[serde(default = "default_true")]
    pub normalize: bool,
    /// Seconds between transcode status requests.
    #[serde(default = "default_poll_interval")]
    pub transcode_poll_interval_secs: u64,
    /// Seconds before a transcode is given up on.
    #[serde(default = "default_transcode_timeout")]
    pub transcode_timeout_secs: u64,
    /// Icon attached to new chapters.
    #[serde(default = "default_icon")]
    pub default_icon: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            auth: AuthConfig::default(),
            api_base_url: default_api_base_url(),
            auth_base_url: default_auth_base_url(),
            normalize: true,
            transcode_poll_interval_secs: default_poll_interval(),
            transcode_timeout_secs: default_transcode_timeout(),
            default_icon: default_icon(),
        }
    }
}

impl AppConfig {
    /// Load configuration from `path`, or defaults if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| Error::FileSystem {
            path: path.to_path_buf(),
            message: format!("Failed to read config file: {e}"),
        })?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| Error::Configuration(format!("Failed to parse config file: {e}")))?;

        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Save configuration to `path`, creating the parent directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be written.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent).map_err(|e| Error::FileSystem {
                path: parent.to_path_buf(),
                message: format!("Failed to create config directory: {e}"),
            })?;
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).map_err(|e| Error::FileSystem {
            path: path.to_path_buf(),
            message: format!("Failed to write config file: {e}"),
        })?;

        info!("Saved config to {}", path.display());
        Ok(())
    }

    /// Poll policy for transcodes.
    #[must_use]
    pub const fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_secs(self.transcode_poll_interval_secs),
            timeout: Duration::from_secs(self.transcode_timeout_secs),
        }
    }

    /// Whether an access token is stored.
    #[must_use]
    pub fn is_logged_in(&self) -> bool {
        !self.auth.access_token.is_empty()
    }
}

/// Get the default path of the config file.
#[must_use]
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join("yotocli")
        .join("config.json")
}

/// Configuration manager tying the loaded config to its file.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    path: PathBuf,
    config: AppConfig,
}

impl ConfigManager {
    /// Load the config at `path`, or at [`default_config_path`] when `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be loaded.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let path = path.unwrap_or_else(default_config_path);
        let config = AppConfig::load_from(&path)?;
        Ok(Self { path, config })
    }

    /// Get a reference to the current configuration.
    #[must_use]
    pub const fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Location of the config file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the current configuration back to its file.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be saved.
    pub fn save(&self) -> Result<()> {
        self.config.save_to(&self.path)
    }

    /// Store a new token pair (not saved until [`Self::save`]).
    pub fn set_tokens(&mut self, access_token: impl Into<String>, refresh_token: impl Into<String>) {
        self.config.auth.access_token = access_token.into();
        self.config.auth.refresh_token = refresh_token.into();
    }

    /// Store the OAuth client identifier (not saved until [`Self::save`]).
    pub fn set_client_id(&mut self, client_id: impl Into<String>) {
        self.config.auth.client_id = client_id.into();
    }

    /// Stored access token, empty when logged out.
    #[must_use]
    pub fn access_token(&self) -> &str {
        &self.config.auth.access_token
    }

    /// Stored refresh token.
    #[must_use]
    pub fn refresh_token(&self) -> &str {
        &self.config.auth.refresh_token
    }

    /// Stored client identifier.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.config.auth.client_id
    }
}
