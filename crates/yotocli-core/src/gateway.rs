//! Remote library gateway abstraction.
//!
//! Every remote operation the engine performs goes through [`LibraryGateway`].
//! The production implementation is [`crate::client::HttpGateway`]; tests use
//! the generated `MockLibraryGateway` or an in-memory fake.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{Card, Device, DeviceStatus};

/// One-time upload target issued by the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSlot {
    /// Where to PUT the audio bytes.
    pub upload_url: String,
    /// Opaque ID used to poll the transcode.
    pub upload_id: String,
}

/// Audio facts reported by a finished transcode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranscodeResult {
    /// SHA-256 of the transcoded audio.
    pub sha256: String,
    /// Duration in seconds.
    pub duration: u64,
    /// Size in bytes.
    pub file_size: u64,
    /// Audio format.
    pub format: String,
    /// Channel layout as reported, e.g. `"stereo"`.
    pub channels: String,
}

/// Outcome of a single transcode status request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscodeStatus {
    /// Still processing.
    Pending,
    /// Finished; the audio is playable.
    Complete(TranscodeResult),
}

/// Codes returned when a device-code grant starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAuthorization {
    /// Secret code exchanged for tokens.
    pub device_code: String,
    /// Code the human types in the browser.
    pub user_code: String,
    /// Page where the code is entered.
    pub verification_uri: String,
    /// Page with the code already filled in, when offered.
    #[serde(default)]
    pub verification_uri_complete: Option<String>,
    /// Suggested seconds between polls.
    #[serde(default)]
    pub interval: u64,
    /// Seconds until the device code expires.
    #[serde(default)]
    pub expires_in: u64,
}

/// Access and refresh token pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    /// Bearer token for API calls.
    pub access_token: String,
    /// Token used to obtain the next pair.
    #[serde(default)]
    pub refresh_token: String,
}

/// Outcome of a single device-code token request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenPoll {
    /// The user approved; tokens issued.
    Granted(TokenPair),
    /// The user has not acted yet.
    Pending,
    /// Polling too fast; back off.
    SlowDown,
    /// Any other error code, terminal.
    Failed(String),
}

/// Typed operations against the remote media service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LibraryGateway: Send + Sync {
    // =========================================================================
    // Cards
    // =========================================================================

    /// Card summaries of the whole library (content may be absent).
    async fn list_cards(&self) -> Result<Vec<Card>>;

    /// One card with its full content.
    async fn get_card(&self, card_id: &str) -> Result<Card>;

    /// Create a card. The card must not carry an ID.
    async fn create_card(&self, card: &Card) -> Result<()>;

    /// Upsert a card keyed by its own ID.
    async fn update_card(&self, card: &Card) -> Result<()>;

    /// Delete a card. Final.
    async fn delete_card(&self, card_id: &str) -> Result<()>;

    // =========================================================================
    // Uploads
    // =========================================================================

    /// Acquire a one-time upload target.
    async fn upload_slot(&self) -> Result<UploadSlot>;

    /// Send the file at `path` to `upload_url`.
    async fn upload_file(&self, upload_url: &str, path: &Path) -> Result<()>;

    /// Ask once for the transcode status of `upload_id`.
    async fn transcode_status(&self, upload_id: &str) -> Result<TranscodeStatus>;

    /// Fetch `url` into the file at `dest`.
    async fn download_file(&self, url: &str, dest: &Path) -> Result<()>;

    // =========================================================================
    // Authorization
    // =========================================================================

    /// Begin a device-code grant.
    async fn start_device_auth(&self, client_id: &str) -> Result<DeviceAuthorization>;

    /// Exchange a device code for tokens, once.
    async fn poll_token(&self, device_code: &str, client_id: &str) -> Result<TokenPoll>;

    /// Exchange a refresh token for a new pair.
    async fn refresh_token(&self, refresh_token: &str, client_id: &str) -> Result<TokenPair>;

    // =========================================================================
    // Devices
    // =========================================================================

    /// Players registered to the account.
    async fn list_devices(&self) -> Result<Vec<Device>>;

    /// Live status of one player.
    async fn device_status(&self, device_id: &str) -> Result<DeviceStatus>;

    /// Set the volume of a player.
    async fn set_volume(&self, device_id: &str, level: u8) -> Result<()>;

    /// Start a card on a player.
    async fn play_card(&self, device_id: &str, card_id: &str) -> Result<()>;

    /// Stop playback.
    async fn stop_player(&self, device_id: &str) -> Result<()>;

    /// Pause playback.
    async fn pause_player(&self, device_id: &str) -> Result<()>;
}
