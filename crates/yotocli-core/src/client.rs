//! HTTP implementation of [`LibraryGateway`].
//!
//! One [`HttpGateway`] is built per process from the configured base URLs and
//! bearer token and then passed to every component that needs it.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, TryStreamExt, stream};
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::config::{DEFAULT_API_BASE_URL, DEFAULT_AUTH_BASE_URL};
use crate::error::{Error, Result};
use crate::gateway::{
    DeviceAuthorization, LibraryGateway, TokenPair, TokenPoll, TranscodeResult, TranscodeStatus,
    UploadSlot,
};
use crate::model::{Card, Device, DeviceStatus};

/// User agent the service expects from first-party apps.
pub const USER_AGENT: &str = "Yoto/2.73 (com.yotoplay.Yoto; build:10405; iOS 17.4.0)";

/// Scopes requested at login.
pub const OAUTH_SCOPE: &str = "openid profile email offline_access";

/// Audience requested at login.
pub const OAUTH_AUDIENCE: &str = "https://api.yotoplay.com";

/// Grant type of the device-code exchange.
pub const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Default timeout for API requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for audio uploads and downloads.
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(10 * 60);

// =============================================================================
// Response shapes
// =============================================================================

#[derive(Debug, Deserialize)]
struct LibraryResponse {
    #[serde(default)]
    cards: Vec<LibraryItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LibraryItem {
    #[serde(default)]
    card_id: String,
    #[serde(default)]
    card: Card,
}

#[derive(Debug, Deserialize)]
struct CardResponse {
    card: Card,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    upload: UploadSlot,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TranscodeData {
    #[serde(default)]
    transcoded_sha256: String,
    #[serde(default)]
    complete: bool,
    #[serde(default)]
    transcoded_info: TranscodeInfo,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TranscodeInfo {
    #[serde(default)]
    duration: u64,
    #[serde(default)]
    file_size: u64,
    #[serde(default)]
    format: String,
    #[serde(default)]
    channels: String,
}

#[derive(Debug, Deserialize)]
struct DevicesResponse {
    #[serde(default)]
    devices: Vec<Device>,
}

#[derive(Debug, Deserialize)]
struct DeviceStatusResponse {
    status: DeviceStatus,
}

#[derive(Debug, Default, Deserialize)]
struct TokenError {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: String,
}

/// Interpret a transcode status body. The data may sit at the root or under
/// `transcode`.
pub fn parse_transcode(body: &Value) -> Result<TranscodeStatus> {
    let data = body.get("transcode").unwrap_or(body);
    let data: TranscodeData = serde_json::from_value(data.clone())?;

    if data.transcoded_sha256.is_empty() && !data.complete {
        return Ok(TranscodeStatus::Pending);
    }

    Ok(TranscodeStatus::Complete(TranscodeResult {
        sha256: data.transcoded_sha256,
        duration: data.transcoded_info.duration,
        file_size: data.transcoded_info.file_size,
        format: data.transcoded_info.format,
        channels: data.transcoded_info.channels,
    }))
}

/// Interpret the error body of a device-code token request.
#[must_use]
pub fn parse_token_error(body: &str) -> TokenPoll {
    let err: TokenError = serde_json::from_str(body).unwrap_or_default();
    match err.error.as_str() {
        "authorization_pending" => TokenPoll::Pending,
        "slow_down" => TokenPoll::SlowDown,
        "" => TokenPoll::Failed(body.to_string()),
        code if err.error_description.is_empty() => TokenPoll::Failed(code.to_string()),
        code => TokenPoll::Failed(format!("{code}: {}", err.error_description)),
    }
}

async fn check(operation: &'static str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    warn!(operation, status = status.as_u16(), "Request failed");
    Err(Error::Upstream {
        operation,
        status: status.as_u16(),
        body,
    })
}

// =============================================================================
// Gateway
// =============================================================================

/// Builder for [`HttpGateway`].
#[derive(Debug, Clone)]
pub struct HttpGatewayBuilder {
    api_base_url: String,
    auth_base_url: String,
    access_token: Option<String>,
    user_agent: String,
    timeout: Duration,
}

impl Default for HttpGatewayBuilder {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            auth_base_url: DEFAULT_AUTH_BASE_URL.to_string(),
            access_token: None,
            user_agent: USER_AGENT.to_string(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl HttpGatewayBuilder {
    /// Library API base URL.
    #[must_use]
    pub fn api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into();
        self
    }

    /// Login service base URL.
    #[must_use]
    pub fn auth_base_url(mut self, url: impl Into<String>) -> Self {
        self.auth_base_url = url.into();
        self
    }

    /// Bearer token for API calls. Empty tokens are ignored.
    #[must_use]
    pub fn access_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.access_token = (!token.is_empty()).then_some(token);
        self
    }

    /// Per-request timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build the gateway.
    pub fn build(self) -> Result<HttpGateway> {
        let client = Client::builder()
            .user_agent(self.user_agent)
            .timeout(self.timeout)
            .build()?;
        Ok(HttpGateway {
            client,
            api_base_url: self.api_base_url.trim_end_matches('/').to_string(),
            auth_base_url: self.auth_base_url.trim_end_matches('/').to_string(),
            access_token: self.access_token,
        })
    }
}

/// Gateway talking to the remote service over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: Client,
    api_base_url: String,
    auth_base_url: String,
    access_token: Option<String>,
}

impl HttpGateway {
    /// Start building a gateway.
    #[must_use]
    pub fn builder() -> HttpGatewayBuilder {
        HttpGatewayBuilder::default()
    }

    /// Same gateway with a different bearer token.
    #[must_use]
    pub fn with_access_token(&self, token: impl Into<String>) -> Self {
        let token = token.into();
        Self {
            access_token: (!token.is_empty()).then_some(token),
            ..self.clone()
        }
    }

    fn api(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.access_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.api_base_url)
    }

    async fn get_json<T: DeserializeOwned>(&self, operation: &'static str, path: &str) -> Result<T> {
        debug!(operation, path, "GET");
        let response = self.api(self.client.get(self.url(path))).send().await?;
        let response = check(operation, response).await?;
        Ok(response.json().await?)
    }

    async fn post_command(&self, operation: &'static str, path: &str, body: Value) -> Result<()> {
        debug!(operation, path, "POST");
        let response = self
            .api(self.client.post(self.url(path)))
            .json(&body)
            .send()
            .await?;
        check(operation, response).await?;
        Ok(())
    }

    async fn post_card(&self, operation: &'static str, card: &Card) -> Result<()> {
        let mut card = card.clone();
        card.sanitize_for_update();
        debug!(operation, card_id = %card.card_id, title = %card.title, "POST /content");
        let response = self
            .api(self.client.post(self.url("/content")))
            .json(&card)
            .send()
            .await?;
        check(operation, response).await?;
        Ok(())
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<Response> {
        let url = format!("{}/oauth/token", self.auth_base_url);
        Ok(self.client.post(url).form(form).send().await?)
    }
}

#[async_trait]
impl LibraryGateway for HttpGateway {
    async fn list_cards(&self) -> Result<Vec<Card>> {
        let library: LibraryResponse = self.get_json("list_cards", "/card/family/library").await?;
        Ok(library
            .cards
            .into_iter()
            .map(|item| {
                let mut card = item.card;
                if card.card_id.is_empty() {
                    card.card_id = item.card_id;
                }
                card
            })
            .collect())
    }

    async fn get_card(&self, card_id: &str) -> Result<Card> {
        let response: CardResponse = self.get_json("get_card", &format!("/card/{card_id}")).await?;
        Ok(response.card)
    }

    async fn create_card(&self, card: &Card) -> Result<()> {
        self.post_card("create_card", card).await
    }

    async fn update_card(&self, card: &Card) -> Result<()> {
        self.post_card("update_card", card).await
    }

    async fn delete_card(&self, card_id: &str) -> Result<()> {
        let response = self
            .api(self.client.delete(self.url(&format!("/content/{card_id}"))))
            .send()
            .await?;
        check("delete_card", response).await?;
        Ok(())
    }

    async fn upload_slot(&self) -> Result<UploadSlot> {
        let response: UploadResponse = self
            .get_json("upload_slot", "/media/transcode/audio/uploadUrl")
            .await?;
        Ok(response.upload)
    }

    async fn upload_file(&self, upload_url: &str, path: &Path) -> Result<()> {
        let bytes = tokio::fs::read(path).await.map_err(|e| Error::FileSystem {
            path: path.to_path_buf(),
            message: format!("Failed to read audio file: {e}"),
        })?;
        debug!(path = %path.display(), bytes = bytes.len(), "Uploading audio");

        let response = self
            .client
            .put(upload_url)
            .header(reqwest::header::CONTENT_TYPE, "audio/mpeg")
            .timeout(TRANSFER_TIMEOUT)
            .body(bytes)
            .send()
            .await?;
        check("upload_file", response).await?;
        Ok(())
    }

    async fn transcode_status(&self, upload_id: &str) -> Result<TranscodeStatus> {
        let body: Value = self
            .get_json(
                "transcode_status",
                &format!("/media/upload/{upload_id}/transcoded"),
            )
            .await?;
        parse_transcode(&body)
    }

    async fn download_file(&self, url: &str, dest: &Path) -> Result<()> {
        let mut request = self.client.get(url).timeout(TRANSFER_TIMEOUT);
        if url.starts_with(&self.api_base_url) {
            request = self.api(request);
        }
        let response = check("download_file", request.send().await?).await?;

        let chunks = stream::try_unfold(response, |mut response| async move {
            Ok::<_, Error>(response.chunk().await?.map(|chunk| (chunk, response)))
        });
        write_stream_to(dest, chunks).await?;

        debug!(url, dest = %dest.display(), "Downloaded file");
        Ok(())
    }

    async fn start_device_auth(&self, client_id: &str) -> Result<DeviceAuthorization> {
        let url = format!("{}/oauth/device/code", self.auth_base_url);
        let response = self
            .client
            .post(url)
            .form(&[
                ("client_id", client_id),
                ("scope", OAUTH_SCOPE),
                ("audience", OAUTH_AUDIENCE),
            ])
            .send()
            .await?;
        let response = check("start_device_auth", response).await?;
        Ok(response.json().await?)
    }

    async fn poll_token(&self, device_code: &str, client_id: &str) -> Result<TokenPoll> {
        let response = self
            .token_request(&[
                ("grant_type", DEVICE_CODE_GRANT),
                ("device_code", device_code),
                ("client_id", client_id),
            ])
            .await?;

        if response.status().is_success() {
            return Ok(TokenPoll::Granted(response.json().await?));
        }
        let body = response.text().await.unwrap_or_default();
        Ok(parse_token_error(&body))
    }

    async fn refresh_token(&self, refresh_token: &str, client_id: &str) -> Result<TokenPair> {
        let response = self
            .token_request(&[
                ("grant_type", "refresh_token"),
                ("client_id", client_id),
                ("refresh_token", refresh_token),
            ])
            .await?;
        let response = check("refresh_token", response).await?;
        Ok(response.json().await?)
    }

    async fn list_devices(&self) -> Result<Vec<Device>> {
        let response: DevicesResponse = self
            .get_json("list_devices", "/device-v2/devices/mine")
            .await?;
        Ok(response.devices)
    }

    async fn device_status(&self, device_id: &str) -> Result<DeviceStatus> {
        let response: DeviceStatusResponse = self
            .get_json("device_status", &format!("/device-v2/{device_id}/status"))
            .await?;
        Ok(response.status)
    }

    async fn set_volume(&self, device_id: &str, level: u8) -> Result<()> {
        self.post_command(
            "set_volume",
            &format!("/device-v2/{device_id}/command/volume/set"),
            json!({ "volume": level }),
        )
        .await
    }

    async fn play_card(&self, device_id: &str, card_id: &str) -> Result<()> {
        self.post_command(
            "play_card",
            &format!("/device-v2/{device_id}/command/card-play"),
            json!({ "cardId": card_id }),
        )
        .await
    }

    async fn stop_player(&self, device_id: &str) -> Result<()> {
        self.post_command(
            "stop_player",
            &format!("/device-v2/{device_id}/command/card-stop"),
            json!({}),
        )
        .await
    }

    async fn pause_player(&self, device_id: &str) -> Result<()> {
        self.post_command(
            "pause_player",
            &format!("/device-v2/{device_id}/command/card-pause"),
            json!({}),
        )
        .await
    }
}

/// Write `chunks` to `dest` through a hidden file in the same directory.
///
/// `dest` only appears once every chunk has been written; a failed transfer
/// leaves nothing behind.
async fn write_stream_to<S, B>(dest: &Path, chunks: S) -> Result<()>
where
    S: Stream<Item = Result<B>>,
    B: AsRef<[u8]>,
{
    let dir = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let partial = tempfile::Builder::new()
        .prefix(".yotocli-download-")
        .tempfile_in(dir)
        .map_err(|e| Error::FileSystem {
            path: dest.to_path_buf(),
            message: format!("Failed to create file: {e}"),
        })?;
    let (file, partial_path) = partial.into_parts();

    let mut file = tokio::fs::File::from_std(file);
    let mut chunks = std::pin::pin!(chunks);
    while let Some(chunk) = chunks.try_next().await? {
        file.write_all(chunk.as_ref()).await?;
    }
    file.flush().await?;
    drop(file);

    partial_path.persist(dest).map_err(|e| Error::FileSystem {
        path: dest.to_path_buf(),
        message: format!("Failed to save file: {}", e.error),
    })?;
    Ok(())
}
