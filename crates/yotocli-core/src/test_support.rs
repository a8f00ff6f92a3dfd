//! Test support shared by unit and integration tests.
//!
//! [`InMemoryGateway`] keeps a whole library in memory and implements
//! [`LibraryGateway`] without any network, so the engine can be driven end to
//! end. [`RecordingSleeper`] stands in for the real timer in polling loops.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::Sleeper;
use crate::error::{Error, Result};
use crate::gateway::{
    DeviceAuthorization, LibraryGateway, TokenPair, TokenPoll, TranscodeResult, TranscodeStatus,
    UploadSlot,
};
use crate::model::{Card, Device, DeviceStatus};

/// Sleeper that returns immediately and remembers every requested delay.
#[derive(Debug, Clone, Default)]
pub struct RecordingSleeper {
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays requested so far, in order.
    #[must_use]
    pub fn sleeps(&self) -> Vec<Duration> {
        lock(&self.sleeps).clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        lock(&self.sleeps).push(duration);
        tokio::task::yield_now().await;
    }
}

/// A player command received by [`InMemoryGateway`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    /// `play_card`
    Play {
        /// Target player.
        device_id: String,
        /// Card started.
        card_id: String,
    },
    /// `stop_player`
    Stop {
        /// Target player.
        device_id: String,
    },
    /// `pause_player`
    Pause {
        /// Target player.
        device_id: String,
    },
    /// `set_volume`
    Volume {
        /// Target player.
        device_id: String,
        /// Requested level.
        level: u8,
    },
}

#[derive(Debug, Default)]
struct State {
    cards: Vec<Card>,
    next_card: u32,
    next_upload: u32,
    uploads: HashMap<String, PathBuf>,
    upload_sizes: HashMap<String, u64>,
    transcode_delays: HashMap<String, Duration>,
    failing_uploads: HashSet<String>,
    failing_updates: HashSet<String>,
    token_polls: VecDeque<TokenPoll>,
    devices: Vec<(Device, Option<DeviceStatus>)>,
    commands: Vec<DeviceCommand>,
    calls: Vec<String>,
    in_flight: usize,
    peak_in_flight: usize,
}

/// In-memory remote library.
#[derive(Debug, Clone, Default)]
pub struct InMemoryGateway {
    state: Arc<Mutex<State>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn upstream(operation: &'static str, status: u16, body: impl Into<String>) -> Error {
    Error::Upstream {
        operation,
        status,
        body: body.into(),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl InMemoryGateway {
    /// Empty library without devices.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    /// Store a card, assigning an ID when it has none. Returns the ID.
    pub fn insert_card(&self, mut card: Card) -> String {
        let mut state = self.state();
        if card.card_id.is_empty() {
            state.next_card += 1;
            card.card_id = format!("card-{}", state.next_card);
        }
        let id = card.card_id.clone();
        state.cards.push(card);
        id
    }

    /// Register a player with an optional live status.
    pub fn insert_device(&self, device: Device, status: Option<DeviceStatus>) {
        self.state().devices.push((device, status));
    }

    /// Delay the transcode of the file with this name.
    pub fn set_transcode_delay(&self, file_name: &str, delay: Duration) {
        self.state()
            .transcode_delays
            .insert(file_name.to_string(), delay);
    }

    /// Make uploads of the file with this name fail.
    pub fn fail_upload(&self, file_name: &str) {
        self.state().failing_uploads.insert(file_name.to_string());
    }

    /// Make updates of this card fail.
    pub fn fail_update(&self, card_id: &str) {
        self.state().failing_updates.insert(card_id.to_string());
    }

    /// Queue a response for the next `poll_token` call.
    pub fn push_token_poll(&self, poll: TokenPoll) {
        self.state().token_polls.push_back(poll);
    }

    /// Snapshot of every stored card.
    #[must_use]
    pub fn cards(&self) -> Vec<Card> {
        self.state().cards.clone()
    }

    /// Snapshot of one stored card.
    #[must_use]
    pub fn card(&self, card_id: &str) -> Option<Card> {
        self.state()
            .cards
            .iter()
            .find(|c| c.card_id == card_id)
            .cloned()
    }

    /// Gateway operations performed so far, as `"operation:argument"`.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Player commands received so far.
    #[must_use]
    pub fn commands(&self) -> Vec<DeviceCommand> {
        self.state().commands.clone()
    }

    /// Number of uploads started.
    #[must_use]
    pub fn upload_count(&self) -> usize {
        self.state().uploads.len()
    }

    /// Highest number of transcodes awaited at the same time.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.state().peak_in_flight
    }

    fn record(&self, call: String) {
        self.state().calls.push(call);
    }
}

#[async_trait]
impl LibraryGateway for InMemoryGateway {
    async fn list_cards(&self) -> Result<Vec<Card>> {
        self.record("list_cards".to_string());
        Ok(self
            .state()
            .cards
            .iter()
            .map(|c| Card {
                content: None,
                ..c.clone()
            })
            .collect())
    }

    async fn get_card(&self, card_id: &str) -> Result<Card> {
        self.record(format!("get_card:{card_id}"));
        self.card(card_id)
            .ok_or_else(|| upstream("get_card", 404, "card not found"))
    }

    async fn create_card(&self, card: &Card) -> Result<()> {
        self.record(format!("create_card:{}", card.title));
        if card.is_persisted() {
            return Err(upstream("create_card", 400, "new cards must not carry an ID"));
        }
        self.insert_card(card.clone());
        Ok(())
    }

    async fn update_card(&self, card: &Card) -> Result<()> {
        self.record(format!("update_card:{}", card.card_id));
        let mut state = self.state();
        if state.failing_updates.contains(&card.card_id) {
            return Err(upstream("update_card", 500, "update rejected"));
        }
        match state.cards.iter_mut().find(|c| c.card_id == card.card_id) {
            Some(existing) => *existing = card.clone(),
            None => state.cards.push(card.clone()),
        }
        Ok(())
    }

    async fn delete_card(&self, card_id: &str) -> Result<()> {
        self.record(format!("delete_card:{card_id}"));
        let mut state = self.state();
        let before = state.cards.len();
        state.cards.retain(|c| c.card_id != card_id);
        if state.cards.len() == before {
            return Err(upstream("delete_card", 404, "card not found"));
        }
        Ok(())
    }

    async fn upload_slot(&self) -> Result<UploadSlot> {
        let mut state = self.state();
        state.next_upload += 1;
        let upload_id = format!("upload-{}", state.next_upload);
        Ok(UploadSlot {
            upload_url: format!("memory://uploads/{upload_id}"),
            upload_id,
        })
    }

    async fn upload_file(&self, upload_url: &str, path: &Path) -> Result<()> {
        let name = file_name(path);
        let upload_id = upload_url.rsplit('/').next().unwrap_or_default().to_string();
        let size = std::fs::metadata(path)?.len();

        let mut state = self.state();
        state.calls.push(format!("upload_file:{name}"));
        state.uploads.insert(upload_id.clone(), path.to_path_buf());
        if state.failing_uploads.contains(&name) {
            return Err(upstream("upload_file", 500, format!("upload of {name} rejected")));
        }
        state.upload_sizes.insert(upload_id, size);
        Ok(())
    }

    async fn transcode_status(&self, upload_id: &str) -> Result<TranscodeStatus> {
        let (path, size, delay) = {
            let mut state = self.state();
            let path = state
                .uploads
                .get(upload_id)
                .cloned()
                .ok_or_else(|| upstream("transcode_status", 404, "unknown upload"))?;
            let size = state.upload_sizes.get(upload_id).copied().unwrap_or(0);
            let delay = state.transcode_delays.get(&file_name(&path)).copied();
            state.in_flight += 1;
            state.peak_in_flight = state.peak_in_flight.max(state.in_flight);
            (path, size, delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        } else {
            tokio::task::yield_now().await;
        }

        self.state().in_flight -= 1;

        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(TranscodeStatus::Complete(TranscodeResult {
            sha256: format!("sha-{stem}"),
            duration: 60,
            file_size: size,
            format: "aac".to_string(),
            channels: "stereo".to_string(),
        }))
    }

    async fn download_file(&self, url: &str, dest: &Path) -> Result<()> {
        self.record(format!("download_file:{url}"));
        tokio::fs::write(dest, url.as_bytes()).await?;
        Ok(())
    }

    async fn start_device_auth(&self, client_id: &str) -> Result<DeviceAuthorization> {
        self.record(format!("start_device_auth:{client_id}"));
        Ok(DeviceAuthorization {
            device_code: "device-code".to_string(),
            user_code: "ABCD-EFGH".to_string(),
            verification_uri: "https://login.example/activate".to_string(),
            verification_uri_complete: None,
            interval: 5,
            expires_in: 900,
        })
    }

    async fn poll_token(&self, device_code: &str, _client_id: &str) -> Result<TokenPoll> {
        self.record(format!("poll_token:{device_code}"));
        Ok(self
            .state()
            .token_polls
            .pop_front()
            .unwrap_or_else(|| TokenPoll::Failed("expired_token".to_string())))
    }

    async fn refresh_token(&self, refresh_token: &str, _client_id: &str) -> Result<TokenPair> {
        self.record(format!("refresh_token:{refresh_token}"));
        if refresh_token.is_empty() || refresh_token == "revoked" {
            return Err(upstream("refresh_token", 401, "invalid_grant"));
        }
        Ok(TokenPair {
            access_token: format!("access-from-{refresh_token}"),
            refresh_token: format!("{refresh_token}-next"),
        })
    }

    async fn list_devices(&self) -> Result<Vec<Device>> {
        Ok(self.state().devices.iter().map(|(d, _)| d.clone()).collect())
    }

    async fn device_status(&self, device_id: &str) -> Result<DeviceStatus> {
        self.state()
            .devices
            .iter()
            .find(|(d, _)| d.id == device_id)
            .and_then(|(_, s)| s.clone())
            .ok_or_else(|| upstream("device_status", 503, "device unreachable"))
    }

    async fn set_volume(&self, device_id: &str, level: u8) -> Result<()> {
        self.state().commands.push(DeviceCommand::Volume {
            device_id: device_id.to_string(),
            level,
        });
        Ok(())
    }

    async fn play_card(&self, device_id: &str, card_id: &str) -> Result<()> {
        self.state().commands.push(DeviceCommand::Play {
            device_id: device_id.to_string(),
            card_id: card_id.to_string(),
        });
        Ok(())
    }

    async fn stop_player(&self, device_id: &str) -> Result<()> {
        self.state().commands.push(DeviceCommand::Stop {
            device_id: device_id.to_string(),
        });
        Ok(())
    }

    async fn pause_player(&self, device_id: &str) -> Result<()> {
        self.state().commands.push(DeviceCommand::Pause {
            device_id: device_id.to_string(),
        });
        Ok(())
    }
}
