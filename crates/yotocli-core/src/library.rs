//! High-level library actions.
//!
//! Every action reads the current state from the gateway, applies the change
//! locally through the resolver and the mutation engine, and writes the result
//! back. Nothing is cached between actions.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use futures::{StreamExt, TryStreamExt, stream};
use tracing::{debug, info, warn};

use crate::batch::{BATCH_CONCURRENCY, BatchIngestor, collect_audio_files};
use crate::error::{EntityKind, Error, Result};
use crate::gateway::LibraryGateway;
use crate::model::{Card, Chapter, Device, DeviceStatus, Track};
use crate::playlist;
use crate::processing::{AudioDownloader, DownloadedAudio};
use crate::resolver::{LibraryPath, resolve_card, resolve_chapter, resolve_device};
use crate::upload::{ProgressFn, UploadPipeline};

/// Highest accepted volume level.
pub const MAX_VOLUME: u8 = 100;

/// Strip characters that are not allowed in file names on common platforms.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*'))
        .filter(|c| !c.is_control())
        .collect()
}

/// Where a single added track ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddOutcome {
    /// Card the track was placed in.
    pub card_title: String,
    /// Whether the card was created by this action.
    pub created: bool,
    /// 1-based position of the new chapter.
    pub position: usize,
    /// Title of the new chapter.
    pub track_title: String,
}

/// What [`Library::remove`] deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removed {
    /// The whole card.
    Card {
        /// Card title.
        title: String,
    },
    /// One chapter of a card.
    Chapter {
        /// Card title.
        card_title: String,
        /// Removed chapter title.
        title: String,
    },
}

/// Result of a move or copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Chapter title.
    pub title: String,
    /// Card the chapter came from.
    pub source_card: String,
    /// Card the chapter landed in.
    pub destination_card: String,
    /// 1-based position in the destination.
    pub position: usize,
}

/// Requested metadata changes for [`Library::edit`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditRequest {
    /// New card or chapter title.
    pub name: Option<String>,
    /// New card author.
    pub author: Option<String>,
    /// New card description.
    pub description: Option<String>,
}

impl EditRequest {
    fn is_empty(&self) -> bool {
        self.name.is_none() && self.author.is_none() && self.description.is_none()
    }
}

/// A player and, when reachable, its live status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceOverview {
    /// The player.
    pub device: Device,
    /// Live status, `None` when the status request failed.
    pub status: Option<DeviceStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transfer {
    Move,
    Copy,
}

/// Entry point for everything the shell does with the remote library.
#[derive(Clone)]
pub struct Library {
    gateway: Arc<dyn LibraryGateway>,
    pipeline: UploadPipeline,
    downloader: Arc<dyn AudioDownloader>,
}

impl std::fmt::Debug for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Library")
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

impl Library {
    /// Build a library over the pipeline's gateway.
    pub fn new(pipeline: UploadPipeline, downloader: Arc<dyn AudioDownloader>) -> Self {
        Self {
            gateway: Arc::clone(pipeline.gateway()),
            pipeline,
            downloader,
        }
    }

    /// The gateway every action goes through.
    #[must_use]
    pub fn gateway(&self) -> &Arc<dyn LibraryGateway> {
        &self.gateway
    }

    // =========================================================================
    // Reading
    // =========================================================================

    /// All cards, without content.
    pub async fn list_cards(&self) -> Result<Vec<Card>> {
        let cards = self.gateway.list_cards().await?;
        debug!(count = cards.len(), "Listed cards");
        Ok(cards)
    }

    /// Resolve a card and fetch it with its content.
    pub async fn show_card(&self, query: &str) -> Result<Card> {
        let cards = self.gateway.list_cards().await?;
        let summary = resolve_card(&cards, query)?;
        self.gateway.get_card(&summary.card_id).await
    }

    /// Resolve a chapter inside a card. Returns the card, the 1-based position
    /// and the chapter.
    pub async fn show_chapter(
        &self,
        card_query: &str,
        chapter_query: &str,
    ) -> Result<(Card, usize, Chapter)> {
        let card = self.show_card(card_query).await?;
        let (index, chapter) = resolve_chapter(&card, chapter_query)?;
        let chapter = chapter.clone();
        Ok((card, index + 1, chapter))
    }

    async fn target_card(&self, query: &str, create_missing: bool) -> Result<(Card, bool)> {
        let cards = self.gateway.list_cards().await?;
        match resolve_card(&cards, query) {
            Ok(summary) => Ok((self.gateway.get_card(&summary.card_id).await?, false)),
            Err(Error::NotFound { .. }) if create_missing => {
                info!(title = query, "Card not found, creating it");
                Ok((Card::empty(query), true))
            }
            Err(e) => Err(e),
        }
    }

    async fn persist(&self, card: &Card) -> Result<()> {
        if card.is_persisted() {
            self.gateway.update_card(card).await
        } else {
            self.gateway.create_card(card).await
        }
    }

    // =========================================================================
    // Adding
    // =========================================================================

    /// Upload `file` and place it in the card named by `target`
    /// (`Playlist` or `Playlist/position`). A non-numeric or out-of-range
    /// position appends.
    pub async fn add_track(
        &self,
        target: &str,
        file: &Path,
        normalize: bool,
        create_missing: bool,
        progress: Option<&ProgressFn>,
    ) -> Result<AddOutcome> {
        let path = LibraryPath::parse(target);
        let position = path.position().unwrap_or(0);

        // Resolve before uploading so a bad target costs no transfer
        let (card, created) = self.target_card(&path.card, create_missing).await?;
        let ingested = self.pipeline.ingest(file, normalize, progress).await?;

        self.place(card, created, ingested.track, position).await
    }

    async fn place(
        &self,
        mut card: Card,
        created: bool,
        track: Track,
        position: i64,
    ) -> Result<AddOutcome> {
        let chapter = playlist::build_chapter(track);
        let track_title = chapter.title.clone();
        let landed = playlist::insert(&mut card, chapter, position);
        self.persist(&card).await?;

        info!(card = %card.title, track = %track_title, position = landed, created, "Track added");
        Ok(AddOutcome {
            card_title: card.title,
            created,
            position: landed,
            track_title,
        })
    }

    /// Download `url` and add it as a new track.
    ///
    /// With a `playlist` the track goes into that card (created when missing).
    /// Without one a new card titled after the download is created. The
    /// downloaded file is removed afterwards either way.
    pub async fn import_url(
        &self,
        url: &str,
        playlist: Option<&str>,
        normalize: bool,
        progress: Option<&ProgressFn>,
    ) -> Result<AddOutcome> {
        let downloaded = self.downloader.download(url).await?;
        info!(url, title = %downloaded.title, path = %downloaded.path.display(), "Downloaded audio");

        let result = self
            .import_downloaded(&downloaded, playlist, normalize, progress)
            .await;

        if let Err(e) = tokio::fs::remove_file(&downloaded.path).await {
            warn!(path = %downloaded.path.display(), error = %e, "Failed to remove downloaded file");
        }
        result
    }

    async fn import_downloaded(
        &self,
        downloaded: &DownloadedAudio,
        playlist: Option<&str>,
        normalize: bool,
        progress: Option<&ProgressFn>,
    ) -> Result<AddOutcome> {
        let (card, created, position) = match playlist {
            Some(target) => {
                let path = LibraryPath::parse(target);
                let (card, created) = self.target_card(&path.card, true).await?;
                (card, created, path.position().unwrap_or(0))
            }
            None => (Card::empty(downloaded.title.clone()), true, 0),
        };

        let mut ingested = self
            .pipeline
            .ingest(&downloaded.path, normalize, progress)
            .await?;
        ingested.track.title.clone_from(&downloaded.title);

        self.place(card, created, ingested.track, position).await
    }

    /// Batch-ingest every audio file in `dir` into a new card.
    ///
    /// The card is named `name`, or after the directory.
    pub async fn create_from_directory(
        &self,
        dir: &Path,
        name: Option<&str>,
        normalize: bool,
        progress: Option<&ProgressFn>,
    ) -> Result<Card> {
        let files = collect_audio_files(dir)?;
        if files.is_empty() {
            return Err(Error::InvalidInput(format!(
                "no audio files found in {}",
                dir.display()
            )));
        }

        let title = name.map_or_else(
            || {
                dir.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            },
            ToString::to_string,
        );
        info!(title = %title, files = files.len(), "Creating card from directory");

        let tracks = BatchIngestor::new(self.pipeline.clone())
            .ingest(&files, normalize, progress)
            .await?;

        let mut card = Card::empty(title);
        playlist::append_tracks(&mut card, tracks.into_iter().map(|t| t.track));
        self.gateway.create_card(&card).await?;

        info!(title = %card.title, chapters = card.chapters().len(), "Card created");
        Ok(card)
    }

    // =========================================================================
    // Editing
    // =========================================================================

    /// Delete a whole card (`Playlist`) or one chapter (`Playlist/Track`).
    pub async fn remove(&self, query: &str) -> Result<Removed> {
        let path = LibraryPath::parse(query);
        let cards = self.gateway.list_cards().await?;
        let summary = resolve_card(&cards, &path.card)?;

        let Some(chapter_query) = path.chapter else {
            self.gateway.delete_card(&summary.card_id).await?;
            info!(card = %summary.title, "Card deleted");
            return Ok(Removed::Card {
                title: summary.title.clone(),
            });
        };

        let mut card = self.gateway.get_card(&summary.card_id).await?;
        let (index, _) = resolve_chapter(&card, &chapter_query)?;
        let removed = playlist::remove(&mut card, position_of(index))?;
        self.gateway.update_card(&card).await?;

        info!(card = %card.title, chapter = %removed.title, "Chapter removed");
        Ok(Removed::Chapter {
            card_title: card.title,
            title: removed.title,
        })
    }

    /// Move `Playlist/Track` to `Playlist[/position]` or, within the same
    /// card, to a bare position.
    pub async fn move_track(&self, src: &str, dst: &str) -> Result<TransferOutcome> {
        self.transfer(src, dst, Transfer::Move).await
    }

    /// Copy `Playlist/Track` to `Playlist[/position]`. The destination card
    /// must exist.
    pub async fn copy_track(&self, src: &str, dst: &str) -> Result<TransferOutcome> {
        self.transfer(src, dst, Transfer::Copy).await
    }

    async fn transfer(&self, src: &str, dst: &str, mode: Transfer) -> Result<TransferOutcome> {
        let src_path = LibraryPath::parse(src);
        let Some(chapter_query) = src_path.chapter.as_deref() else {
            return Err(Error::InvalidInput(format!(
                "source must be Playlist/Track, got '{src}'"
            )));
        };

        let cards = self.gateway.list_cards().await?;
        let src_summary = resolve_card(&cards, &src_path.card)?;
        let mut src_card = self.gateway.get_card(&src_summary.card_id).await?;
        let (index, chapter) = resolve_chapter(&src_card, chapter_query)?;
        let title = chapter.title.clone();
        let src_index = position_of(index);

        let dst_path = LibraryPath::parse(dst);
        let dst_position = dst_path.position().unwrap_or(0);

        let dst_id = match resolve_card(&cards, &dst_path.card) {
            Ok(summary) => summary.card_id.clone(),
            Err(Error::NotFound { .. }) if mode == Transfer::Move && dst_path.chapter.is_none() => {
                // A bare number that names no card is a position in the source card
                let Ok(position) = dst.trim().parse::<i64>() else {
                    return Err(Error::not_found(EntityKind::Card, dst_path.card));
                };
                return self
                    .transfer_within(src_card, src_index, position, mode, title)
                    .await;
            }
            Err(e) => return Err(e),
        };

        if dst_id == src_card.card_id {
            return self
                .transfer_within(src_card, src_index, dst_position, mode, title)
                .await;
        }

        let mut dst_card = self.gateway.get_card(&dst_id).await?;
        let landed = match mode {
            Transfer::Move => {
                let landed =
                    playlist::move_between(&mut src_card, src_index, &mut dst_card, dst_position)?;
                // Source first, then destination; a failure in between is not rolled back
                self.gateway.update_card(&src_card).await?;
                self.gateway.update_card(&dst_card).await?;
                landed
            }
            Transfer::Copy => {
                let landed =
                    playlist::copy_between(&src_card, src_index, &mut dst_card, dst_position)?;
                self.gateway.update_card(&dst_card).await?;
                landed
            }
        };

        info!(
            chapter = %title,
            from = %src_card.title,
            to = %dst_card.title,
            position = landed,
            ?mode,
            "Chapter transferred"
        );
        Ok(TransferOutcome {
            title,
            source_card: src_card.title,
            destination_card: dst_card.title,
            position: landed,
        })
    }

    async fn transfer_within(
        &self,
        mut card: Card,
        src_index: i64,
        dst_position: i64,
        mode: Transfer,
        title: String,
    ) -> Result<TransferOutcome> {
        let landed = match mode {
            Transfer::Move => playlist::move_within(&mut card, src_index, dst_position)?,
            Transfer::Copy => playlist::copy_within(&mut card, src_index, dst_position)?,
        };
        self.gateway.update_card(&card).await?;

        info!(chapter = %title, card = %card.title, position = landed, ?mode, "Chapter transferred within card");
        Ok(TransferOutcome {
            title,
            source_card: card.title.clone(),
            destination_card: card.title,
            position: landed,
        })
    }

    /// Shift `Playlist/Track` by `delta` places (negative moves up).
    pub async fn move_relative(&self, query: &str, delta: i64) -> Result<TransferOutcome> {
        let path = LibraryPath::parse(query);
        let Some(chapter_query) = path.chapter.as_deref() else {
            return Err(Error::InvalidInput(format!(
                "expected Playlist/Track, got '{query}'"
            )));
        };

        let mut card = self.show_card(&path.card).await?;
        let (index, chapter) = resolve_chapter(&card, chapter_query)?;
        let title = chapter.title.clone();
        let landed = playlist::move_relative(&mut card, position_of(index), delta)?;
        self.gateway.update_card(&card).await?;

        info!(chapter = %title, card = %card.title, delta, position = landed, "Chapter shifted");
        Ok(TransferOutcome {
            title,
            source_card: card.title.clone(),
            destination_card: card.title,
            position: landed,
        })
    }

    /// Change card title, author or description, or a chapter title.
    ///
    /// Author and description do not apply to chapters and are ignored there.
    pub async fn edit(&self, query: &str, changes: &EditRequest) -> Result<Card> {
        if changes.is_empty() {
            return Err(Error::InvalidInput(
                "no changes specified: use --name, --author, or --description".to_string(),
            ));
        }

        let path = LibraryPath::parse(query);
        let mut card = self.show_card(&path.card).await?;

        match path.chapter.as_deref() {
            Some(chapter_query) => {
                let (index, _) = resolve_chapter(&card, chapter_query)?;
                if changes.author.is_some() || changes.description.is_some() {
                    warn!("Author and description apply to playlists only, ignoring them");
                }
                let Some(name) = changes.name.as_deref() else {
                    return Ok(card);
                };
                playlist::rename_chapter(&mut card, position_of(index), name)?;
                info!(card = %card.title, position = index + 1, title = name, "Chapter renamed");
            }
            None => {
                if let Some(name) = &changes.name {
                    card.title.clone_from(name);
                }
                if let Some(author) = &changes.author {
                    card.metadata_mut().author.clone_from(author);
                }
                if let Some(description) = &changes.description {
                    card.metadata_mut().description.clone_from(description);
                }
                info!(card = %card.title, "Card details updated");
            }
        }

        self.gateway.update_card(&card).await?;
        Ok(card)
    }

    // =========================================================================
    // Downloading
    // =========================================================================

    /// Download one chapter to a file, or a whole card to a directory.
    ///
    /// A single chapter defaults to `<track title>.mp3` in the working
    /// directory and goes inside `dest` when that is a directory. A card
    /// defaults to a directory named after it, holding one `NN - Title.mp3`
    /// per chapter. Returns the written files in chapter order, none for an
    /// empty card.
    pub async fn download(&self, query: &str, dest: Option<&Path>) -> Result<Vec<PathBuf>> {
        let path = LibraryPath::parse(query);
        let card = self.show_card(&path.card).await?;

        if let Some(chapter_query) = path.chapter.as_deref() {
            let (_, chapter) = resolve_chapter(&card, chapter_query)?;
            let track = chapter.first_track().ok_or_else(|| {
                Error::InvalidInput(format!("track '{}' has no audio", chapter.title))
            })?;

            let title = if track.title.is_empty() { &chapter.title } else { &track.title };
            let file_name = format!("{}.mp3", sanitize_filename(title));
            let target = match dest {
                Some(d) if d.is_dir() => d.join(file_name),
                Some(d) => d.to_path_buf(),
                None => PathBuf::from(file_name),
            };

            self.gateway.download_file(&track.track_url, &target).await?;
            info!(chapter = %chapter.title, path = %target.display(), "Track downloaded");
            return Ok(vec![target]);
        }

        if card.chapters().is_empty() {
            info!(card = %card.title, "Nothing to download");
            return Ok(Vec::new());
        }

        let dir = dest.map_or_else(|| PathBuf::from(sanitize_filename(&card.title)), Path::to_path_buf);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::FileSystem {
                path: dir.clone(),
                message: format!("Failed to create download directory: {e}"),
            })?;

        let jobs: Vec<(String, PathBuf)> = card
            .chapters()
            .iter()
            .enumerate()
            .filter_map(|(i, chapter)| {
                let Some(track) = chapter.first_track() else {
                    warn!(chapter = %chapter.title, "Skipping track without audio");
                    return None;
                };
                let name = format!("{:02} - {}.mp3", i + 1, sanitize_filename(&chapter.title));
                Some((track.track_url.clone(), dir.join(name)))
            })
            .collect();

        info!(card = %card.title, files = jobs.len(), dir = %dir.display(), "Downloading card");
        let files: Vec<PathBuf> = stream::iter(jobs)
            .map(|(url, target)| async move {
                self.gateway.download_file(&url, &target).await?;
                debug!(path = %target.display(), "Downloaded");
                Ok::<_, Error>(target)
            })
            .buffered(BATCH_CONCURRENCY)
            .try_collect()
            .await?;

        Ok(files)
    }

    // =========================================================================
    // Devices
    // =========================================================================

    /// Every player with its live status, fetched concurrently.
    pub async fn devices_with_status(&self) -> Result<Vec<DeviceOverview>> {
        let devices = self.gateway.list_devices().await?;
        let statuses = join_all(devices.iter().map(|d| self.gateway.device_status(&d.id))).await;

        Ok(devices
            .into_iter()
            .zip(statuses)
            .map(|(device, status)| {
                let status = match status {
                    Ok(status) => Some(status),
                    Err(e) => {
                        warn!(device = %device.name, error = %e, "Failed to fetch device status");
                        None
                    }
                };
                DeviceOverview { device, status }
            })
            .collect())
    }

    async fn pick_device(&self, device: Option<&str>) -> Result<Device> {
        let devices = self.gateway.list_devices().await?;
        if devices.is_empty() {
            return Err(Error::InvalidInput("no devices found".to_string()));
        }
        resolve_device(&devices, device).cloned()
    }

    /// Start playing a card on a player.
    pub async fn play(&self, card_query: &str, device: Option<&str>) -> Result<(Card, Device)> {
        let cards = self.gateway.list_cards().await?;
        let card = resolve_card(&cards, card_query)?.clone();
        let device = self.pick_device(device).await?;

        self.gateway.play_card(&device.id, &card.card_id).await?;
        info!(card = %card.title, device = %device.name, "Playback started");
        Ok((card, device))
    }

    /// Stop playback on a player.
    pub async fn stop(&self, device: Option<&str>) -> Result<Device> {
        let device = self.pick_device(device).await?;
        self.gateway.stop_player(&device.id).await?;
        info!(device = %device.name, "Playback stopped");
        Ok(device)
    }

    /// Pause playback on a player.
    pub async fn pause(&self, device: Option<&str>) -> Result<Device> {
        let device = self.pick_device(device).await?;
        self.gateway.pause_player(&device.id).await?;
        info!(device = %device.name, "Playback paused");
        Ok(device)
    }

    /// Set the volume of a player, `0..=100`.
    pub async fn set_volume(&self, level: u8, device: Option<&str>) -> Result<Device> {
        if level > MAX_VOLUME {
            return Err(Error::InvalidInput(format!(
                "volume must be between 0 and {MAX_VOLUME}, got {level}"
            )));
        }
        let device = self.pick_device(device).await?;
        self.gateway.set_volume(&device.id, level).await?;
        info!(device = %device.name, level, "Volume set");
        Ok(device)
    }
}

fn position_of(index: usize) -> i64 {
    i64::try_from(index).map_or(i64::MAX, |i| i + 1)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::model::Display;
    use crate::processing::{MockAudioDownloader, MockAudioNormalizer};
    use crate::test_support::{DeviceCommand, InMemoryGateway, RecordingSleeper};

    fn chapter(title: &str) -> Chapter {
        playlist::build_chapter(Track {
            title: title.to_string(),
            track_url: format!("yoto:#{title}"),
            duration: 10,
            display: Display::with_icon("yoto:#icon"),
            ..Track::default()
        })
    }

    fn card(title: &str, chapters: &[&str]) -> Card {
        let mut card = Card::empty(title);
        for c in chapters {
            playlist::insert(&mut card, chapter(c), 0);
        }
        card
    }

    fn library(gateway: &InMemoryGateway) -> Library {
        library_with_downloader(gateway, MockAudioDownloader::new())
    }

    fn library_with_downloader(gateway: &InMemoryGateway, downloader: MockAudioDownloader) -> Library {
        let mut normalizer = MockAudioNormalizer::new();
        normalizer.expect_normalize().never();
        let pipeline = UploadPipeline::new(Arc::new(gateway.clone()), Arc::new(normalizer))
            .with_sleeper(Arc::new(RecordingSleeper::new()));
        Library::new(pipeline, Arc::new(downloader))
    }

    fn titles(card: &Card) -> Vec<String> {
        card.chapters().iter().map(|c| c.title.clone()).collect()
    }

    fn updates(gateway: &InMemoryGateway) -> Vec<String> {
        gateway
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("update_card") || c.starts_with("create_card"))
            .collect()
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("a<b>c:d\"e/f\\g|h?i*j"), "abcdefghij");
        assert_eq!(sanitize_filename("tab\there\n"), "tabhere");
        assert_eq!(sanitize_filename("Plain Name 01"), "Plain Name 01");
    }

    #[tokio::test]
    async fn test_show_chapter_by_title() {
        let gateway = InMemoryGateway::new();
        gateway.insert_card(card("Bedtime", &["Moon", "Stars"]));

        let (card, position, chapter) = library(&gateway)
            .show_chapter("bed", "stars")
            .await
            .unwrap();
        assert_eq!(card.title, "Bedtime");
        assert_eq!(position, 2);
        assert_eq!(chapter.title, "Stars");
    }

    #[tokio::test]
    async fn test_add_track_at_position() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("Owls.mp3");
        std::fs::write(&file, b"audio").unwrap();

        let gateway = InMemoryGateway::new();
        let id = gateway.insert_card(card("Bedtime", &["Moon", "Stars"]));

        let outcome = library(&gateway)
            .add_track("Bedtime/1", &file, false, false, None)
            .await
            .unwrap();

        assert_eq!(outcome.position, 1);
        assert!(!outcome.created);
        let stored = gateway.card(&id).unwrap();
        assert_eq!(titles(&stored), ["Owls", "Moon", "Stars"]);
        assert_eq!(stored.chapters()[0].tracks[0].track_url, "yoto:#sha-Owls");
        assert_eq!(updates(&gateway), [format!("update_card:{id}")]);
    }

    #[tokio::test]
    async fn test_add_track_bad_position_appends() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("Owls.mp3");
        std::fs::write(&file, b"audio").unwrap();

        let gateway = InMemoryGateway::new();
        let id = gateway.insert_card(card("Bedtime", &["Moon"]));

        let outcome = library(&gateway)
            .add_track("Bedtime/soon", &file, false, false, None)
            .await
            .unwrap();
        assert_eq!(outcome.position, 2);
        assert_eq!(titles(&gateway.card(&id).unwrap()), ["Moon", "Owls"]);
    }

    #[tokio::test]
    async fn test_add_track_missing_card() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("Owls.mp3");
        std::fs::write(&file, b"audio").unwrap();
        let gateway = InMemoryGateway::new();

        let err = library(&gateway)
            .add_track("Nowhere", &file, false, false, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: EntityKind::Card, .. }));
        assert_eq!(gateway.upload_count(), 0);

        let outcome = library(&gateway)
            .add_track("Nowhere", &file, false, true, None)
            .await
            .unwrap();
        assert!(outcome.created);
        assert_eq!(updates(&gateway), ["create_card:Nowhere"]);
    }

    #[tokio::test]
    async fn test_import_without_playlist_creates_card() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("yotocli-import-abc.mp3");
        std::fs::write(&file, b"audio").unwrap();

        let mut downloader = MockAudioDownloader::new();
        let downloaded = file.clone();
        downloader
            .expect_download()
            .withf(|url| url == "https://video.example/abc")
            .returning(move |_| {
                Ok(DownloadedAudio {
                    path: downloaded.clone(),
                    title: "The Owl Song".to_string(),
                })
            });

        let gateway = InMemoryGateway::new();
        let outcome = library_with_downloader(&gateway, downloader)
            .import_url("https://video.example/abc", None, false, None)
            .await
            .unwrap();

        assert!(outcome.created);
        assert_eq!(outcome.card_title, "The Owl Song");
        assert_eq!(outcome.track_title, "The Owl Song");
        let stored = &gateway.cards()[0];
        assert_eq!(stored.chapters()[0].tracks[0].title, "The Owl Song");
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn test_import_into_existing_playlist() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("yotocli-import-xyz.mp3");
        std::fs::write(&file, b"audio").unwrap();

        let mut downloader = MockAudioDownloader::new();
        let downloaded = file.clone();
        downloader.expect_download().returning(move |_| {
            Ok(DownloadedAudio {
                path: downloaded.clone(),
                title: "Lullaby".to_string(),
            })
        });

        let gateway = InMemoryGateway::new();
        let id = gateway.insert_card(card("Bedtime", &["Moon"]));

        library_with_downloader(&gateway, downloader)
            .import_url("https://video.example/xyz", Some("Bedtime"), false, None)
            .await
            .unwrap();

        assert_eq!(titles(&gateway.card(&id).unwrap()), ["Moon", "Lullaby"]);
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn test_create_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["02 Two.mp3", "01 One.mp3", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"audio").unwrap();
        }

        let gateway = InMemoryGateway::new();
        let card = library(&gateway)
            .create_from_directory(dir.path(), Some("Numbers"), false, None)
            .await
            .unwrap();

        assert_eq!(card.title, "Numbers");
        assert_eq!(titles(&card), ["01 One", "02 Two"]);
        assert_eq!(gateway.cards().len(), 1);
    }

    #[tokio::test]
    async fn test_create_from_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = InMemoryGateway::new();

        let err = library(&gateway)
            .create_from_directory(dir.path(), None, false, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(gateway.cards().is_empty());
    }

    #[tokio::test]
    async fn test_remove_chapter_and_card() {
        let gateway = InMemoryGateway::new();
        let id = gateway.insert_card(card("Bedtime", &["Moon", "Stars"]));
        let lib = library(&gateway);

        let removed = lib.remove("Bedtime/moon").await.unwrap();
        assert_eq!(
            removed,
            Removed::Chapter {
                card_title: "Bedtime".to_string(),
                title: "Moon".to_string(),
            }
        );
        let stored = gateway.card(&id).unwrap();
        assert_eq!(titles(&stored), ["Stars"]);
        assert_eq!(stored.chapters()[0].key, "01");

        let removed = lib.remove("Bedtime").await.unwrap();
        assert_eq!(removed, Removed::Card { title: "Bedtime".to_string() });
        assert!(gateway.cards().is_empty());
    }

    #[tokio::test]
    async fn test_move_between_cards_persists_source_first() {
        let gateway = InMemoryGateway::new();
        let src = gateway.insert_card(card("Bedtime", &["Moon", "Stars"]));
        let dst = gateway.insert_card(card("Morning", &["Sun"]));

        let outcome = library(&gateway)
            .move_track("Bedtime/2", "Morning/1")
            .await
            .unwrap();

        assert_eq!(outcome.position, 1);
        assert_eq!(titles(&gateway.card(&src).unwrap()), ["Moon"]);
        assert_eq!(titles(&gateway.card(&dst).unwrap()), ["Stars", "Sun"]);
        assert_eq!(
            updates(&gateway),
            [format!("update_card:{src}"), format!("update_card:{dst}")]
        );
    }

    #[tokio::test]
    async fn test_failed_destination_update_is_not_rolled_back() {
        let gateway = InMemoryGateway::new();
        let src = gateway.insert_card(card("Bedtime", &["Moon", "Stars"]));
        let dst = gateway.insert_card(card("Morning", &["Sun"]));
        gateway.fail_update(&dst);

        let err = library(&gateway)
            .move_track("Bedtime/Moon", "Morning")
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Upstream { status: 500, .. }));
        assert_eq!(titles(&gateway.card(&src).unwrap()), ["Stars"]);
        assert_eq!(titles(&gateway.card(&dst).unwrap()), ["Sun"]);
    }

    #[tokio::test]
    async fn test_move_to_bare_position_stays_in_card() {
        let gateway = InMemoryGateway::new();
        let id = gateway.insert_card(card("Bedtime", &["A", "B", "C"]));

        let outcome = library(&gateway).move_track("Bedtime/1", "3").await.unwrap();

        assert_eq!(outcome.position, 3);
        assert_eq!(titles(&gateway.card(&id).unwrap()), ["B", "C", "A"]);
        assert_eq!(updates(&gateway), [format!("update_card:{id}")]);
    }

    #[tokio::test]
    async fn test_move_to_same_card_persists_once() {
        let gateway = InMemoryGateway::new();
        let id = gateway.insert_card(card("Bedtime", &["A", "B"]));

        library(&gateway)
            .move_track("Bedtime/1", "Bedtime/2")
            .await
            .unwrap();

        let stored = gateway.card(&id).unwrap();
        assert_eq!(titles(&stored), ["B", "A"]);
        assert_eq!(updates(&gateway).len(), 1);
    }

    #[tokio::test]
    async fn test_move_requires_track_source() {
        let gateway = InMemoryGateway::new();
        gateway.insert_card(card("Bedtime", &["A"]));

        let err = library(&gateway).move_track("Bedtime", "2").await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_copy_leaves_source_untouched() {
        let gateway = InMemoryGateway::new();
        let src = gateway.insert_card(card("Bedtime", &["Moon"]));
        let dst = gateway.insert_card(card("Morning", &["Sun"]));

        library(&gateway).copy_track("Bedtime/1", "Morning").await.unwrap();

        assert_eq!(titles(&gateway.card(&src).unwrap()), ["Moon"]);
        assert_eq!(titles(&gateway.card(&dst).unwrap()), ["Sun", "Moon"]);
        assert_eq!(updates(&gateway), [format!("update_card:{dst}")]);
    }

    #[tokio::test]
    async fn test_copy_requires_existing_destination() {
        let gateway = InMemoryGateway::new();
        gateway.insert_card(card("Bedtime", &["Moon"]));

        let err = library(&gateway).copy_track("Bedtime/1", "Evening").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: EntityKind::Card, .. }));
    }

    #[tokio::test]
    async fn test_move_relative_up_and_down() {
        let gateway = InMemoryGateway::new();
        let id = gateway.insert_card(card("Bedtime", &["A", "B", "C"]));
        let lib = library(&gateway);

        let outcome = lib.move_relative("Bedtime/3", -1).await.unwrap();
        assert_eq!(outcome.position, 2);
        assert_eq!(titles(&gateway.card(&id).unwrap()), ["A", "C", "B"]);

        // Moving the first chapter up wraps to the end
        let outcome = lib.move_relative("Bedtime/1", -1).await.unwrap();
        assert_eq!(outcome.position, 3);
        assert_eq!(titles(&gateway.card(&id).unwrap()), ["C", "B", "A"]);
    }

    #[tokio::test]
    async fn test_edit_card_details() {
        let gateway = InMemoryGateway::new();
        let id = gateway.insert_card(card("Bedtime", &["Moon"]));

        let changes = EditRequest {
            name: Some("Night".to_string()),
            author: Some("Grandma".to_string()),
            description: None,
        };
        library(&gateway).edit("Bedtime", &changes).await.unwrap();

        let stored = gateway.card(&id).unwrap();
        assert_eq!(stored.title, "Night");
        assert_eq!(stored.metadata.unwrap().author, "Grandma");
    }

    #[tokio::test]
    async fn test_edit_chapter_renames_first_track() {
        let gateway = InMemoryGateway::new();
        let id = gateway.insert_card(card("Bedtime", &["Moon"]));

        let changes = EditRequest {
            name: Some("Full Moon".to_string()),
            ..EditRequest::default()
        };
        library(&gateway).edit("Bedtime/1", &changes).await.unwrap();

        let stored = gateway.card(&id).unwrap();
        assert_eq!(stored.chapters()[0].title, "Full Moon");
        assert_eq!(stored.chapters()[0].tracks[0].title, "Full Moon");
    }

    #[tokio::test]
    async fn test_edit_chapter_author_only_is_ignored() {
        let gateway = InMemoryGateway::new();
        gateway.insert_card(card("Bedtime", &["Moon"]));

        let changes = EditRequest {
            author: Some("Grandma".to_string()),
            description: Some("Lullabies".to_string()),
            ..EditRequest::default()
        };
        let card = library(&gateway).edit("Bedtime/1", &changes).await.unwrap();

        assert_eq!(card.chapters()[0].title, "Moon");
        assert!(updates(&gateway).is_empty());
    }

    #[tokio::test]
    async fn test_edit_without_changes() {
        let gateway = InMemoryGateway::new();
        gateway.insert_card(card("Bedtime", &["Moon"]));

        let err = library(&gateway)
            .edit("Bedtime", &EditRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(updates(&gateway).is_empty());
    }

    #[tokio::test]
    async fn test_download_card_names_files() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = InMemoryGateway::new();
        let mut bedtime = card("Bedtime", &["Moon", "Stars?"]);
        bedtime.content_mut().chapters.push(Chapter {
            title: "Silent".to_string(),
            ..Chapter::default()
        });
        gateway.insert_card(bedtime);

        let target = dir.path().join("out");
        let files = library(&gateway)
            .download("Bedtime", Some(&target))
            .await
            .unwrap();

        assert_eq!(
            files,
            [target.join("01 - Moon.mp3"), target.join("02 - Stars.mp3")]
        );
        assert_eq!(std::fs::read(&files[0]).unwrap(), b"yoto:#Moon");
    }

    #[tokio::test]
    async fn test_download_single_track_into_directory() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = InMemoryGateway::new();
        let mut bedtime = card("Bedtime", &["Moon", "Stars"]);
        bedtime.content_mut().chapters[1].tracks[0].title = "Twinkle".to_string();
        gateway.insert_card(bedtime);

        let files = library(&gateway)
            .download("Bedtime/2", Some(dir.path()))
            .await
            .unwrap();
        assert_eq!(files, [dir.path().join("Twinkle.mp3")]);
    }

    #[tokio::test]
    async fn test_download_empty_card() {
        let gateway = InMemoryGateway::new();
        gateway.insert_card(card("Empty", &[]));

        let files = library(&gateway).download("Empty", None).await.unwrap();
        assert!(files.is_empty());
        assert!(gateway.calls().iter().all(|c| !c.starts_with("download_file")));
    }

    fn device(id: &str, name: &str) -> Device {
        Device {
            id: id.to_string(),
            name: name.to_string(),
            device_type: "v3".to_string(),
            online: true,
        }
    }

    #[tokio::test]
    async fn test_devices_with_status_skips_failures() {
        let gateway = InMemoryGateway::new();
        gateway.insert_device(
            device("d1", "Kitchen"),
            Some(DeviceStatus {
                battery_level: 80,
                volume: 40,
                ..DeviceStatus::default()
            }),
        );
        gateway.insert_device(device("d2", "Bedroom"), None);

        let overview = library(&gateway).devices_with_status().await.unwrap();
        assert_eq!(overview.len(), 2);
        assert_eq!(overview[0].status.as_ref().unwrap().battery_level, 80);
        assert!(overview[1].status.is_none());
    }

    #[tokio::test]
    async fn test_play_picks_device_by_name() {
        let gateway = InMemoryGateway::new();
        let id = gateway.insert_card(card("Bedtime", &["Moon"]));
        gateway.insert_device(device("d1", "Kitchen"), None);
        gateway.insert_device(device("d2", "Bedroom"), None);

        let (_, picked) = library(&gateway).play("Bedtime", Some("bed")).await.unwrap();
        assert_eq!(picked.id, "d2");
        assert_eq!(
            gateway.commands(),
            [DeviceCommand::Play {
                device_id: "d2".to_string(),
                card_id: id,
            }]
        );
    }

    #[tokio::test]
    async fn test_player_commands_default_to_first_device() {
        let gateway = InMemoryGateway::new();
        gateway.insert_device(device("d1", "Kitchen"), None);
        let lib = library(&gateway);

        lib.stop(None).await.unwrap();
        lib.pause(None).await.unwrap();
        lib.set_volume(55, None).await.unwrap();

        assert_eq!(
            gateway.commands(),
            [
                DeviceCommand::Stop { device_id: "d1".to_string() },
                DeviceCommand::Pause { device_id: "d1".to_string() },
                DeviceCommand::Volume { device_id: "d1".to_string(), level: 55 },
            ]
        );
    }

    #[tokio::test]
    async fn test_volume_out_of_range() {
        let gateway = InMemoryGateway::new();
        gateway.insert_device(device("d1", "Kitchen"), None);

        let err = library(&gateway).set_volume(101, None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(gateway.commands().is_empty());
    }

    #[tokio::test]
    async fn test_no_devices() {
        let gateway = InMemoryGateway::new();
        let err = library(&gateway).stop(None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(ref m) if m == "no devices found"));
    }
}
