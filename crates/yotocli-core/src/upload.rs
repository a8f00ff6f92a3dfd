//! Upload-transcode pipeline.
//!
//! Turns one local audio file into a playable remote track:
//!
//! ```text
//! Preparing -> Requesting -> Uploading -> Polling -> Complete
//! ```
//!
//! Each stage runs strictly after the previous one and any failure aborts the
//! rest. Normalization happens in `Preparing` and is the only recoverable
//! step: on failure the original file is uploaded and the caller is warned.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempPath;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{Sleeper, TokioSleeper, sleep_or_cancel};
use crate::error::{Error, Result};
use crate::gateway::{LibraryGateway, TranscodeResult, TranscodeStatus};
use crate::model::{Chapter, DEFAULT_ICON, Display, TRACK_TYPE_AUDIO, Track, media_reference};
use crate::playlist::build_chapter;
use crate::processing::AudioNormalizer;

/// Stage of the pipeline a file is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    /// Normalizing and deriving the title.
    Preparing,
    /// Acquiring an upload slot.
    Requesting,
    /// Sending the bytes.
    Uploading,
    /// Waiting for the remote transcode.
    Polling,
    /// Track reference available.
    Complete,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Preparing => write!(f, "preparing audio"),
            Self::Requesting => write!(f, "requesting upload slot"),
            Self::Uploading => write!(f, "uploading"),
            Self::Polling => write!(f, "waiting for transcode"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

/// Progress notification for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// The file entered a new stage.
    Stage(PipelineStage),
    /// A recoverable problem, such as a failed normalization.
    Warning(String),
}

/// Progress sink shared by the pipeline and the batch controller.
pub type ProgressFn = dyn Fn(&Path, &Progress) + Send + Sync;

/// How often and how long to poll a transcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Delay between status requests.
    pub interval: Duration,
    /// Total time budget before giving up.
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl PollPolicy {
    /// Number of status requests the budget allows, counting the first
    /// immediate one.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        if self.interval.is_zero() {
            return 1;
        }
        let sleeps = self.timeout.as_nanos() / self.interval.as_nanos();
        u32::try_from(sleeps)
            .unwrap_or(u32::MAX - 1)
            .saturating_add(1)
    }
}

/// A local file ready for upload.
#[derive(Debug)]
pub struct PreparedAudio {
    /// Title derived from the file name.
    pub title: String,
    /// Original file.
    pub source: PathBuf,
    /// Normalized copy, removed when this value is dropped.
    pub normalized: Option<TempPath>,
}

impl PreparedAudio {
    /// The file that should actually be uploaded.
    #[must_use]
    pub fn upload_path(&self) -> &Path {
        self.normalized.as_deref().unwrap_or(self.source.as_path())
    }
}

/// A file that made it through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestedTrack {
    /// File the track came from.
    pub source: PathBuf,
    /// Playable track, not yet placed in a card.
    pub track: Track,
}

impl IngestedTrack {
    /// Wrap the track into a one-track chapter.
    #[must_use]
    pub fn into_chapter(self) -> Chapter {
        build_chapter(self.track)
    }
}

/// Title for a file: its name without extension.
#[must_use]
pub fn title_from_path(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn at_stage(stage: PipelineStage) -> impl FnOnce(Error) -> Error {
    move |e| match e {
        Error::Cancelled | Error::TranscodeTimeout { .. } | Error::Pipeline { .. } => e,
        other => Error::Pipeline {
            stage,
            message: other.to_string(),
        },
    }
}

/// Sequential upload-transcode pipeline for single files.
#[derive(Clone)]
pub struct UploadPipeline {
    gateway: Arc<dyn LibraryGateway>,
    normalizer: Arc<dyn AudioNormalizer>,
    sleeper: Arc<dyn Sleeper>,
    policy: PollPolicy,
    icon: String,
    cancel: CancellationToken,
}

impl fmt::Debug for UploadPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadPipeline")
            .field("policy", &self.policy)
            .field("icon", &self.icon)
            .finish_non_exhaustive()
    }
}

impl UploadPipeline {
    /// Pipeline with the default poll policy, real sleeping and the default icon.
    pub fn new(gateway: Arc<dyn LibraryGateway>, normalizer: Arc<dyn AudioNormalizer>) -> Self {
        Self {
            gateway,
            normalizer,
            sleeper: Arc::new(TokioSleeper),
            policy: PollPolicy::default(),
            icon: DEFAULT_ICON.to_string(),
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the sleeper used between polls.
    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Replace the poll policy.
    #[must_use]
    pub const fn with_poll_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Icon attached to new tracks.
    #[must_use]
    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = icon.into();
        self
    }

    /// Token that aborts polling when cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Gateway used for uploads.
    #[must_use]
    pub fn gateway(&self) -> &Arc<dyn LibraryGateway> {
        &self.gateway
    }

    /// Run the full pipeline for one file.
    pub async fn ingest(
        &self,
        path: &Path,
        normalize: bool,
        progress: Option<&ProgressFn>,
    ) -> Result<IngestedTrack> {
        let prepared = self.prepare(path, normalize, progress).await?;
        let result = self.transcode(&prepared, progress).await?;
        drop(prepared.normalized);

        notify(progress, path, Progress::Stage(PipelineStage::Complete));
        info!(path = %path.display(), hash = %result.sha256, duration = result.duration, "Track ingested");

        Ok(IngestedTrack {
            source: path.to_path_buf(),
            track: Track {
                title: prepared.title,
                track_url: media_reference(&result.sha256),
                duration: result.duration,
                file_size: result.file_size,
                format: result.format,
                display: Display::with_icon(self.icon.clone()),
                kind: TRACK_TYPE_AUDIO.to_string(),
                ..Track::default()
            },
        })
    }

    /// Derive the title and, when asked, normalize the file.
    ///
    /// A normalization failure is not an error: the original file is kept and
    /// a [`Progress::Warning`] is emitted.
    pub async fn prepare(
        &self,
        path: &Path,
        normalize: bool,
        progress: Option<&ProgressFn>,
    ) -> Result<PreparedAudio> {
        notify(progress, path, Progress::Stage(PipelineStage::Preparing));

        if !path.is_file() {
            return Err(Error::Pipeline {
                stage: PipelineStage::Preparing,
                message: format!("{} is not a readable file", path.display()),
            });
        }

        let normalized = if normalize {
            match self.normalizer.normalize(path).await {
                Ok(temp) => {
                    debug!(path = %path.display(), normalized = %temp.display(), "Normalized audio");
                    Some(temp)
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Normalization failed, uploading original");
                    notify(
                        progress,
                        path,
                        Progress::Warning(format!("normalization failed, using original: {e}")),
                    );
                    None
                }
            }
        } else {
            None
        };

        Ok(PreparedAudio {
            title: title_from_path(path),
            source: path.to_path_buf(),
            normalized,
        })
    }

    /// Request a slot, upload the prepared file and wait for the transcode.
    pub async fn transcode(
        &self,
        prepared: &PreparedAudio,
        progress: Option<&ProgressFn>,
    ) -> Result<TranscodeResult> {
        let path = prepared.source.as_path();
        notify(progress, path, Progress::Stage(PipelineStage::Requesting));
        let slot = self
            .gateway
            .upload_slot()
            .await
            .map_err(at_stage(PipelineStage::Requesting))?;
        debug!(upload_id = %slot.upload_id, "Upload slot acquired");

        notify(progress, path, Progress::Stage(PipelineStage::Uploading));
        self.gateway
            .upload_file(&slot.upload_url, prepared.upload_path())
            .await
            .map_err(at_stage(PipelineStage::Uploading))?;
        debug!(upload_id = %slot.upload_id, "Upload finished");

        notify(progress, path, Progress::Stage(PipelineStage::Polling));
        self.poll_transcode(&slot.upload_id).await
    }

    async fn poll_transcode(&self, upload_id: &str) -> Result<TranscodeResult> {
        let max_attempts = self.policy.max_attempts();

        for attempt in 1..=max_attempts {
            let status = self
                .gateway
                .transcode_status(upload_id)
                .await
                .map_err(at_stage(PipelineStage::Polling))?;

            match status {
                TranscodeStatus::Complete(result) => {
                    debug!(upload_id, attempt, "Transcode complete");
                    return Ok(result);
                }
                TranscodeStatus::Pending => {
                    debug!(upload_id, attempt, max_attempts, "Transcode pending");
                }
            }

            if attempt < max_attempts {
                sleep_or_cancel(self.sleeper.as_ref(), self.policy.interval, &self.cancel).await?;
            }
        }

        warn!(upload_id, attempts = max_attempts, "Transcode poll budget exhausted");
        Err(Error::TranscodeTimeout {
            upload_id: upload_id.to_string(),
            attempts: max_attempts,
        })
    }
}

fn notify(progress: Option<&ProgressFn>, path: &Path, event: Progress) {
    if let Some(progress) = progress {
        progress(path, &event);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::test_support::RecordingSleeper;
    use crate::gateway::{MockLibraryGateway, UploadSlot};
    use crate::processing::MockAudioNormalizer;

    fn done(hash: &str) -> TranscodeStatus {
        TranscodeStatus::Complete(TranscodeResult {
            sha256: hash.to_string(),
            duration: 95,
            file_size: 1_500_000,
            format: "aac".to_string(),
            channels: "stereo".to_string(),
        })
    }

    fn slot() -> UploadSlot {
        UploadSlot {
            upload_url: "https://upload.test/put".to_string(),
            upload_id: "up-1".to_string(),
        }
    }

    fn audio_file(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, b"ID3 fake audio").unwrap();
        path
    }

    fn no_normalizer() -> Arc<dyn AudioNormalizer> {
        let mut normalizer = MockAudioNormalizer::new();
        normalizer.expect_normalize().never();
        Arc::new(normalizer)
    }

    #[tokio::test]
    async fn test_ingest_polls_until_complete() {
        let dir = tempfile::tempdir().unwrap();
        let file = audio_file(&dir, "Lullaby.mp3");

        let mut gateway = MockLibraryGateway::new();
        gateway.expect_upload_slot().times(1).returning(|| Ok(slot()));
        gateway
            .expect_upload_file()
            .times(1)
            .withf(|url, _| url == "https://upload.test/put")
            .returning(|_, _| Ok(()));
        let mut polls = 0;
        gateway
            .expect_transcode_status()
            .times(3)
            .returning(move |_| {
                polls += 1;
                Ok(if polls < 3 {
                    TranscodeStatus::Pending
                } else {
                    done("abc123")
                })
            });

        let sleeper = RecordingSleeper::new();
        let pipeline = UploadPipeline::new(Arc::new(gateway), no_normalizer())
            .with_sleeper(Arc::new(sleeper.clone()));

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let progress = move |_: &Path, p: &Progress| sink.lock().unwrap().push(p.clone());

        let ingested = pipeline.ingest(&file, false, Some(&progress)).await.unwrap();

        assert_eq!(ingested.track.title, "Lullaby");
        assert_eq!(ingested.track.track_url, "yoto:#abc123");
        assert_eq!(ingested.track.duration, 95);
        assert_eq!(ingested.track.file_size, 1_500_000);
        assert_eq!(ingested.track.kind, "audio");
        assert_eq!(ingested.track.display.icon_16x16, DEFAULT_ICON);
        assert_eq!(sleeper.sleeps(), vec![Duration::from_secs(5); 2]);

        let stages: Vec<Progress> = events.lock().unwrap().clone();
        assert_eq!(
            stages,
            vec![
                Progress::Stage(PipelineStage::Preparing),
                Progress::Stage(PipelineStage::Requesting),
                Progress::Stage(PipelineStage::Uploading),
                Progress::Stage(PipelineStage::Polling),
                Progress::Stage(PipelineStage::Complete),
            ]
        );
    }

    #[tokio::test]
    async fn test_slot_failure_stops_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let file = audio_file(&dir, "a.mp3");

        let mut gateway = MockLibraryGateway::new();
        gateway.expect_upload_slot().returning(|| {
            Err(Error::Upstream {
                operation: "upload_slot",
                status: 500,
                body: "boom".to_string(),
            })
        });
        gateway.expect_upload_file().never();
        gateway.expect_transcode_status().never();

        let pipeline = UploadPipeline::new(Arc::new(gateway), no_normalizer())
            .with_sleeper(Arc::new(RecordingSleeper::new()));
        let err = pipeline.ingest(&file, false, None).await.unwrap_err();

        assert!(matches!(
            err,
            Error::Pipeline {
                stage: PipelineStage::Requesting,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_upload_failure_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let file = audio_file(&dir, "a.mp3");

        let mut gateway = MockLibraryGateway::new();
        gateway.expect_upload_slot().returning(|| Ok(slot()));
        gateway.expect_upload_file().times(1).returning(|_, _| {
            Err(Error::Upstream {
                operation: "upload_file",
                status: 403,
                body: String::new(),
            })
        });
        gateway.expect_transcode_status().never();

        let pipeline = UploadPipeline::new(Arc::new(gateway), no_normalizer());
        let err = pipeline.ingest(&file, false, None).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Pipeline {
                stage: PipelineStage::Uploading,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_poll_budget_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let file = audio_file(&dir, "a.mp3");

        let mut gateway = MockLibraryGateway::new();
        gateway.expect_upload_slot().returning(|| Ok(slot()));
        gateway.expect_upload_file().returning(|_, _| Ok(()));
        gateway
            .expect_transcode_status()
            .times(3)
            .returning(|_| Ok(TranscodeStatus::Pending));

        let sleeper = RecordingSleeper::new();
        let pipeline = UploadPipeline::new(Arc::new(gateway), no_normalizer())
            .with_sleeper(Arc::new(sleeper.clone()))
            .with_poll_policy(PollPolicy {
                interval: Duration::from_secs(5),
                timeout: Duration::from_secs(10),
            });

        let err = pipeline.ingest(&file, false, None).await.unwrap_err();
        match err {
            Error::TranscodeTimeout {
                upload_id,
                attempts,
            } => {
                assert_eq!(upload_id, "up-1");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(sleeper.sleeps().len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_poll() {
        let dir = tempfile::tempdir().unwrap();
        let file = audio_file(&dir, "a.mp3");

        let mut gateway = MockLibraryGateway::new();
        gateway.expect_upload_slot().returning(|| Ok(slot()));
        gateway.expect_upload_file().returning(|_, _| Ok(()));
        gateway
            .expect_transcode_status()
            .times(1)
            .returning(|_| Ok(TranscodeStatus::Pending));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let pipeline = UploadPipeline::new(Arc::new(gateway), no_normalizer())
            .with_sleeper(Arc::new(RecordingSleeper::new()))
            .with_cancellation(cancel);

        let err = pipeline.ingest(&file, false, None).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_normalization_failure_uploads_original() {
        let dir = tempfile::tempdir().unwrap();
        let file = audio_file(&dir, "Loud Song.wav");
        let expected = file.clone();

        let mut normalizer = MockAudioNormalizer::new();
        normalizer
            .expect_normalize()
            .times(1)
            .returning(|_| Err(Error::Normalization("ffmpeg missing".to_string())));

        let mut gateway = MockLibraryGateway::new();
        gateway.expect_upload_slot().returning(|| Ok(slot()));
        gateway
            .expect_upload_file()
            .times(1)
            .withf(move |_, path| path == expected.as_path())
            .returning(|_, _| Ok(()));
        gateway
            .expect_transcode_status()
            .returning(|_| Ok(done("h")));

        let warnings = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&warnings);
        let progress = move |_: &Path, p: &Progress| {
            if let Progress::Warning(w) = p {
                sink.lock().unwrap().push(w.clone());
            }
        };

        let pipeline = UploadPipeline::new(Arc::new(gateway), Arc::new(normalizer));
        let ingested = pipeline.ingest(&file, true, Some(&progress)).await.unwrap();

        assert_eq!(ingested.track.title, "Loud Song");
        let warnings = warnings.lock().unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("ffmpeg missing"));
    }

    #[tokio::test]
    async fn test_normalized_copy_is_uploaded_then_removed() {
        let dir = tempfile::tempdir().unwrap();
        let file = audio_file(&dir, "song.mp3");
        let normalized_path = dir.path().join("normalized.mp3");
        std::fs::write(&normalized_path, b"normalized").unwrap();

        let temp_target = normalized_path.clone();
        let mut normalizer = MockAudioNormalizer::new();
        normalizer
            .expect_normalize()
            .times(1)
            .returning(move |_| Ok(TempPath::from_path(temp_target.clone())));

        let uploaded = normalized_path.clone();
        let mut gateway = MockLibraryGateway::new();
        gateway.expect_upload_slot().returning(|| Ok(slot()));
        gateway
            .expect_upload_file()
            .times(1)
            .withf(move |_, path| path == uploaded.as_path())
            .returning(|_, _| Ok(()));
        gateway
            .expect_transcode_status()
            .returning(|_| Ok(done("h")));

        let pipeline = UploadPipeline::new(Arc::new(gateway), Arc::new(normalizer));
        let ingested = pipeline.ingest(&file, true, None).await.unwrap();

        assert_eq!(ingested.track.title, "song");
        assert!(!normalized_path.exists());
        assert!(file.exists());
    }

    #[tokio::test]
    async fn test_missing_file_fails_in_preparing() {
        let mut gateway = MockLibraryGateway::new();
        gateway.expect_upload_slot().never();
        let pipeline = UploadPipeline::new(Arc::new(gateway), no_normalizer());

        let err = pipeline
            .ingest(Path::new("/definitely/missing.mp3"), false, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Pipeline {
                stage: PipelineStage::Preparing,
                ..
            }
        ));
    }

    #[test]
    fn test_poll_policy_attempts() {
        assert_eq!(PollPolicy::default().max_attempts(), 361);
        let zero = PollPolicy {
            interval: Duration::ZERO,
            timeout: Duration::from_secs(10),
        };
        assert_eq!(zero.max_attempts(), 1);
    }

    #[test]
    fn test_poll_policy_sub_millisecond_interval() {
        let fast = PollPolicy {
            interval: Duration::from_micros(500),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(fast.max_attempts(), 2001);

        let huge = PollPolicy {
            interval: Duration::from_nanos(1),
            timeout: Duration::from_secs(3600),
        };
        assert_eq!(huge.max_attempts(), u32::MAX);
    }

    #[test]
    fn test_title_from_path() {
        assert_eq!(title_from_path(Path::new("/music/01 Intro.mp3")), "01 Intro");
        assert_eq!(title_from_path(Path::new("noext")), "noext");
    }
}
