//! External audio tools.
//!
//! Loudness normalization shells out to `ffprobe`/`ffmpeg` and URL extraction
//! to `yt-dlp`. Both are single-shot calls without retry.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tempfile::TempPath;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Loudness target for stereo sources, in LUFS.
pub const STEREO_TARGET_LUFS: i32 = -16;

/// Loudness target for mono sources, in LUFS.
pub const MONO_TARGET_LUFS: i32 = -18;

/// Produces a loudness-normalized copy of an audio file.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AudioNormalizer: Send + Sync {
    /// Normalize `input` into a temporary MP3 that is deleted when dropped.
    async fn normalize(&self, input: &Path) -> Result<TempPath>;
}

/// Audio fetched from a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedAudio {
    /// Local MP3 file. The caller owns it and should remove it.
    pub path: PathBuf,
    /// Title reported by the source.
    pub title: String,
}

/// Extracts audio from a web page URL.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AudioDownloader: Send + Sync {
    /// Download the audio behind `url` as MP3.
    async fn download(&self, url: &str) -> Result<DownloadedAudio>;
}

// =============================================================================
// ffmpeg
// =============================================================================

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    #[serde(default)]
    channels: u32,
}

/// Read the channel count of the first audio stream from `ffprobe` JSON.
///
/// Anything unreadable counts as stereo.
#[must_use]
pub fn parse_channel_count(probe_json: &[u8]) -> u32 {
    serde_json::from_slice::<ProbeOutput>(probe_json)
        .ok()
        .and_then(|p| p.streams.first().map(|s| s.channels))
        .filter(|&c| c > 0)
        .unwrap_or(2)
}

/// `loudnorm` filter for the given channel count.
#[must_use]
pub fn loudnorm_filter(channels: u32) -> String {
    let target = if channels == 1 {
        MONO_TARGET_LUFS
    } else {
        STEREO_TARGET_LUFS
    };
    format!("loudnorm=I={target}:TP=-1.5:LRA=11")
}

/// Normalizer backed by the `ffmpeg` command line tools.
#[derive(Debug, Clone)]
pub struct FfmpegNormalizer {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl Default for FfmpegNormalizer {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }
}

impl FfmpegNormalizer {
    /// Normalizer using `ffmpeg` and `ffprobe` from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn channel_count(&self, input: &Path) -> u32 {
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_streams",
                "-select_streams",
                "a",
            ])
            .arg(input)
            .output()
            .await;

        match output {
            Ok(out) if out.status.success() => parse_channel_count(&out.stdout),
            Ok(out) => {
                warn!(path = %input.display(), status = %out.status, "ffprobe failed, assuming stereo");
                2
            }
            Err(e) => {
                warn!(path = %input.display(), error = %e, "ffprobe unavailable, assuming stereo");
                2
            }
        }
    }
}

#[async_trait]
impl AudioNormalizer for FfmpegNormalizer {
    async fn normalize(&self, input: &Path) -> Result<TempPath> {
        let channels = self.channel_count(input).await;
        let output = tempfile::Builder::new()
            .prefix("yotocli-norm-")
            .suffix(".mp3")
            .tempfile()?
            .into_temp_path();

        debug!(path = %input.display(), channels, "Normalizing audio");

        let result = Command::new(&self.ffmpeg)
            .arg("-y")
            .arg("-i")
            .arg(input)
            .arg("-filter:a")
            .arg(loudnorm_filter(channels))
            .args(["-c:a", "libmp3lame", "-q:a", "2"])
            .arg(output.as_os_str())
            .output()
            .await
            .map_err(|e| Error::Normalization(format!("failed to run ffmpeg: {e}")))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(Error::Normalization(format!(
                "ffmpeg exited with {}: {}",
                result.status,
                stderr.trim()
            )));
        }

        Ok(output)
    }
}

// =============================================================================
// yt-dlp
// =============================================================================

/// Split `yt-dlp --print title --print after_move:filepath` output into
/// `(title, path)`. The title is the first line and the path the last.
pub fn parse_ytdlp_output(stdout: &str) -> Result<(String, PathBuf)> {
    let lines: Vec<&str> = stdout
        .trim()
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    match lines.as_slice() {
        [title, .., path] => Ok(((*title).to_string(), PathBuf::from(path))),
        _ => Err(Error::Download(format!(
            "unexpected output from yt-dlp: {stdout}"
        ))),
    }
}

/// Downloader backed by the `yt-dlp` command line tool.
#[derive(Debug, Clone)]
pub struct YtDlpDownloader {
    program: PathBuf,
    output_dir: PathBuf,
}

impl Default for YtDlpDownloader {
    fn default() -> Self {
        Self {
            program: PathBuf::from("yt-dlp"),
            output_dir: std::env::temp_dir(),
        }
    }
}

impl YtDlpDownloader {
    /// Downloader writing into the system temporary directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Write downloads into `dir` instead.
    #[must_use]
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }
}

#[async_trait]
impl AudioDownloader for YtDlpDownloader {
    async fn download(&self, url: &str) -> Result<DownloadedAudio> {
        let template = self.output_dir.join("yotocli-import-%(id)s.%(ext)s");
        debug!(url, "Extracting audio with yt-dlp");

        let output = Command::new(&self.program)
            .args(["-x", "--audio-format", "mp3", "--audio-quality", "0", "-o"])
            .arg(&template)
            .args([
                "--print",
                "title",
                "--print",
                "after_move:filepath",
                "--no-simulate",
                url,
            ])
            .output()
            .await
            .map_err(|e| {
                Error::Download(format!(
                    "yt-dlp not available ({e}); install it with `pip install yt-dlp`"
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Download(format!(
                "yt-dlp exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let (title, path) = parse_ytdlp_output(&String::from_utf8_lossy(&output.stdout))?;
        Ok(DownloadedAudio { path, title })
    }
}
