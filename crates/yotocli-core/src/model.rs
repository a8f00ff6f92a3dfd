//! Library data model.
//!
//! Mirrors the JSON shapes of the remote library: a [`Card`] is a playlist,
//! its [`Content`] holds ordered [`Chapter`]s, and each chapter wraps one or
//! more playable [`Track`]s.

use serde::{Deserialize, Serialize};

/// Prefix of every canonical media and icon reference.
pub const MEDIA_REF_PREFIX: &str = "yoto:#";

/// Length of an icon hash as issued by the remote service.
pub const ICON_HASH_LEN: usize = 43;

/// Icon attached to newly uploaded chapters.
pub const DEFAULT_ICON: &str = "yoto:#aUm9i3ex3qqAMYBv-i-O-pYMKuMJGICtR3Vhf289u2Q";

/// Type tag carried by every audio track.
pub const TRACK_TYPE_AUDIO: &str = "audio";

/// A playlist in the remote library.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    /// Opaque identifier, assigned by the remote service on creation.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub card_id: String,
    /// Playlist title.
    #[serde(default)]
    pub title: String,
    /// Creation timestamp as reported by the service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    /// Last update timestamp as reported by the service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    /// Ordered chapters. `None` for summaries and empty cards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    /// Descriptive and aggregate metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

/// Ordered chapter list of a card. Order is playback order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Content {
    /// Chapters in playback order.
    #[serde(default)]
    pub chapters: Vec<Chapter>,
}

/// One playlist entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    /// Zero-padded position key ("01", "02", ...).
    #[serde(default)]
    pub key: String,
    /// Chapter title.
    #[serde(default)]
    pub title: String,
    /// Duration in seconds.
    #[serde(default)]
    pub duration: u64,
    /// Playable tracks; uploads always produce exactly one.
    #[serde(default)]
    pub tracks: Vec<Track>,
    /// Display information.
    #[serde(default)]
    pub display: Display,
    /// Decimal position label shown on the player.
    #[serde(default)]
    pub overlay_label: String,
}

/// A single playable audio reference.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    /// Mirrors the parent chapter key.
    #[serde(default)]
    pub key: String,
    /// Track title.
    #[serde(default)]
    pub title: String,
    /// Canonical audio reference (`yoto:#<sha256>`).
    #[serde(default)]
    pub track_url: String,
    /// Duration in seconds.
    #[serde(default)]
    pub duration: u64,
    /// Transcoded size in bytes.
    #[serde(default)]
    pub file_size: u64,
    /// Audio format reported by the transcoder.
    #[serde(default)]
    pub format: String,
    /// Display information.
    #[serde(default)]
    pub display: Display,
    /// Mirrors the parent chapter overlay label.
    #[serde(default)]
    pub overlay_label: String,
    /// Type tag, `"audio"` for everything this tool writes.
    #[serde(default, rename = "type")]
    pub kind: String,
}

/// Icon information for chapters and tracks.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Display {
    /// Icon reference, canonical or download URL form.
    #[serde(default, rename = "icon16x16")]
    pub icon_16x16: String,
}

impl Display {
    /// Display carrying the given icon.
    pub fn with_icon(icon: impl Into<String>) -> Self {
        Self {
            icon_16x16: icon.into(),
        }
    }
}

/// Descriptive and aggregate card metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Metadata {
    /// Author shown in the app.
    #[serde(default)]
    pub author: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Aggregate media statistics.
    #[serde(default)]
    pub media: Media,
}

/// Aggregate statistics over all chapters of a card.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Media {
    /// Sum of chapter durations in seconds.
    #[serde(default)]
    pub duration: u64,
    /// Sum of each chapter's first track size in bytes.
    #[serde(default)]
    pub file_size: u64,
}

impl Card {
    /// A new, not yet persisted, card with no chapters.
    pub fn empty(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: Some(Content::default()),
            ..Self::default()
        }
    }

    /// Whether the card has been assigned an ID by the remote service.
    #[must_use]
    pub fn is_persisted(&self) -> bool {
        !self.card_id.is_empty()
    }

    /// Chapters of the card; empty when there is no content.
    #[must_use]
    pub fn chapters(&self) -> &[Chapter] {
        self.content.as_ref().map_or(&[], |c| c.chapters.as_slice())
    }

    /// Mutable content, created on demand.
    pub fn content_mut(&mut self) -> &mut Content {
        self.content.get_or_insert_with(Content::default)
    }

    /// Mutable metadata, created on demand.
    pub fn metadata_mut(&mut self) -> &mut Metadata {
        self.metadata.get_or_insert_with(Metadata::default)
    }

    /// Total duration in seconds, from the aggregate metadata.
    #[must_use]
    pub fn total_duration(&self) -> u64 {
        self.metadata.as_ref().map_or(0, |m| m.media.duration)
    }

    /// Bring every icon into canonical form and default empty track types.
    ///
    /// Must run before any write-back to the remote service.
    pub fn sanitize_for_update(&mut self) {
        let Some(content) = self.content.as_mut() else {
            return;
        };
        for chapter in &mut content.chapters {
            chapter.display.icon_16x16 = sanitize_icon(&chapter.display.icon_16x16);
            for track in &mut chapter.tracks {
                track.display.icon_16x16 = sanitize_icon(&track.display.icon_16x16);
                if track.kind.is_empty() {
                    track.kind = TRACK_TYPE_AUDIO.to_string();
                }
            }
        }
    }
}

impl Chapter {
    /// The first track, which carries the chapter's audio.
    #[must_use]
    pub fn first_track(&self) -> Option<&Track> {
        self.tracks.first()
    }
}

/// Build the canonical media reference for a transcoded hash.
#[must_use]
pub fn media_reference(hash: &str) -> String {
    format!("{MEDIA_REF_PREFIX}{hash}")
}

/// Convert a download-URL icon into its canonical `yoto:#<hash>` form.
///
/// Values that are not URLs pass through. A URL whose trailing segment
/// (query stripped) is not exactly [`ICON_HASH_LEN`] characters is returned
/// unchanged.
#[must_use]
pub fn sanitize_icon(icon: &str) -> String {
    if !icon.starts_with("http") {
        return icon.to_string();
    }
    let segment = icon.rsplit('/').next().unwrap_or_default();
    let hash = segment.split('?').next().unwrap_or_default();
    if hash.len() == ICON_HASH_LEN {
        media_reference(hash)
    } else {
        icon.to_string()
    }
}

/// A physical player registered to the account.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Device identifier.
    #[serde(rename = "deviceId")]
    pub id: String,
    /// User-visible name.
    #[serde(default)]
    pub name: String,
    /// Hardware family.
    #[serde(default)]
    pub device_type: String,
    /// Whether the player is currently connected.
    #[serde(default)]
    pub online: bool,
}

/// Live status of a player.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    /// Battery percentage.
    #[serde(default)]
    pub battery_level: u32,
    /// 1 when charging, 0 otherwise.
    #[serde(default)]
    pub is_charging: u8,
    /// Active card ID, or `"none"`.
    #[serde(default)]
    pub active_card: String,
    /// Current volume.
    #[serde(default)]
    pub volume: u32,
}

impl DeviceStatus {
    /// Whether the player reports charging.
    #[must_use]
    pub const fn charging(&self) -> bool {
        self.is_charging == 1
    }

    /// The card currently inserted or streaming, if any.
    #[must_use]
    pub fn playing(&self) -> Option<&str> {
        match self.active_card.as_str() {
            "" | "none" => None,
            card => Some(card),
        }
    }
}
