//! Playlist mutation engine.
//!
//! Inserts, removes, moves and copies chapters inside card content. Every
//! operation ends with [`renumber`], which restores the content invariants:
//!
//! - chapter `i` (0-based) has key `format!("{:02}", i + 1)` and overlay label
//!   `i + 1`, and every track inside it carries the same key and label;
//! - the card's media duration is the sum of chapter durations;
//! - the card's media file size is the sum of each chapter's first track size.
//!
//! Positions are 1-based as typed by users. Out-of-range *insert* positions
//! append; out-of-range *source* indices fail with [`Error::InvalidIndex`] and
//! leave the card untouched.

use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{Card, Chapter, DEFAULT_ICON, Display, Media, TRACK_TYPE_AUDIO, Track};

/// Restore keys, overlay labels and aggregate media statistics.
pub fn renumber(card: &mut Card) {
    let mut media = Media::default();

    if let Some(content) = card.content.as_mut() {
        for (i, chapter) in content.chapters.iter_mut().enumerate() {
            let key = format!("{:02}", i + 1);
            let label = (i + 1).to_string();
            for track in &mut chapter.tracks {
                track.key.clone_from(&key);
                track.overlay_label.clone_from(&label);
            }
            chapter.key = key;
            chapter.overlay_label = label;

            media.duration += chapter.duration;
            media.file_size += chapter.first_track().map_or(0, |t| t.file_size);
        }
    }

    card.metadata_mut().media = media;
}

/// Map a 1-based source index to a 0-based one, or fail.
fn source_index(card: &Card, index: i64) -> Result<usize> {
    let count = card.chapters().len();
    usize::try_from(index)
        .ok()
        .filter(|&i| (1..=count).contains(&i))
        .map(|i| i - 1)
        .ok_or(Error::InvalidIndex { index, count })
}

fn insert_raw(card: &mut Card, chapter: Chapter, position: i64) -> usize {
    let chapters = &mut card.content_mut().chapters;
    let count = chapters.len();
    match usize::try_from(position) {
        Ok(p) if (1..=count).contains(&p) => {
            chapters.insert(p - 1, chapter);
            p
        }
        _ => {
            chapters.push(chapter);
            count + 1
        }
    }
}

/// Insert `chapter` so it lands at 1-based `position`.
///
/// A position below 1 or above the current count appends. Returns the
/// position the chapter ended up at.
pub fn insert(card: &mut Card, chapter: Chapter, position: i64) -> usize {
    let landed = insert_raw(card, chapter, position);
    renumber(card);
    debug!(card = %card.title, requested = position, landed, "Inserted chapter");
    landed
}

/// Remove the chapter at 1-based `index`, returning it.
pub fn remove(card: &mut Card, index: i64) -> Result<Chapter> {
    let i = source_index(card, index)?;
    let removed = card.content_mut().chapters.remove(i);
    renumber(card);
    debug!(card = %card.title, index, title = %removed.title, "Removed chapter");
    Ok(removed)
}

/// Move a chapter within one card.
///
/// The chapter is removed first and then inserted at `dst_position` exactly
/// as given, without adjusting for the removal. Moving chapter 1 of `[A, B]`
/// to position 2 therefore yields `[B, A]`.
pub fn move_within(card: &mut Card, src_index: i64, dst_position: i64) -> Result<usize> {
    let i = source_index(card, src_index)?;
    let chapter = card.content_mut().chapters.remove(i);
    let landed = insert_raw(card, chapter, dst_position);
    renumber(card);
    debug!(card = %card.title, from = src_index, to = landed, "Moved chapter");
    Ok(landed)
}

/// Move a chapter from one card into another.
pub fn move_between(
    src: &mut Card,
    src_index: i64,
    dst: &mut Card,
    dst_position: i64,
) -> Result<usize> {
    let chapter = remove(src, src_index)?;
    Ok(insert(dst, chapter, dst_position))
}

/// Copy a chapter into another card, leaving the source untouched.
pub fn copy_between(
    src: &Card,
    src_index: i64,
    dst: &mut Card,
    dst_position: i64,
) -> Result<usize> {
    let i = source_index(src, src_index)?;
    let chapter = src.chapters()[i].clone();
    Ok(insert(dst, chapter, dst_position))
}

/// Duplicate a chapter within one card.
pub fn copy_within(card: &mut Card, src_index: i64, dst_position: i64) -> Result<usize> {
    let i = source_index(card, src_index)?;
    let chapter = card.chapters()[i].clone();
    Ok(insert(card, chapter, dst_position))
}

/// Shift a chapter by `delta` places using the same remove-then-insert rule
/// as [`move_within`].
pub fn move_relative(card: &mut Card, index: i64, delta: i64) -> Result<usize> {
    move_within(card, index, index.saturating_add(delta))
}

/// Rename a chapter together with its first track.
pub fn rename_chapter(card: &mut Card, index: i64, title: &str) -> Result<()> {
    let i = source_index(card, index)?;
    let chapter = &mut card.content_mut().chapters[i];
    chapter.title = title.to_string();
    if let Some(track) = chapter.tracks.first_mut() {
        track.title = title.to_string();
    }
    Ok(())
}

/// Wrap a single track into a chapter carrying the same title, duration and
/// display. An empty track icon falls back to [`DEFAULT_ICON`].
#[must_use]
pub fn build_chapter(mut track: Track) -> Chapter {
    if track.display.icon_16x16.is_empty() {
        track.display = Display::with_icon(DEFAULT_ICON);
    }
    if track.kind.is_empty() {
        track.kind = TRACK_TYPE_AUDIO.to_string();
    }
    Chapter {
        title: track.title.clone(),
        duration: track.duration,
        display: track.display.clone(),
        tracks: vec![track],
        ..Chapter::default()
    }
}

/// Assemble chapters from tracks in the given order, append them and renumber.
pub fn append_tracks(card: &mut Card, tracks: impl IntoIterator<Item = Track>) {
    card.content_mut()
        .chapters
        .extend(tracks.into_iter().map(build_chapter));
    renumber(card);
}
