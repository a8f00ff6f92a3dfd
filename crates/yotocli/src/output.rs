//! Plain-text rendering of command results.
//!
//! Every renderer returns a `String` so the layout can be tested without
//! capturing stdout.

use std::fmt::Write as _;

use yotocli_core::library::{DeviceOverview, Removed, TransferOutcome};
use yotocli_core::{Card, Chapter};

/// Seconds as `m:ss`.
pub fn format_duration(seconds: u64) -> String {
    format!("{}:{:02}", seconds / 60, seconds % 60)
}

/// Left-aligned columns separated by three spaces.
fn table(header: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = header.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut out = table_row(header.iter().copied(), &widths);
    out.push('\n');
    for row in rows {
        out.push_str(&table_row(row.iter().map(String::as_str), &widths));
        out.push('\n');
    }
    out
}

fn table_row<'a>(cells: impl Iterator<Item = &'a str>, widths: &[usize]) -> String {
    let line = cells
        .zip(widths)
        .map(|(cell, &width)| format!("{cell:<width$}"))
        .collect::<Vec<_>>()
        .join("   ");
    line.trim_end().to_string()
}

/// The library overview printed by `ls`.
pub fn cards_table(cards: &[Card]) -> String {
    let rows: Vec<_> = cards
        .iter()
        .enumerate()
        .map(|(i, card)| {
            vec![
                (i + 1).to_string(),
                card.title.clone(),
                card.card_id.clone(),
                format_duration(card.total_duration()),
            ]
        })
        .collect();
    table(&["#", "Title", "ID", "Duration"], &rows)
}

/// The chapters of one card, printed by `ls <playlist>`.
pub fn chapters_table(card: &Card) -> String {
    let mut out = format!("Playlist: {} ({})\n\n", card.title, card.card_id);
    if card.chapters().is_empty() {
        out.push_str("No content found in this card.\n");
        return out;
    }

    let rows: Vec<_> = card
        .chapters()
        .iter()
        .enumerate()
        .map(|(i, chapter)| {
            vec![
                (i + 1).to_string(),
                chapter.title.clone(),
                format_duration(chapter.duration),
                chapter
                    .first_track()
                    .map_or_else(|| "-".to_string(), |t| t.format.clone()),
            ]
        })
        .collect();
    out.push_str(&table(&["#", "Title", "Duration", "Format"], &rows));
    out
}

/// Details of one chapter, printed by `ls <playlist>/<track>`.
pub fn chapter_detail(position: usize, chapter: &Chapter) -> String {
    let mut out = String::from("Track Detail:\n");
    let _ = writeln!(out, "  Position: {position}");
    let _ = writeln!(out, "  Title:    {}", chapter.title);
    let _ = writeln!(out, "  Duration: {}", format_duration(chapter.duration));
    if let Some(track) = chapter.first_track() {
        #[allow(clippy::cast_precision_loss)]
        let megabytes = track.file_size as f64 / 1024.0 / 1024.0;
        let _ = writeln!(out, "  Format:   {}", track.format);
        let _ = writeln!(out, "  Size:     {megabytes:.2} MB");
        let _ = writeln!(out, "  URL:      {}", track.track_url);
    }
    out
}

/// Player overview printed by `status`.
pub fn devices_table(devices: &[DeviceOverview]) -> String {
    if devices.is_empty() {
        return "No devices found.\n".to_string();
    }

    let rows: Vec<_> = devices
        .iter()
        .map(|d| {
            let online = if d.device.online { "online" } else { "offline" };
            let (battery, volume, playing) = d.status.as_ref().map_or_else(
                || ("-".to_string(), "-".to_string(), "-".to_string()),
                |s| {
                    let charging = if s.charging() { " (charging)" } else { "" };
                    (
                        format!("{}%{charging}", s.battery_level),
                        s.volume.to_string(),
                        s.playing().unwrap_or("-").to_string(),
                    )
                },
            );
            vec![
                d.device.name.clone(),
                d.device.device_type.clone(),
                online.to_string(),
                battery,
                volume,
                playing,
            ]
        })
        .collect();
    table(
        &["Name", "Type", "State", "Battery", "Volume", "Playing"],
        &rows,
    )
}

/// One-line summary of a removal.
pub fn removed_line(removed: &Removed) -> String {
    match removed {
        Removed::Card { title } => format!("Deleted playlist '{title}'"),
        Removed::Chapter { card_title, title } => {
            format!("Removed '{title}' from '{card_title}'")
        }
    }
}

/// One-line summary of a move or copy.
pub fn transfer_line(verb: &str, outcome: &TransferOutcome) -> String {
    format!(
        "{verb} '{}' to '{}' at position {}",
        outcome.title, outcome.destination_card, outcome.position
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use yotocli_core::model::{Device, DeviceStatus, Metadata, Media, Track};

    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "0:00");
        assert_eq!(format_duration(61), "1:01");
        assert_eq!(format_duration(3600), "60:00");
    }

    #[test]
    fn test_cards_table_aligns_columns() {
        let cards = vec![
            Card {
                card_id: "abc".to_string(),
                title: "Bedtime Stories".to_string(),
                metadata: Some(Metadata {
                    media: Media {
                        duration: 125,
                        file_size: 0,
                    },
                    ..Metadata::default()
                }),
                ..Card::default()
            },
            Card {
                card_id: "defgh".to_string(),
                title: "Songs".to_string(),
                ..Card::default()
            },
        ];

        let out = cards_table(&cards);
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines[0], "#   Title             ID      Duration");
        assert_eq!(lines[1], "1   Bedtime Stories   abc     2:05");
        assert_eq!(lines[2], "2   Songs             defgh   0:00");
    }

    #[test]
    fn test_chapters_table_empty_card() {
        let out = chapters_table(&Card::empty("Empty"));
        assert!(out.contains("No content found in this card."));
    }

    #[test]
    fn test_chapter_detail() {
        let chapter = Chapter {
            title: "Moon".to_string(),
            duration: 90,
            tracks: vec![Track {
                format: "aac".to_string(),
                file_size: 2 * 1024 * 1024,
                track_url: "yoto:#abc".to_string(),
                ..Track::default()
            }],
            ..Chapter::default()
        };

        let out = chapter_detail(2, &chapter);
        assert!(out.contains("Title:    Moon"));
        assert!(out.contains("Duration: 1:30"));
        assert!(out.contains("Size:     2.00 MB"));
    }

    #[test]
    fn test_devices_table() {
        let devices = vec![
            DeviceOverview {
                device: Device {
                    id: "d1".to_string(),
                    name: "Kitchen".to_string(),
                    device_type: "v3".to_string(),
                    online: true,
                },
                status: Some(DeviceStatus {
                    battery_level: 80,
                    is_charging: 1,
                    active_card: "card-1".to_string(),
                    volume: 40,
                }),
            },
            DeviceOverview {
                device: Device {
                    id: "d2".to_string(),
                    name: "Bedroom".to_string(),
                    device_type: "mini".to_string(),
                    online: false,
                },
                status: None,
            },
        ];

        let out = devices_table(&devices);
        assert!(out.contains("80% (charging)"));
        assert!(out.contains("card-1"));
        assert!(out.lines().nth(2).unwrap().contains("offline"));
        assert_eq!(devices_table(&[]), "No devices found.\n");
    }

    #[test]
    fn test_summary_lines() {
        let removed = Removed::Chapter {
            card_title: "Bedtime".to_string(),
            title: "Moon".to_string(),
        };
        assert_eq!(removed_line(&removed), "Removed 'Moon' from 'Bedtime'");

        let outcome = TransferOutcome {
            title: "Moon".to_string(),
            source_card: "Bedtime".to_string(),
            destination_card: "Morning".to_string(),
            position: 2,
        };
        assert_eq!(
            transfer_line("Moved", &outcome),
            "Moved 'Moon' to 'Morning' at position 2"
        );
    }
}
