//! Entity resolution for loose user queries.
//!
//! A query is matched against a list in three ranked passes:
//!
//! 1. **Position**: the query parses as an integer `n` with `1 <= n <= len`.
//! 2. **Id**: exact equality with the canonical identifier.
//! 3. **Title**: case-insensitive substring of the title, in list order.
//!
//! The ranking produces every candidate; the `resolve_*` functions then apply
//! the first-candidate policy. Numeric-looking titles are therefore always
//! read as positions first: a playlist literally named `"3"` is only reachable
//! by title when there are fewer than three playlists.

use tracing::debug;

use crate::error::{EntityKind, Error, Result};
use crate::model::{Card, Chapter, Device};

/// Which rule produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchRule {
    /// 1-based position in the list.
    Position,
    /// Exact identifier match.
    Id,
    /// Case-insensitive title substring.
    Title,
}

/// A ranked resolution candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    /// 0-based index into the searched list.
    pub index: usize,
    /// Rule that matched.
    pub rule: MatchRule,
}

/// Parse a 1-based position and check it against `count`.
fn parse_position(query: &str, count: usize) -> Option<usize> {
    let n: i64 = query.trim().parse().ok()?;
    let n = usize::try_from(n).ok()?;
    (1..=count).contains(&n).then_some(n - 1)
}

fn rank<T>(
    items: &[T],
    query: &str,
    id: impl Fn(&T) -> &str,
    title: impl Fn(&T) -> &str,
) -> Vec<Candidate> {
    let mut candidates = Vec::new();

    if let Some(index) = parse_position(query, items.len()) {
        candidates.push(Candidate {
            index,
            rule: MatchRule::Position,
        });
    }

    candidates.extend(
        items
            .iter()
            .enumerate()
            .filter(|(_, item)| !id(item).is_empty() && id(item) == query)
            .map(|(index, _)| Candidate {
                index,
                rule: MatchRule::Id,
            }),
    );

    let needle = query.to_lowercase();
    candidates.extend(
        items
            .iter()
            .enumerate()
            .filter(|(_, item)| title(item).to_lowercase().contains(&needle))
            .map(|(index, _)| Candidate {
                index,
                rule: MatchRule::Title,
            }),
    );

    candidates
}

/// Every card matching `query`, best first.
#[must_use]
pub fn rank_cards(cards: &[Card], query: &str) -> Vec<Candidate> {
    rank(cards, query, |c| c.card_id.as_str(), |c| c.title.as_str())
}

/// Every chapter of `card` matching `query`, best first.
///
/// The chapter key serves as the identifier.
#[must_use]
pub fn rank_chapters(card: &Card, query: &str) -> Vec<Candidate> {
    rank(
        card.chapters(),
        query,
        |c| c.key.as_str(),
        |c| c.title.as_str(),
    )
}

/// Resolve a card by position, ID or title.
pub fn resolve_card<'a>(cards: &'a [Card], query: &str) -> Result<&'a Card> {
    let best = rank_cards(cards, query)
        .into_iter()
        .next()
        .ok_or_else(|| Error::not_found(EntityKind::Card, query))?;
    debug!(query, index = best.index, rule = ?best.rule, "Resolved card");
    Ok(&cards[best.index])
}

/// Resolve a chapter inside `card`, returning its 0-based index.
pub fn resolve_chapter<'a>(card: &'a Card, query: &str) -> Result<(usize, &'a Chapter)> {
    let best = rank_chapters(card, query)
        .into_iter()
        .next()
        .ok_or_else(|| Error::not_found(EntityKind::Chapter, query))?;
    debug!(query, index = best.index, rule = ?best.rule, "Resolved chapter");
    Ok((best.index, &card.chapters()[best.index]))
}

/// Pick a device by name substring, or the first device when no query is given.
pub fn resolve_device<'a>(devices: &'a [Device], query: Option<&str>) -> Result<&'a Device> {
    match query {
        None => devices
            .first()
            .ok_or_else(|| Error::not_found(EntityKind::Device, "(any)")),
        Some(query) => {
            let needle = query.to_lowercase();
            devices
                .iter()
                .find(|d| d.name.to_lowercase().contains(&needle))
                .ok_or_else(|| Error::not_found(EntityKind::Device, query))
        }
    }
}

/// A `Playlist[/Track]` query split into its two segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryPath {
    /// Card segment.
    pub card: String,
    /// Chapter (or position) segment, if present and non-empty.
    pub chapter: Option<String>,
}

impl LibraryPath {
    /// Split at the first `/`. An empty trailing segment counts as absent.
    #[must_use]
    pub fn parse(query: &str) -> Self {
        match query.split_once('/') {
            Some((card, chapter)) => Self {
                card: card.to_string(),
                chapter: (!chapter.is_empty()).then(|| chapter.to_string()),
            },
            None => Self {
                card: query.to_string(),
                chapter: None,
            },
        }
    }

    /// The chapter segment read as a 1-based position, if it is numeric.
    #[must_use]
    pub fn position(&self) -> Option<i64> {
        self.chapter.as_deref().and_then(|c| c.trim().parse().ok())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::model::Content;

    fn card(id: &str, title: &str) -> Card {
        Card {
            card_id: id.to_string(),
            title: title.to_string(),
            ..Card::default()
        }
    }

    fn library() -> Vec<Card> {
        vec![
            card("id-a", "Bedtime Stories"),
            card("id-b", "3"),
            card("id-c", "Road Trip Songs"),
        ]
    }

    #[test]
    fn test_resolve_by_position() {
        let cards = library();
        assert_eq!(resolve_card(&cards, "1").unwrap().card_id, "id-a");
        assert_eq!(resolve_card(&cards, "3").unwrap().card_id, "id-c");
    }

    #[test]
    fn test_numeric_title_loses_to_position() {
        let cards = library();
        // "3" is a valid position, so the literally titled card is not returned
        let found = resolve_card(&cards, "3").unwrap();
        assert_eq!(found.title, "Road Trip Songs");

        let ranked = rank_cards(&cards, "3");
        assert_eq!(ranked[0].rule, MatchRule::Position);
        assert!(
            ranked
                .iter()
                .any(|c| c.rule == MatchRule::Title && c.index == 1)
        );
    }

    #[test]
    fn test_numeric_title_reachable_when_out_of_range() {
        let cards = vec![card("id-a", "Alpha"), card("id-b", "7")];
        assert_eq!(resolve_card(&cards, "7").unwrap().card_id, "id-b");
    }

    #[test]
    fn test_resolve_by_id() {
        let cards = library();
        assert_eq!(resolve_card(&cards, "id-c").unwrap().title, "Road Trip Songs");
    }

    #[test]
    fn test_resolve_by_title_case_insensitive_first_hit() {
        let cards = vec![
            card("1", "Morning Songs"),
            card("2", "Evening SONGS"),
        ];
        assert_eq!(resolve_card(&cards, "songs").unwrap().card_id, "1");
        assert_eq!(resolve_card(&cards, "evening").unwrap().card_id, "2");
    }

    #[test]
    fn test_resolve_not_found() {
        let cards = library();
        let err = resolve_card(&cards, "nothing like this").unwrap_err();
        assert!(matches!(
            err,
            Error::NotFound {
                kind: EntityKind::Card,
                ..
            }
        ));
        assert!(resolve_card(&cards, "0").is_err());
        assert!(resolve_card(&cards, "-1").is_err());
    }

    #[test]
    fn test_resolve_chapter() {
        let mut c = card("x", "Playlist");
        c.content = Some(Content {
            chapters: vec![
                Chapter {
                    key: "01".to_string(),
                    title: "Intro".to_string(),
                    ..Chapter::default()
                },
                Chapter {
                    key: "02".to_string(),
                    title: "The Gruffalo".to_string(),
                    ..Chapter::default()
                },
            ],
        });

        let (index, chapter) = resolve_chapter(&c, "2").unwrap();
        assert_eq!(index, 1);
        assert_eq!(chapter.title, "The Gruffalo");

        let (index, _) = resolve_chapter(&c, "gruff").unwrap();
        assert_eq!(index, 1);

        assert!(resolve_chapter(&c, "5").is_err());
        assert!(resolve_chapter(&card("y", "Empty"), "1").is_err());
    }

    #[test]
    fn test_resolve_device() {
        let devices = vec![
            Device {
                id: "d1".to_string(),
                name: "Kitchen Player".to_string(),
                ..Device::default()
            },
            Device {
                id: "d2".to_string(),
                name: "Bedroom Mini".to_string(),
                ..Device::default()
            },
        ];
        assert_eq!(resolve_device(&devices, None).unwrap().id, "d1");
        assert_eq!(resolve_device(&devices, Some("bedroom")).unwrap().id, "d2");
        assert!(resolve_device(&devices, Some("garage")).is_err());
        assert!(resolve_device(&[], None).is_err());
    }

    #[test]
    fn test_library_path_parse() {
        let path = LibraryPath::parse("Bedtime/2");
        assert_eq!(path.card, "Bedtime");
        assert_eq!(path.chapter.as_deref(), Some("2"));
        assert_eq!(path.position(), Some(2));

        let path = LibraryPath::parse("Favorites/");
        assert_eq!(path.card, "Favorites");
        assert!(path.chapter.is_none());

        let path = LibraryPath::parse("Bedtime");
        assert!(path.chapter.is_none());
        assert!(path.position().is_none());
    }
}
