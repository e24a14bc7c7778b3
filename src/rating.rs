//! Review rating prefixes and aggregate scores.
//!
//! Reviews carry their score as a `[r/5]` prefix on the content, e.g.
//! `[4/5] fast and reliable`.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::mint::Recommendation;

static RATING_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[(\d)/5\]").expect("static regex"));

/// Rating shown when a review has no usable prefix.
pub const DEFAULT_DISPLAY_RATING: u8 = 5;

/// Aggregate of a mint's reviews.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RatingSummary {
    pub likes: u32,
    pub dislikes: u32,
    pub rating: f64,
}

/// Score carried by the `[r/5]` prefix, if any.
pub fn parse_rating(content: &str) -> Option<u8> {
    RATING_PREFIX
        .captures(content)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Score for display; malformed or missing prefixes show as five stars.
pub fn display_rating(content: &str) -> u8 {
    match parse_rating(content) {
        Some(r) if (1..=5).contains(&r) => r,
        _ => DEFAULT_DISPLAY_RATING,
    }
}

/// Review text with the rating prefix removed.
pub fn strip_rating(content: &str) -> &str {
    match RATING_PREFIX.find(content) {
        Some(m) => content[m.end()..].trim_start(),
        None => content,
    }
}

/// Compose review content as `[r/5] text`, or just `[r/5]` without text.
pub fn format_review(rating: u8, text: &str) -> String {
    let text = strip_rating(text.trim()).trim();
    if text.is_empty() {
        format!("[{rating}/5]")
    } else {
        format!("[{rating}/5] {text}")
    }
}

/// Aggregate likes, dislikes and the half-star average over `recommendations`.
///
/// Reviews without a rating prefix are ignored entirely. The result does not
/// depend on input order.
pub fn calculate_rating(recommendations: &[Recommendation]) -> RatingSummary {
    summarize(recommendations.iter().filter_map(|r| parse_rating(&r.content)))
}

fn summarize(ratings: impl Iterator<Item = u8>) -> RatingSummary {
    let ratings: Vec<u8> = ratings.collect();
    if ratings.is_empty() {
        return RatingSummary::default();
    }
    if ratings.iter().all(|r| *r == 5) {
        return RatingSummary {
            likes: ratings.len() as u32,
            dislikes: 0,
            rating: 5.0,
        };
    }
    let sum: u32 = ratings.iter().map(|r| u32::from(*r)).sum();
    let avg = f64::from(sum) / ratings.len() as f64;
    let likes = ratings.iter().filter(|r| **r >= 3).count() as u32;
    RatingSummary {
        likes,
        dislikes: ratings.len() as u32 - likes,
        rating: (avg * 2.0).round() / 2.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recs(contents: &[&str]) -> Vec<Recommendation> {
        contents
            .iter()
            .enumerate()
            .map(|(i, c)| Recommendation {
                id: format!("r{i}"),
                pubkey: format!("p{i}"),
                content: c.to_string(),
                created_at: i as u64,
                profile: None,
            })
            .collect()
    }

    fn summary(likes: u32, dislikes: u32, rating: f64) -> RatingSummary {
        RatingSummary {
            likes,
            dislikes,
            rating,
        }
    }

    #[test]
    fn unanimous_five_stars() {
        let r = calculate_rating(&recs(&["[5/5] great", "[5/5]", "[5/5] ok"]));
        assert_eq!(r, summary(3, 0, 5.0));
    }

    #[test]
    fn no_parseable_ratings() {
        assert_eq!(calculate_rating(&recs(&["great", "5/5", ""])), summary(0, 0, 0.0));
        assert_eq!(calculate_rating(&[]), summary(0, 0, 0.0));
    }

    #[test]
    fn mixed_ratings_round_to_half_stars() {
        assert_eq!(calculate_rating(&recs(&["[1/5] bad", "[5/5] good"])), summary(1, 1, 3.0));
        assert_eq!(calculate_rating(&recs(&["[4/5]", "[4/5]", "[5/5]"])), summary(3, 0, 4.5));
        // Unparseable entries are skipped, not counted as dislikes.
        let r = calculate_rating(&recs(&["[2/5]", "meh", "[4/5]"]));
        assert_eq!(r, summary(1, 1, 3.0));
        assert!(r.likes + r.dislikes <= 3);
    }

    #[test]
    fn order_does_not_matter() {
        let a = calculate_rating(&recs(&["[1/5]", "[3/5]", "[4/5]"]));
        let b = calculate_rating(&recs(&["[4/5]", "[1/5]", "[3/5]"]));
        assert_eq!(a, b);
    }

    #[test]
    fn review_text_helpers() {
        assert_eq!(format_review(4, "solid mint"), "[4/5] solid mint");
        assert_eq!(format_review(2, "  "), "[2/5]");
        assert_eq!(format_review(3, "[5/5] edited"), "[3/5] edited");
        assert_eq!(strip_rating("[4/5] solid"), "solid");
        assert_eq!(strip_rating("no prefix"), "no prefix");
        assert_eq!(display_rating("no prefix"), 5);
        assert_eq!(display_rating("[0/5]"), 5);
        assert_eq!(display_rating("[2/5] hmm"), 2);
    }
}
