//! Review listing and the event drafts behind review publishing.

use std::{cmp::Reverse, str::FromStr};

use anyhow::{anyhow, Result};
use serde::Serialize;

use crate::{
    event::{deletion, kinds, UnsignedEvent},
    mint::{Mint, Recommendation},
    rating::{display_rating, format_review},
};

/// Page sizes offered by review listings.
pub const PAGE_SIZES: [usize; 4] = [10, 25, 50, 100];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReviewSort {
    #[default]
    Newest,
    Oldest,
    Highest,
    Lowest,
}

impl FromStr for ReviewSort {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "newest" => Ok(ReviewSort::Newest),
            "oldest" => Ok(ReviewSort::Oldest),
            "highest" => Ok(ReviewSort::Highest),
            "lowest" => Ok(ReviewSort::Lowest),
            other => Err(anyhow!("unknown sort order {other}")),
        }
    }
}

/// Listing parameters; `page` is 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReviewQuery {
    pub sort: ReviewSort,
    pub rating: Option<u8>,
    pub page: usize,
    pub page_size: usize,
}

impl Default for ReviewQuery {
    fn default() -> Self {
        Self {
            sort: ReviewSort::Newest,
            rating: None,
            page: 1,
            page_size: PAGE_SIZES[0],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewPage {
    pub items: Vec<Recommendation>,
    pub page: usize,
    pub total_pages: usize,
    pub total: usize,
}

impl ReviewQuery {
    /// Filter, sort and slice `reviews`.
    pub fn apply(&self, reviews: &[Recommendation]) -> ReviewPage {
        let mut items: Vec<Recommendation> = reviews
            .iter()
            .filter(|r| self.rating.map_or(true, |want| display_rating(&r.content) == want))
            .cloned()
            .collect();
        sort_reviews(&mut items, self.sort);
        let page_size = if PAGE_SIZES.contains(&self.page_size) {
            self.page_size
        } else {
            PAGE_SIZES[0]
        };
        let total = items.len();
        let total_pages = total.div_ceil(page_size).max(1);
        let page = self.page.clamp(1, total_pages);
        let items = items
            .into_iter()
            .skip((page - 1) * page_size)
            .take(page_size)
            .collect();
        ReviewPage {
            items,
            page,
            total_pages,
            total,
        }
    }
}

pub fn sort_reviews(reviews: &mut [Recommendation], sort: ReviewSort) {
    match sort {
        ReviewSort::Newest => reviews.sort_by_key(|r| Reverse(r.created_at)),
        ReviewSort::Oldest => reviews.sort_by_key(|r| r.created_at),
        ReviewSort::Highest => {
            reviews.sort_by_key(|r| (Reverse(display_rating(&r.content)), Reverse(r.created_at)))
        }
        ReviewSort::Lowest => {
            reviews.sort_by_key(|r| (display_rating(&r.content), Reverse(r.created_at)))
        }
    }
}

/// The newest review by `pubkey`, if any.
pub fn user_review<'a>(reviews: &'a [Recommendation], pubkey: &str) -> Option<&'a Recommendation> {
    reviews
        .iter()
        .filter(|r| r.pubkey == pubkey)
        .max_by_key(|r| r.created_at)
}

/// Recommendation draft linking back to `mint`.
pub fn recommendation_draft(mint: &Mint, rating: u8, text: &str) -> UnsignedEvent {
    let kind = kinds::MINT_ANNOUNCEMENT.to_string();
    UnsignedEvent::new(kinds::RECOMMENDATION, format_review(rating, text))
        .tag(&["k", &kind])
        .tag(&["d", &mint.id])
        .tag(&["u", &mint.url])
        .tag(&["a", &mint.address()])
}

/// An edit over an append-only feed: retract the old review, publish a new one.
#[derive(Debug, Clone, PartialEq)]
pub struct EditCommands {
    pub tombstone: UnsignedEvent,
    pub replacement: UnsignedEvent,
}

pub fn compile_edit(mint: &Mint, review_id: &str, rating: u8, text: &str) -> EditCommands {
    EditCommands {
        tombstone: deletion(review_id, Some(kinds::RECOMMENDATION)),
        replacement: recommendation_draft(mint, rating, text),
    }
}
