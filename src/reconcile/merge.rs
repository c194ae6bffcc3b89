//! Field-level merge policy. Never destructive: incoming data only fills gaps
//! or upgrades an image from render to box art.

use chrono::{Datelike, NaiveDate};

use super::normalize::classify_image;
use crate::model::{CatalogItem, ImageKind, ItemPatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetirementSignal {
    Retired {
        year: Option<i32>,
    },
    Available,
    #[default]
    Unknown,
}

/// Derive the retirement signal from whatever the provider reported.
/// An explicit flag wins; otherwise a last-availability date in the past
/// means retired; otherwise "currently available" means active.
pub fn retirement_signal(
    explicit_retired: Option<bool>,
    last_available: Option<NaiveDate>,
    available_now: Option<bool>,
    today: NaiveDate,
) -> RetirementSignal {
    match explicit_retired {
        Some(true) => {
            return RetirementSignal::Retired {
                year: last_available.map(|d| d.year()),
            }
        }
        Some(false) => return RetirementSignal::Available,
        None => {}
    }
    if let Some(date) = last_available {
        if date < today {
            return RetirementSignal::Retired {
                year: Some(date.year()),
            };
        }
    }
    match available_now {
        Some(true) => RetirementSignal::Available,
        _ => RetirementSignal::Unknown,
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IncomingFields {
    pub retail_price: Option<f64>,
    pub piece_count: Option<i32>,
    pub image: Option<(String, ImageKind)>,
    pub retirement: RetirementSignal,
}

impl IncomingFields {
    /// Fold a later record for the same item into this one. Later values win,
    /// except that a render never displaces a box-art candidate.
    pub fn absorb(&mut self, later: IncomingFields) {
        if later.retail_price.is_some() {
            self.retail_price = later.retail_price;
        }
        if later.piece_count.is_some() {
            self.piece_count = later.piece_count;
        }
        if let Some(img) = later.image {
            let keep_box_art =
                matches!(self.image, Some((_, ImageKind::BoxArt))) && img.1 == ImageKind::Render;
            if !keep_box_art {
                self.image = Some(img);
            }
        }
        if later.retirement != RetirementSignal::Unknown {
            self.retirement = later.retirement;
        }
    }
}

pub fn merge_fields(current: &CatalogItem, incoming: &IncomingFields) -> ItemPatch {
    let mut patch = ItemPatch::default();

    if current.retail_price.is_none() {
        patch.retail_price = incoming.retail_price.filter(|p| *p > 0.0);
    }

    if current.piece_count.unwrap_or(0) == 0 {
        patch.piece_count = incoming.piece_count.filter(|n| *n > 0);
    }

    if let Some((url, kind)) = incoming.image.as_ref() {
        let url = url.trim();
        let differs = current.image_url.as_deref() != Some(url);
        let replace = match current.image_url.as_deref().filter(|u| !u.trim().is_empty()) {
            None => true,
            Some(existing) => {
                *kind == ImageKind::BoxArt && classify_image(existing) != ImageKind::BoxArt
            }
        };
        if !url.is_empty() && differs && replace {
            patch.image_url = Some(url.to_string());
        }
    }

    match incoming.retirement {
        RetirementSignal::Retired { year } => {
            if !current.is_retired {
                patch.is_retired = Some(true);
            }
            if current.year_retired.is_none() {
                patch.year_retired = year;
            }
        }
        RetirementSignal::Available => {
            if current.is_retired {
                patch.is_retired = Some(false);
            }
        }
        RetirementSignal::Unknown => {}
    }

    patch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Category;

    fn item() -> CatalogItem {
        CatalogItem::new(7, Some("75192"), "Millennium Falcon", Category::Lego)
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn fills_empty_price_and_pieces_only() {
        let incoming = IncomingFields {
            retail_price: Some(849.99),
            piece_count: Some(7541),
            ..Default::default()
        };
        let patch = merge_fields(&item(), &incoming);
        assert_eq!(patch.retail_price, Some(849.99));
        assert_eq!(patch.piece_count, Some(7541));

        let mut known = item();
        known.retail_price = Some(799.99);
        known.piece_count = Some(7541);
        let patch = merge_fields(&known, &IncomingFields { piece_count: Some(1), ..incoming });
        assert!(patch.is_empty());
    }

    #[test]
    fn zero_pieces_counts_as_missing_and_zero_price_is_ignored() {
        let mut current = item();
        current.piece_count = Some(0);
        let incoming = IncomingFields {
            retail_price: Some(0.0),
            piece_count: Some(1351),
            ..Default::default()
        };
        let patch = merge_fields(&current, &incoming);
        assert_eq!(patch.piece_count, Some(1351));
        assert_eq!(patch.retail_price, None);
    }

    #[test]
    fn box_art_beats_render_but_not_the_reverse() {
        let mut current = item();
        current.image_url = Some("https://img.example/75192-1.jpg".into());
        let boxed = IncomingFields {
            image: Some(("https://wiki.example/75192_Box.jpg".into(), ImageKind::BoxArt)),
            ..Default::default()
        };
        assert_eq!(
            merge_fields(&current, &boxed).image_url.as_deref(),
            Some("https://wiki.example/75192_Box.jpg")
        );

        current.image_url = Some("https://wiki.example/75192_Box.jpg".into());
        let render = IncomingFields {
            image: Some(("https://img.example/75192-1.jpg".into(), ImageKind::Render)),
            ..Default::default()
        };
        assert_eq!(merge_fields(&current, &render).image_url, None);

        let empty = item();
        assert!(merge_fields(&empty, &render).image_url.is_some());
    }

    #[test]
    fn retirement_signals() {
        let today = day(2024, 6, 1);
        assert_eq!(
            retirement_signal(None, Some(day(2023, 12, 31)), None, today),
            RetirementSignal::Retired { year: Some(2023) }
        );
        assert_eq!(
            retirement_signal(None, Some(day(2025, 1, 1)), Some(true), today),
            RetirementSignal::Available
        );
        assert_eq!(retirement_signal(None, None, None, today), RetirementSignal::Unknown);
        assert_eq!(
            retirement_signal(Some(true), None, Some(true), today),
            RetirementSignal::Retired { year: None }
        );
    }

    #[test]
    fn retirement_patch_respects_absence_of_signal() {
        let mut retired = item();
        retired.is_retired = true;
        retired.year_retired = Some(2021);

        let untouched = merge_fields(&retired, &IncomingFields::default());
        assert!(untouched.is_empty());

        let revived = merge_fields(
            &retired,
            &IncomingFields {
                retirement: RetirementSignal::Available,
                ..Default::default()
            },
        );
        assert_eq!(revived.is_retired, Some(false));

        let retire = merge_fields(
            &item(),
            &IncomingFields {
                retirement: RetirementSignal::Retired { year: Some(2024) },
                ..Default::default()
            },
        );
        assert_eq!(retire.is_retired, Some(true));
        assert_eq!(retire.year_retired, Some(2024));
    }

    #[test]
    fn absorb_keeps_box_art_candidate() {
        let mut acc = IncomingFields {
            image: Some(("a_box.jpg".into(), ImageKind::BoxArt)),
            ..Default::default()
        };
        acc.absorb(IncomingFields {
            image: Some(("a.jpg".into(), ImageKind::Render)),
            retail_price: Some(10.0),
            ..Default::default()
        });
        assert_eq!(acc.image, Some(("a_box.jpg".into(), ImageKind::BoxArt)));
        assert_eq!(acc.retail_price, Some(10.0));
    }
}
