//! Matching external records to catalog rows and deciding what to write.
//! Everything here is pure; the jobs own the I/O.

pub mod index;
pub mod listing;
pub mod merge;
pub mod normalize;

pub use index::{match_theme, reconcile, CatalogIndex, ExternalKey, MatchResult};
pub use listing::{classify_listing, dedupe_listings, ListingVerdict};
pub use merge::{merge_fields, retirement_signal, IncomingFields, RetirementSignal};
pub use normalize::{normalize_set_number, normalize_theme};
