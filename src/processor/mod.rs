pub mod feature_aligner;
pub mod listing_parser;
pub mod page_extractor;

pub use feature_aligner::{Alignment, FeatureAligner, FeatureMatrix};
pub use page_extractor::PageExtractor;
