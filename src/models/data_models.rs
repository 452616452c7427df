use serde::{Deserialize, Serialize};

/// Stable item identifier taken from the origin's item URL.
pub type ItemId = i64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    #[serde(rename = "perfume_id")]
    pub id: ItemId,
    #[serde(rename = "perfume_nickname")]
    pub nickname: String,
    #[serde(rename = "perfume_name")]
    pub display_name: String,
    #[serde(rename = "perfume_url")]
    pub source_path: String,
    pub brand_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Brand {
    #[serde(rename = "brand_id")]
    pub id: String,
    #[serde(rename = "brand_name")]
    pub name: String,
    #[serde(rename = "brand_url")]
    pub source_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeRecord {
    #[serde(rename = "perfume_id")]
    pub item_id: ItemId,
    pub perfumer: String,
    pub accords: String,
    pub notes: String,
    pub rating: f64,
    #[serde(rename = "votes_number")]
    pub vote_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub review_id: String,
    #[serde(rename = "perfume_id")]
    pub item_id: ItemId,
    pub reviewer_id: String,
    #[serde(rename = "review")]
    pub review_text: String,
    pub tone: Option<bool>,
}

impl ReviewRecord {
    pub fn new(item_id: ItemId, reviewer_id: &str, review_text: &str) -> Self {
        Self {
            review_id: Self::compose_id(item_id, reviewer_id),
            item_id,
            reviewer_id: reviewer_id.to_string(),
            review_text: review_text.to_string(),
            tone: None,
        }
    }

    /// A reviewer leaves at most one review per item, so the pair is globally unique.
    pub fn compose_id(item_id: ItemId, reviewer_id: &str) -> String {
        format!("{}_{}", item_id, reviewer_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reviewer {
    pub reviewer_id: String,
    #[serde(rename = "reviewer_name")]
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteRecord {
    #[serde(rename = "perfume_id")]
    pub item_id: ItemId,
    #[serde(rename = "vote")]
    pub liked: bool,
}

/// Brand reference resolved by the search index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrandCandidate {
    pub designer: String,
    /// Brand slug as it appears in item URLs, e.g. `Dior`.
    pub slug: String,
    /// Listing page path, e.g. `/designers/Dior.html`.
    pub listing_path: String,
}

impl BrandCandidate {
    pub fn brand(&self) -> Brand {
        Brand {
            id: self.slug.clone(),
            name: self.designer.clone(),
            source_path: self.listing_path.clone(),
        }
    }
}

/// Body of a successfully fetched origin page.
#[derive(Debug, Clone)]
pub struct RawPage {
    pub path: String,
    pub url: String,
    pub body: String,
    /// `None` for the direct attempt, otherwise the proxy that answered.
    pub via_proxy: Option<String>,
}

/// Everything one item page yields.
#[derive(Debug, Clone)]
pub struct ExtractedItem {
    pub attributes: AttributeRecord,
    pub reviews: Vec<ReviewRecord>,
    pub reviewers: Vec<Reviewer>,
}

/// The ordered column names a trained model expects.
///
/// Value object: it is replaced wholesale after each training run and never patched.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeatureVocabulary {
    columns: Vec<String>,
}

impl FeatureVocabulary {
    pub fn new(columns: Vec<String>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_review_id_is_item_and_reviewer() {
        let review = ReviewRecord::new(31861, "member42", "Fresh and spicy");
        assert_eq!(review.review_id, "31861_member42");
        assert_eq!(review.tone, None);
    }

    #[test]
    fn test_rows_use_storage_column_names() {
        let vote = VoteRecord { item_id: 7, liked: true };
        let row = serde_json::to_value(&vote).unwrap();
        assert_eq!(row["perfume_id"], 7);
        assert_eq!(row["vote"], true);

        let attributes = AttributeRecord {
            item_id: 7,
            perfumer: "unknown".to_string(),
            accords: "woody".to_string(),
            notes: "rose".to_string(),
            rating: 4.1,
            vote_count: 120,
        };
        let row = serde_json::to_value(&attributes).unwrap();
        assert_eq!(row["votes_number"], 120);
    }
}
