use scraper::{Html, Selector};
use std::collections::HashSet;
use tracing::{info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::models::{CatalogEntry, ItemId};

/// Item anchors on a brand listing page, restricted to `/perfume/<brand_slug>/` links.
pub fn parse_brand_listing(html: &str, brand_slug: &str) -> PipelineResult<Vec<CatalogEntry>> {
    let anchor = Selector::parse("a[href]")
        .map_err(|e| PipelineError::extraction("a[href]", format!("invalid selector: {:?}", e)))?;
    let item_prefix = format!("/perfume/{}/", brand_slug);

    let document = Html::parse_document(html);
    let mut seen = HashSet::new();
    let mut entries = Vec::new();

    for element in document.select(&anchor) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        if !href.contains(&item_prefix) {
            continue;
        }

        let display_name = element.text().collect::<String>().trim().to_string();
        if display_name.is_empty() {
            // image links repeat the titled anchor
            continue;
        }

        let Some((id, nickname)) = parse_item_href(href) else {
            warn!("Cannot derive item id from {}", href);
            continue;
        };
        if !seen.insert(id) {
            continue;
        }

        entries.push(CatalogEntry {
            id,
            nickname,
            display_name,
            source_path: href.to_string(),
            brand_id: brand_slug.to_string(),
        });
    }

    info!("Found {} items for brand {}", entries.len(), brand_slug);
    Ok(entries)
}

/// `/perfume/Dior/Sauvage-Eau-de-Parfum-48100.html` -> `(48100, "Sauvage-Eau-de-Parfum")`.
pub fn parse_item_href(href: &str) -> Option<(ItemId, String)> {
    let segment = href.trim_end_matches('/').rsplit('/').next()?;
    let stem = segment.strip_suffix(".html").unwrap_or(segment);
    let (nickname, id) = stem.rsplit_once('-')?;
    let id = id.parse::<ItemId>().ok()?;
    if nickname.is_empty() {
        return None;
    }
    Some((id, nickname.to_string()))
}

/// Brand slug from a listing path such as `/designers/Dior.html`.
pub fn brand_slug_from_listing(listing_path: &str) -> Option<String> {
    let segment = listing_path.trim_end_matches('/').rsplit('/').next()?;
    let slug = segment.strip_suffix(".html").unwrap_or(segment);
    (!slug.is_empty()).then(|| slug.to_string())
}
