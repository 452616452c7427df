use scraper::{ElementRef, Html, Selector};
use tracing::{info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::models::{AttributeRecord, ExtractedItem, ItemId, RawPage, ReviewRecord, Reviewer};

pub const UNKNOWN_PERFUMER: &str = "unknown";

/// Parses an item page into its attribute record and review blocks. No network access.
pub struct PageExtractor {
    notes_prefix: String,
    span: Selector,
    nose_link: Selector,
    accord_box: Selector,
    link: Selector,
    rating_box: Selector,
    review_block: Selector,
    review_member: Selector,
    review_body: Selector,
}

fn selector(css: &str) -> PipelineResult<Selector> {
    Selector::parse(css).map_err(|e| PipelineError::extraction(css, format!("invalid selector: {:?}", e)))
}

fn element_text(element: ElementRef) -> String {
    element.text().collect::<String>().trim().to_string()
}

impl PageExtractor {
    pub fn new(base_url: &str) -> PipelineResult<Self> {
        Ok(PageExtractor {
            notes_prefix: format!("{}/notes", base_url.trim_end_matches('/')),
            span: selector("span")?,
            nose_link: selector("a[href*='/noses/']")?,
            accord_box: selector("div.cell.accord-box")?,
            link: selector("a[href]")?,
            rating_box: selector("p.info-note")?,
            review_block: selector("div[itemprop='review']")?,
            review_member: selector("b.idLinkify")?,
            review_body: selector("div[itemprop='reviewBody']")?,
        })
    }

    pub fn extract(&self, page: &RawPage, item_id: ItemId) -> PipelineResult<ExtractedItem> {
        info!("Getting page elements for {}", page.path);
        let document = Html::parse_document(&page.body);

        let perfumer = self.extract_perfumer(&document);
        let accords = self.extract_accords(&document);
        let notes = self.extract_notes(&document);
        let (rating, vote_count) = self.extract_rating(&document, &page.path)?;

        let mut reviews = Vec::new();
        let mut reviewers = Vec::new();
        for (index, block) in document.select(&self.review_block).enumerate() {
            match self.extract_review(block) {
                Some((reviewer_id, reviewer_name, text)) => {
                    reviews.push(ReviewRecord::new(item_id, &reviewer_id, &text));
                    reviewers.push(Reviewer {
                        reviewer_id,
                        display_name: reviewer_name,
                    });
                }
                None => warn!("Skipping malformed review block {} on {}", index, page.path),
            }
        }

        info!(
            "✅ Extracted {} (perfumer: {}, rating: {}, votes: {}, reviews: {})",
            page.path,
            perfumer,
            rating,
            vote_count,
            reviews.len()
        );

        Ok(ExtractedItem {
            attributes: AttributeRecord {
                item_id,
                perfumer,
                accords,
                notes,
                rating,
                vote_count,
            },
            reviews,
            reviewers,
        })
    }

    /// Credits next to the "Perfumer"/"Perfumers" label, or `unknown` when the label is absent.
    fn extract_perfumer(&self, document: &Html) -> String {
        let label = |wanted: &str| {
            document
                .select(&self.span)
                .find(|span| element_text(*span) == wanted)
        };

        let Some(label_span) = label("Perfumer").or_else(|| label("Perfumers")) else {
            return UNKNOWN_PERFUMER.to_string();
        };

        let credits: Vec<String> = label_span
            .parent()
            .and_then(ElementRef::wrap)
            .and_then(|label_parent| label_parent.next_siblings().find_map(ElementRef::wrap))
            .map(|credits_box| {
                credits_box
                    .select(&self.nose_link)
                    .map(element_text)
                    .filter(|name| !name.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        match credits.len() {
            0 => {
                warn!("Perfumer label present but no credits found");
                UNKNOWN_PERFUMER.to_string()
            }
            1 => credits.into_iter().next().unwrap_or_default(),
            _ => credits.join(","),
        }
    }

    fn extract_accords(&self, document: &Html) -> String {
        document
            .select(&self.accord_box)
            .map(element_text)
            .filter(|accord| !accord.is_empty())
            .collect::<Vec<_>>()
            .join(",")
    }

    fn extract_notes(&self, document: &Html) -> String {
        document
            .select(&self.link)
            .filter(|link| {
                link.value()
                    .attr("href")
                    .map(|href| href.contains(&self.notes_prefix) || href.starts_with("/notes/"))
                    .unwrap_or(false)
            })
            .filter_map(|link| link.parent().and_then(ElementRef::wrap))
            .map(element_text)
            .filter(|note| !note.is_empty())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Rating and vote count from the info box. Missing or malformed is a hard failure.
    fn extract_rating(&self, document: &Html, path: &str) -> PipelineResult<(f64, i64)> {
        let rating_box = document
            .select(&self.rating_box)
            .next()
            .ok_or_else(|| PipelineError::extraction(path, "rating box not found"))?;

        let spans: Vec<String> = rating_box.select(&self.span).map(element_text).collect();
        if spans.len() < 3 {
            return Err(PipelineError::extraction(
                path,
                format!("rating box has {} spans, expected at least 3", spans.len()),
            ));
        }

        let rating = spans[0]
            .parse::<f64>()
            .ok()
            .filter(|rating| rating.is_finite())
            .ok_or_else(|| PipelineError::extraction(path, format!("malformed rating '{}'", spans[0])))?;
        let vote_count = spans[2]
            .replace(',', "")
            .parse::<i64>()
            .map_err(|_| PipelineError::extraction(path, format!("malformed vote count '{}'", spans[2])))?;

        Ok((rating, vote_count))
    }

    fn extract_review(&self, block: ElementRef) -> Option<(String, String, String)> {
        let member = block.select(&self.review_member).next()?;
        let body = block.select(&self.review_body).next()?;

        let reviewer_id = member
            .value()
            .attr("title")?
            .rsplit('/')
            .next()
            .filter(|id| !id.is_empty())?
            .to_string();
        let reviewer_name = element_text(member);
        let text = body.text().collect::<String>().replace("\n\n", " ").trim().to_string();

        Some((reviewer_id, reviewer_name, text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://origin.test";

    fn page(body: &str) -> RawPage {
        RawPage {
            path: "/perfume/Dior/Sauvage-31861.html".to_string(),
            url: format!("{}/perfume/Dior/Sauvage-31861.html", BASE),
            body: body.to_string(),
            via_proxy: None,
        }
    }

    fn item_page(perfumer_block: &str, rating_box: &str) -> String {
        format!(
            r#"<html><body>
            {perfumer_block}
            <div class="grid">
              <div class="cell accord-box"><div class="accord-bar">citrus</div></div>
              <div class="cell accord-box"><div class="accord-bar">aromatic</div></div>
            </div>
            <div class="notes">
              <div><a href="{BASE}/notes/Bergamot-75.html"><img src="b.jpg"></a>Bergamot</div>
              <div><a href="{BASE}/notes/Pepper-152.html"><img src="p.jpg"></a>Pepper</div>
              <div><a href="{BASE}/perfume/Other-1.html">Not a note</a></div>
            </div>
            {rating_box}
            <div itemprop="review">
              <b class="idLinkify" title="/member/88121">scentlover</b>
              <div itemprop="reviewBody">Fresh opening.

Long dry down.</div>
            </div>
            <div itemprop="review">
              <div itemprop="reviewBody">No member header here.</div>
            </div>
            <div itemprop="review">
              <b class="idLinkify" title="/member/9001">nose_two</b>
              <div itemprop="reviewBody">Too sweet.</div>
            </div>
            </body></html>"#
        )
    }

    const RATING_BOX: &str = r#"<p class="info-note">Rating <span>4.21</span> out of <span>5</span> with <span>12,345</span> votes</p>"#;

    fn single_perfumer() -> &'static str {
        r#"<div><div><span>Perfumer</span></div><div><a href="/noses/Francois_Demachy.html">François Demachy</a></div></div>"#
    }

    #[test]
    fn test_full_item_page() {
        let extractor = PageExtractor::new(BASE).unwrap();
        let html = item_page(single_perfumer(), RATING_BOX);
        let item = extractor.extract(&page(&html), 31861).unwrap();

        assert_eq!(item.attributes.item_id, 31861);
        assert_eq!(item.attributes.perfumer, "François Demachy");
        assert_eq!(item.attributes.accords, "citrus,aromatic");
        assert_eq!(item.attributes.notes, "Bergamot,Pepper");
        assert_eq!(item.attributes.rating, 4.21);
        assert_eq!(item.attributes.vote_count, 12345);
    }

    #[test]
    fn test_malformed_review_blocks_are_skipped() {
        let extractor = PageExtractor::new(BASE).unwrap();
        let html = item_page(single_perfumer(), RATING_BOX);
        let item = extractor.extract(&page(&html), 31861).unwrap();

        assert_eq!(item.reviews.len(), 2);
        assert_eq!(item.reviews[0].review_id, "31861_88121");
        assert_eq!(item.reviews[0].review_text, "Fresh opening. Long dry down.");
        assert_eq!(item.reviews[0].tone, None);
        assert_eq!(item.reviewers[1].reviewer_id, "9001");
        assert_eq!(item.reviewers[1].display_name, "nose_two");
    }

    #[test]
    fn test_missing_perfumer_label_is_unknown() {
        let extractor = PageExtractor::new(BASE).unwrap();
        let html = item_page("<div>No credits published</div>", RATING_BOX);
        let item = extractor.extract(&page(&html), 1).unwrap();
        assert_eq!(item.attributes.perfumer, UNKNOWN_PERFUMER);
    }

    #[test]
    fn test_multiple_perfumers_are_joined() {
        let extractor = PageExtractor::new(BASE).unwrap();
        let block = r#"<div><div><span>Perfumers</span></div><div>
            <a href="/noses/Alberto_Morillas.html">Alberto Morillas</a>
            <a href="/noses/Harry_Fremont.html">Harry Frémont</a></div></div>"#;
        let html = item_page(block, RATING_BOX);
        let item = extractor.extract(&page(&html), 1).unwrap();
        assert_eq!(item.attributes.perfumer, "Alberto Morillas,Harry Frémont");
    }

    #[test]
    fn test_missing_rating_box_fails() {
        let extractor = PageExtractor::new(BASE).unwrap();
        let html = item_page(single_perfumer(), "");
        let result = extractor.extract(&page(&html), 1);
        assert!(matches!(result, Err(PipelineError::Extraction { .. })));
    }

    #[test]
    fn test_malformed_rating_fails() {
        let extractor = PageExtractor::new(BASE).unwrap();
        let broken = r#"<p class="info-note">Rating <span>n/a</span> out of <span>5</span> with <span>10</span> votes</p>"#;
        let html = item_page(single_perfumer(), broken);
        assert!(extractor.extract(&page(&html), 1).is_err());

        let short = r#"<p class="info-note">Rating <span>4.0</span></p>"#;
        let html = item_page(single_perfumer(), short);
        assert!(extractor.extract(&page(&html), 1).is_err());
    }

    #[test]
    fn test_non_finite_rating_fails() {
        let extractor = PageExtractor::new(BASE).unwrap();
        for value in ["NaN", "inf", "-infinity"] {
            let rating_box = format!(
                r#"<p class="info-note">Rating <span>{}</span> out of <span>5</span> with <span>10</span> votes</p>"#,
                value
            );
            let html = item_page(single_perfumer(), &rating_box);
            let result = extractor.extract(&page(&html), 1);
            assert!(matches!(result, Err(PipelineError::Extraction { .. })), "{} was accepted", value);
        }
    }
}
