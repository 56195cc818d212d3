//! Catalog search client and name matching.
//!
//! The catalog service owns the canonical biomarker ontology. We only ever
//! read from it: search by name, score the candidates, pick the best one
//! above the similarity threshold.

use async_trait::async_trait;
use serde::Deserialize;

use super::CatalogError;
use crate::extraction::normalize::normalize_key;
use crate::model::CatalogEntry;

/// Seam for the catalog search service.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Search candidates for one observed name.
    async fn search(&self, name: &str) -> Result<Vec<CatalogEntry>, CatalogError>;
}

/// Production client for the catalog's HTTP search endpoint.
pub struct HttpCatalogClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCatalogClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<CatalogEntry>,
}

#[async_trait]
impl CatalogClient for HttpCatalogClient {
    async fn search(&self, name: &str) -> Result<Vec<CatalogEntry>, CatalogError> {
        let url = format!("{}/v1/biomarkers/search", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .query(&[("q", name)])
            .send()
            .await
            .map_err(|e| CatalogError::Http(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CatalogError::Http(format!("search returned {status}")));
        }
        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| CatalogError::Malformed(format!("bad search body: {e}")))?;
        tracing::debug!(query = %name, candidates = parsed.results.len(), "catalog search");
        Ok(parsed.results)
    }
}

/// In-memory catalog, used in tests and for seeded deployments.
#[derive(Default)]
pub struct StaticCatalog {
    entries: Vec<CatalogEntry>,
}

impl StaticCatalog {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }
}

#[async_trait]
impl CatalogClient for StaticCatalog {
    async fn search(&self, name: &str) -> Result<Vec<CatalogEntry>, CatalogError> {
        let key = normalize_key(name);
        let mut hits: Vec<CatalogEntry> = self
            .entries
            .iter()
            .filter(|e| {
                e.all_names()
                    .iter()
                    .any(|n| normalize_key(n).contains(&key) || key.contains(&normalize_key(n)))
            })
            .cloned()
            .collect();
        // Deterministic candidate order.
        hits.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(hits)
    }
}

// ──────────────────────────────────────────────
// Name similarity
// ──────────────────────────────────────────────

/// Similarity between an observed name and a catalog name in [0, 1].
///
/// Exact match after lowercase-alphanumeric folding scores 1.0 ("HDL-C" and
/// "HDL C" are the same name). Otherwise a token Dice coefficient over
/// character bigrams of the folded forms.
pub fn name_similarity(observed: &str, candidate: &str) -> f32 {
    let a = normalize_key(observed);
    let b = normalize_key(candidate);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    dice_bigrams(&a, &b)
}

fn bigrams(s: &str) -> Vec<(u8, u8)> {
    let bytes = s.as_bytes();
    bytes.windows(2).map(|w| (w[0], w[1])).collect()
}

fn dice_bigrams(a: &str, b: &str) -> f32 {
    let mut left = bigrams(a);
    let right = bigrams(b);
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    let total = left.len() + right.len();
    let mut shared = 0usize;
    for gram in &right {
        if let Some(pos) = left.iter().position(|g| g == gram) {
            left.swap_remove(pos);
            shared += 1;
        }
    }
    (2 * shared) as f32 / total as f32
}

/// Best catalog candidate for a biomarker, considering every name the
/// marker and each candidate are known by. Returns the entry and its score
/// when the score clears `threshold`.
pub fn best_match<'a>(
    known_names: &[&str],
    candidates: &'a [CatalogEntry],
    threshold: f32,
) -> Option<(&'a CatalogEntry, f32)> {
    let mut best: Option<(&CatalogEntry, f32)> = None;
    for entry in candidates {
        let score = entry
            .all_names()
            .iter()
            .flat_map(|catalog_name| {
                known_names
                    .iter()
                    .map(move |observed| name_similarity(observed, catalog_name))
            })
            .fold(0.0f32, f32::max);
        if score >= threshold && best.map_or(true, |(_, prev)| score > prev) {
            best = Some((entry, score));
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn entry(id: &str, long: &str, short: Option<&str>, aliases: &[&str]) -> CatalogEntry {
        CatalogEntry {
            id: id.into(),
            long_name: long.into(),
            short_name: short.map(Into::into),
            aliases: aliases.iter().map(|s| s.to_string()).collect(),
            units: vec![],
            reference_ranges: HashMap::new(),
        }
    }

    #[test]
    fn folded_exact_match_is_perfect() {
        assert_eq!(name_similarity("HDL-C", "HDL C"), 1.0);
        assert_eq!(name_similarity("hdl c", "HDL-C"), 1.0);
    }

    #[test]
    fn unrelated_names_score_low() {
        assert!(name_similarity("Glucose", "Ferritin") < 0.3);
    }

    #[test]
    fn closely_related_spellings_score_high() {
        assert!(name_similarity("Hemoglobin A1c", "Hemoglobin A1C") > 0.9);
    }

    #[test]
    fn best_match_considers_aliases_both_ways() {
        let candidates = vec![
            entry("cat-ferritin", "Ferritin", None, &[]),
            entry(
                "cat-hdl",
                "HDL Cholesterol",
                Some("HDL-C"),
                &["High-Density Lipoprotein"],
            ),
        ];
        let (hit, score) = best_match(&["HDL"], &candidates, 0.5).unwrap();
        assert_eq!(hit.id, "cat-hdl");
        assert!(score > 0.5);
    }

    #[test]
    fn below_threshold_is_no_match() {
        let candidates = vec![entry("cat-hdl", "HDL Cholesterol", Some("HDL-C"), &[])];
        assert!(best_match(&["XYZ-Novel-Marker"], &candidates, 0.82).is_none());
    }

    #[tokio::test]
    async fn static_catalog_matches_on_any_name() {
        let catalog = StaticCatalog::new(vec![entry(
            "cat-hdl",
            "HDL Cholesterol",
            Some("HDL-C"),
            &[],
        )]);
        let hits = catalog.search("hdl").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(catalog.search("ferritin").await.unwrap().is_empty());
    }
}
