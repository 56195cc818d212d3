//! Pipeline configuration.
//!
//! Every operational knob lives here with a serde default, so a deployment
//! can override any subset from a JSON config file without restating the rest.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunable limits and thresholds for the whole pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Documents processed concurrently across all users.
    pub max_concurrent_documents: usize,
    /// Documents processed concurrently for any single user.
    pub max_concurrent_per_user: usize,
    /// PDF pages rendered concurrently (rendering is CPU-bound).
    pub max_concurrent_renders: usize,
    /// Upper bound on any single external call (model, catalog, graph).
    pub call_timeout_secs: u64,
    /// How long a finished task's status stays queryable before eviction.
    pub finished_task_retention_secs: u64,
    /// Minimum name similarity for a catalog match to count as validated.
    pub catalog_similarity_threshold: f32,
    /// Minimum intent similarity for a query template to be used directly.
    pub template_match_threshold: f32,
    /// Render resolution for PDF pages.
    pub render_dpi: u32,
    /// Vision model identifier passed to the extraction endpoint.
    pub extraction_model: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_documents: 10,
            max_concurrent_per_user: 3,
            max_concurrent_renders: 4,
            call_timeout_secs: 45,
            finished_task_retention_secs: 15 * 60,
            catalog_similarity_threshold: 0.82,
            template_match_threshold: 0.35,
            render_dpi: 300,
            extraction_model: "gemini-2.0-flash".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn finished_task_retention(&self) -> Duration {
        Duration::from_secs(self.finished_task_retention_secs)
    }
}

/// Default tracing filter: our crate at debug, everything else at warn.
pub fn default_log_filter() -> String {
    format!("warn,{}=debug", env!("CARGO_PKG_NAME"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_limits() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_concurrent_documents, 10);
        assert_eq!(config.max_concurrent_per_user, 3);
        assert_eq!(config.max_concurrent_renders, 4);
        assert_eq!(config.call_timeout(), Duration::from_secs(45));
    }

    #[test]
    fn partial_json_overrides_keep_other_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"max_concurrent_documents": 2}"#).unwrap();
        assert_eq!(config.max_concurrent_documents, 2);
        assert_eq!(config.max_concurrent_per_user, 3);
        assert_eq!(config.call_timeout_secs, 45);
    }

    #[test]
    fn thresholds_are_fractions() {
        let config = PipelineConfig::default();
        assert!(config.catalog_similarity_threshold > 0.0);
        assert!(config.catalog_similarity_threshold <= 1.0);
        assert!(config.template_match_threshold < config.catalog_similarity_threshold);
    }
}
