//! Vetted query templates.
//!
//! Each template is a hand-written, validator-clean Cypher shape for one
//! question intent. Template selection is lexical: the score is the share
//! of the question's content words covered by the template's keyword set.

use std::collections::HashSet;

use super::QueryError;
use crate::graph::cypher::{DOCUMENT_LABEL, DERIVED_FROM, INSTANCE_OF, TYPE_LABEL, VALUE_LABEL};
use crate::graph::CypherQuery;
use crate::model::PatientScope;

/// Question intents the template library covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryIntent {
    /// "Which biomarkers do I have on file?"
    ListBiomarkers,
    /// "What is my latest HDL?"
    LatestValue,
    /// "Anything out of range?"
    AbnormalResults,
    /// "Which documents have I uploaded?"
    DocumentHistory,
    /// "How has my cholesterol changed over time?"
    ValueTrend,
}

pub struct Template {
    pub intent: QueryIntent,
    keywords: &'static [&'static str],
    needs_marker: bool,
}

/// Words carrying no intent signal.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "any", "are", "can", "do", "did", "for", "had", "has", "have", "how", "i",
    "in", "is", "me", "my", "of", "on", "please", "show", "tell", "the", "was", "what", "whats",
    "which", "you",
];

fn tokenize(question: &str) -> Vec<String> {
    question
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .collect()
}

impl Template {
    /// Share of the question's content words this template covers.
    pub fn score(&self, question: &str) -> f32 {
        let content = tokenize(question);
        if content.is_empty() {
            return 0.0;
        }
        let keywords: HashSet<&str> = self.keywords.iter().copied().collect();
        let matched = content
            .iter()
            .filter(|w| keywords.contains(w.as_str()))
            .count();
        matched as f32 / content.len() as f32
    }

    /// Words of the question left after removing this template's keywords;
    /// for marker-bound intents this is the marker name.
    fn residue(&self, question: &str) -> String {
        tokenize(question)
            .into_iter()
            .filter(|w| !self.keywords.contains(&w.as_str()))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Instantiate this template for one question and scope.
    pub fn build(&self, question: &str, scope: &PatientScope) -> Result<CypherQuery, QueryError> {
        let mut query = CypherQuery::new(self.cypher_text())
            .param("patient_id", scope.patient_id.clone());
        if self.needs_marker {
            let marker = self.residue(question);
            if marker.is_empty() {
                return Err(QueryError::MissingContext(
                    "which biomarker are you asking about?".into(),
                ));
            }
            query = query.param("name", marker);
        }
        Ok(query)
    }

    fn cypher_text(&self) -> String {
        match self.intent {
            QueryIntent::ListBiomarkers => format!(
                "MATCH (v:{VALUE_LABEL} {{patient_id: $patient_id}})-[:{DERIVED_FROM}]->(d:{DOCUMENT_LABEL}) \
                 MATCH (v)-[:{INSTANCE_OF}]->(t:{TYPE_LABEL}) \
                 WHERE NOT coalesce(d.deleted, false) \
                 RETURN DISTINCT t.canonical_name AS name, t.validated AS validated \
                 ORDER BY name"
            ),
            QueryIntent::LatestValue => format!(
                "MATCH (v:{VALUE_LABEL} {{patient_id: $patient_id}})-[:{DERIVED_FROM}]->(d:{DOCUMENT_LABEL}) \
                 MATCH (v)-[:{INSTANCE_OF}]->(t:{TYPE_LABEL}) \
                 WHERE NOT coalesce(d.deleted, false) \
                   AND (toLower(t.canonical_name) CONTAINS toLower($name) \
                        OR toLower(t.display_name) CONTAINS toLower($name)) \
                 RETURN t.canonical_name AS name, v.value_numeric AS value_numeric, \
                        v.value_text AS value_text, v.unit AS unit, \
                        v.observed_at AS observed_at, v.status AS status \
                 ORDER BY v.observed_at DESC LIMIT 1"
            ),
            QueryIntent::AbnormalResults => format!(
                "MATCH (v:{VALUE_LABEL} {{patient_id: $patient_id}})-[:{DERIVED_FROM}]->(d:{DOCUMENT_LABEL}) \
                 MATCH (v)-[:{INSTANCE_OF}]->(t:{TYPE_LABEL}) \
                 WHERE NOT coalesce(d.deleted, false) \
                   AND (v.status = 'low' OR v.status = 'high') \
                 RETURN t.canonical_name AS name, v.value_numeric AS value_numeric, \
                        v.unit AS unit, v.observed_at AS observed_at, v.status AS status \
                 ORDER BY v.observed_at DESC"
            ),
            QueryIntent::DocumentHistory => format!(
                "MATCH (d:{DOCUMENT_LABEL} {{patient_id: $patient_id}}) \
                 WHERE NOT coalesce(d.deleted, false) \
                 RETURN d.document_name AS document_name, d.report_date AS report_date, \
                        d.created_at AS created_at \
                 ORDER BY d.created_at"
            ),
            QueryIntent::ValueTrend => format!(
                "MATCH (v:{VALUE_LABEL} {{patient_id: $patient_id}})-[:{DERIVED_FROM}]->(d:{DOCUMENT_LABEL}) \
                 MATCH (v)-[:{INSTANCE_OF}]->(t:{TYPE_LABEL}) \
                 WHERE NOT coalesce(d.deleted, false) \
                   AND (toLower(t.canonical_name) CONTAINS toLower($name) \
                        OR toLower(t.display_name) CONTAINS toLower($name)) \
                 RETURN v.observed_at AS observed_at, v.value_numeric AS value_numeric, \
                        v.unit AS unit, v.status AS status \
                 ORDER BY v.observed_at"
            ),
        }
    }
}

pub struct TemplateLibrary {
    templates: Vec<Template>,
}

impl TemplateLibrary {
    pub fn standard() -> Self {
        Self {
            templates: vec![
                Template {
                    intent: QueryIntent::ListBiomarkers,
                    keywords: &["list", "all", "biomarkers", "markers", "tests", "tracked"],
                    needs_marker: false,
                },
                Template {
                    intent: QueryIntent::LatestValue,
                    keywords: &["latest", "last", "current", "recent", "value", "level", "now"],
                    needs_marker: true,
                },
                Template {
                    intent: QueryIntent::AbnormalResults,
                    keywords: &[
                        "abnormal", "elevated", "flagged", "high", "low", "out", "outside",
                        "range", "results", "wrong",
                    ],
                    needs_marker: false,
                },
                Template {
                    intent: QueryIntent::DocumentHistory,
                    keywords: &[
                        "documents", "uploads", "uploaded", "reports", "files", "papers",
                    ],
                    needs_marker: false,
                },
                Template {
                    intent: QueryIntent::ValueTrend,
                    keywords: &[
                        "trend", "over", "time", "history", "change", "changed", "changing",
                        "evolution", "evolved",
                    ],
                    needs_marker: true,
                },
            ],
        }
    }

    /// Best template at or above `threshold`, with its score.
    pub fn select(&self, question: &str, threshold: f32) -> Option<(&Template, f32)> {
        self.templates
            .iter()
            .map(|t| (t, t.score(question)))
            .filter(|(_, score)| *score >= threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }
}
