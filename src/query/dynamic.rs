//! Model-generated Cypher for questions no template covers.
//!
//! Generated text is never trusted: it goes through the same validator as
//! templates, gets one regeneration attempt with the validator's feedback,
//! and novel query shapes are dry-run before real execution when a dry-run
//! backend is available.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::sync::Arc;

use super::validate::validate_query;
use super::QueryError;
use crate::graph::CypherQuery;
use crate::model::PatientScope;

/// Graph shape description handed to the model with every request.
pub const SCHEMA_SUMMARY: &str = "\
Node labels:\n\
  DocumentReferenceNode {uuid, patient_id, user_id, document_name, report_date, created_at, deleted}\n\
  ObservationValueNode {uuid, patient_id, value_numeric, value_text, unit, observed_at, status}\n\
  ObservationTypeNode {catalog_id, unit, canonical_name, display_name, aliases, validated}\n\
Relationships:\n\
  (ObservationValueNode)-[:INSTANCE_OF]->(ObservationTypeNode)\n\
  (ObservationValueNode)-[:DERIVED_FROM]->(DocumentReferenceNode)\n\
Rules:\n\
  You MUST only return data related to the patient bound to $patient_id. \
The first MATCH clause must bind DocumentReferenceNode or ObservationValueNode \
with {patient_id: $patient_id}. ObservationTypeNode carries no patient_id and \
may only be reached through INSTANCE_OF. Write every MATCH clause before \
the first WHERE clause. Read-only Cypher: never CREATE, \
MERGE, SET, DELETE or REMOVE. Compare names with \
toLower(...) CONTAINS toLower(...), never string equality. $patient_id is the \
only parameter available; inline every other value as a literal. \
Exclude soft-deleted documents with WHERE NOT coalesce(d.deleted, false). \
Return ONLY the Cypher statement, no prose.";

/// Seam for the Cypher-writing model.
#[async_trait]
pub trait QueryModel: Send + Sync {
    /// Translate a question into Cypher. `feedback` carries the validator's
    /// complaint about the previous attempt, if any.
    async fn translate(
        &self,
        question: &str,
        schema: &str,
        feedback: Option<&str>,
    ) -> Result<String, QueryError>;
}

/// Optional backend that can plan a query without touching data.
#[async_trait]
pub trait QueryDryRun: Send + Sync {
    async fn dry_run(&self, query: &CypherQuery) -> Result<(), QueryError>;
}

/// Client for a `generateContent`-style text endpoint.
pub struct HttpQueryModel {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpQueryModel {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[async_trait]
impl QueryModel for HttpQueryModel {
    async fn translate(
        &self,
        question: &str,
        schema: &str,
        feedback: Option<&str>,
    ) -> Result<String, QueryError> {
        let mut prompt = format!(
            "Translate this question into one Cypher query.\n\n{schema}\n\nQuestion: {question}"
        );
        if let Some(feedback) = feedback {
            prompt.push_str(&format!(
                "\n\nYour previous attempt was rejected: {feedback}\nFix it."
            ));
        }
        let body = serde_json::json!({
            "contents": [{ "parts": [{ "text": prompt }] }]
        });
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        );
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| QueryError::Model(format!("request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(QueryError::Model(format!("endpoint returned {status}")));
        }
        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| QueryError::Model(format!("bad response body: {e}")))?;
        parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().find_map(|p| p.text))
            .ok_or_else(|| QueryError::Model("response has no text candidate".into()))
    }
}

// Simple anchored read: one or two MATCHes, a WHERE at most, and a RETURN.
// Anything fancier (UNION, UNWIND, subqueries) counts as novel.
static LOW_RISK_SHAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^\s*MATCH\b[^;]*\bRETURN\b[^;]*$").unwrap()
});

static NOVEL_CONSTRUCTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(UNION|UNWIND|FOREACH|EXISTS\s*\{|COUNT\s*\{)").unwrap()
});

fn is_low_risk(text: &str) -> bool {
    LOW_RISK_SHAPE.is_match(text) && !NOVEL_CONSTRUCTS.is_match(text)
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("cypher").unwrap_or(rest);
    rest.trim_start_matches(['\r', '\n'])
        .strip_suffix("```")
        .unwrap_or(rest)
        .trim()
}

/// Validated, dry-run-gated Cypher generation.
pub struct DynamicGenerator {
    model: Arc<dyn QueryModel>,
    dry_run: Option<Arc<dyn QueryDryRun>>,
}

impl DynamicGenerator {
    pub fn new(model: Arc<dyn QueryModel>, dry_run: Option<Arc<dyn QueryDryRun>>) -> Self {
        Self { model, dry_run }
    }

    /// Generate a query for the question, or conclude it cannot be answered
    /// safely. Model transport errors propagate; safety rejections after
    /// the retry collapse into [`QueryError::CouldNotAnswer`].
    pub async fn generate(
        &self,
        question: &str,
        scope: &PatientScope,
    ) -> Result<CypherQuery, QueryError> {
        let mut feedback: Option<String> = None;
        for attempt in 0..2 {
            let raw = self
                .model
                .translate(question, SCHEMA_SUMMARY, feedback.as_deref())
                .await?;
            let text = strip_code_fence(&raw).to_string();
            let query = CypherQuery::new(text).param("patient_id", scope.patient_id.clone());

            if let Err(e) = validate_query(&query.text, scope, &query.params) {
                tracing::warn!(attempt, error = %e, "generated query rejected");
                feedback = Some(e.to_string());
                continue;
            }
            if !is_low_risk(&query.text) {
                if let Some(dry_run) = &self.dry_run {
                    if let Err(e) = dry_run.dry_run(&query).await {
                        tracing::warn!(attempt, error = %e, "generated query failed dry run");
                        feedback = Some(e.to_string());
                        continue;
                    }
                }
            }
            tracing::debug!(attempt, "generated query accepted");
            return Ok(query);
        }
        Err(QueryError::CouldNotAnswer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedModel {
        responses: Vec<String>,
        calls: AtomicUsize,
        saw_feedback: AtomicUsize,
    }

    impl ScriptedModel {
        fn new(responses: Vec<&str>) -> Self {
            Self {
                responses: responses.into_iter().map(str::to_string).collect(),
                calls: AtomicUsize::new(0),
                saw_feedback: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl QueryModel for ScriptedModel {
        async fn translate(
            &self,
            _question: &str,
            _schema: &str,
            feedback: Option<&str>,
        ) -> Result<String, QueryError> {
            if feedback.is_some() {
                self.saw_feedback.fetch_add(1, Ordering::SeqCst);
            }
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.responses[n.min(self.responses.len() - 1)].clone())
        }
    }

    fn scope() -> PatientScope {
        PatientScope::new("p-1", "u-1")
    }

    const GOOD: &str = "MATCH (v:ObservationValueNode {patient_id: $patient_id})\
        -[:INSTANCE_OF]->(t:ObservationTypeNode) \
        RETURN t.canonical_name, v.value_numeric";

    const UNSCOPED: &str = "MATCH (t:ObservationTypeNode) RETURN t.canonical_name";

    #[tokio::test]
    async fn valid_generation_passes_first_try() {
        let model = Arc::new(ScriptedModel::new(vec![GOOD]));
        let generator = DynamicGenerator::new(Arc::clone(&model) as Arc<dyn QueryModel>, None);
        let query = generator.generate("custom question", &scope()).await.unwrap();
        assert!(query.text.contains("ObservationValueNode"));
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejected_generation_retries_with_feedback() {
        let model = Arc::new(ScriptedModel::new(vec![UNSCOPED, GOOD]));
        let generator = DynamicGenerator::new(Arc::clone(&model) as Arc<dyn QueryModel>, None);
        let query = generator.generate("custom question", &scope()).await.unwrap();
        assert!(query.text.contains("patient_id"));
        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
        assert_eq!(model.saw_feedback.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn two_rejections_mean_no_answer() {
        let model = Arc::new(ScriptedModel::new(vec![UNSCOPED, UNSCOPED]));
        let generator = DynamicGenerator::new(model, None);
        assert!(matches!(
            generator.generate("custom question", &scope()).await,
            Err(QueryError::CouldNotAnswer)
        ));
    }

    #[tokio::test]
    async fn fenced_cypher_is_unwrapped() {
        let fenced = format!("```cypher\n{GOOD}\n```");
        let model = Arc::new(ScriptedModel::new(vec![&fenced]));
        let generator = DynamicGenerator::new(model, None);
        let query = generator.generate("q", &scope()).await.unwrap();
        assert!(!query.text.contains("```"));
    }

    #[tokio::test]
    async fn novel_shapes_go_through_dry_run() {
        struct CountingDryRun(AtomicUsize);
        #[async_trait]
        impl QueryDryRun for CountingDryRun {
            async fn dry_run(&self, _query: &CypherQuery) -> Result<(), QueryError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        // UNWIND makes the shape novel.
        let novel = "MATCH (v:ObservationValueNode {patient_id: $patient_id})\
            -[:INSTANCE_OF]->(t:ObservationTypeNode) \
            UNWIND t.aliases AS alias RETURN alias";
        let dry_run = Arc::new(CountingDryRun(AtomicUsize::new(0)));
        let generator = DynamicGenerator::new(
            Arc::new(ScriptedModel::new(vec![novel])),
            Some(Arc::clone(&dry_run) as Arc<dyn QueryDryRun>),
        );
        generator.generate("q", &scope()).await.unwrap();
        assert_eq!(dry_run.0.load(Ordering::SeqCst), 1);

        // The plain shape skips the dry run.
        let dry_run2 = Arc::new(CountingDryRun(AtomicUsize::new(0)));
        let generator = DynamicGenerator::new(
            Arc::new(ScriptedModel::new(vec![GOOD])),
            Some(Arc::clone(&dry_run2) as Arc<dyn QueryDryRun>),
        );
        generator.generate("q", &scope()).await.unwrap();
        assert_eq!(dry_run2.0.load(Ordering::SeqCst), 0);
    }
}
