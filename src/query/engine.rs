//! Query engine: templates first, generated Cypher as fallback.

use std::sync::Arc;

use serde_json::Value;
use tokio::time::timeout;

use super::dynamic::DynamicGenerator;
use super::templates::TemplateLibrary;
use super::validate::validate_query;
use super::QueryError;
use crate::config::PipelineConfig;
use crate::graph::{CypherQuery, GraphDriver, GraphError};
use crate::model::PatientScope;

/// One natural-language question.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub question: String,
}

/// Outcome of answering a request. Declining to answer is a normal outcome,
/// not an error.
#[derive(Debug)]
pub enum QueryOutcome {
    Answered {
        /// The Cypher that produced the rows, for audit.
        query: String,
        rows: Vec<Value>,
    },
    CouldNotAnswer {
        reason: String,
    },
}

pub struct QueryEngine {
    driver: Arc<dyn GraphDriver>,
    templates: TemplateLibrary,
    generator: Option<DynamicGenerator>,
    config: PipelineConfig,
}

impl QueryEngine {
    pub fn new(
        driver: Arc<dyn GraphDriver>,
        generator: Option<DynamicGenerator>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            driver,
            templates: TemplateLibrary::standard(),
            generator,
            config,
        }
    }

    /// Answer one question for one patient.
    pub async fn answer(
        &self,
        request: &QueryRequest,
        scope: &PatientScope,
    ) -> Result<QueryOutcome, QueryError> {
        let query = match self.plan(request, scope).await {
            Ok(query) => query,
            Err(QueryError::CouldNotAnswer) => {
                return Ok(QueryOutcome::CouldNotAnswer {
                    reason: "no safe query shape was found for this question".into(),
                })
            }
            Err(QueryError::MissingContext(reason)) => {
                return Ok(QueryOutcome::CouldNotAnswer { reason })
            }
            Err(e) => return Err(e),
        };

        let seconds = self.config.call_timeout_secs;
        let results = timeout(self.config.call_timeout(), self.driver.execute(&[query.clone()]))
            .await
            .map_err(|_| QueryError::Execution(GraphError::Timeout { seconds }))??;
        let rows = results.into_iter().next().unwrap_or_default();
        tracing::info!(rows = rows.len(), "query answered");
        Ok(QueryOutcome::Answered {
            query: query.text,
            rows,
        })
    }

    async fn plan(
        &self,
        request: &QueryRequest,
        scope: &PatientScope,
    ) -> Result<CypherQuery, QueryError> {
        if let Some((template, score)) = self
            .templates
            .select(&request.question, self.config.template_match_threshold)
        {
            tracing::debug!(intent = ?template.intent, score, "template selected");
            match template.build(&request.question, scope) {
                Ok(query) => {
                    // Templates are vetted at build time; a validator reject
                    // here is a bug in the template, not in the request.
                    validate_query(&query.text, scope, &query.params)?;
                    return Ok(query);
                }
                // An underspecified question may still be answerable by the
                // generator, which sees the full question text.
                Err(QueryError::MissingContext(reason)) => {
                    if self.generator.is_none() {
                        return Err(QueryError::MissingContext(reason));
                    }
                }
                Err(e) => return Err(e),
            }
        }

        match &self.generator {
            Some(generator) => generator.generate(&request.question, scope).await,
            None => Err(QueryError::CouldNotAnswer),
        }
    }
}
