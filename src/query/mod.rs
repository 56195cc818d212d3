//! Natural-language querying over the graph.
//!
//! Requests are answered template-first: a small taxonomy of vetted query
//! shapes covers the common questions, and only an unmatched request falls
//! through to model-generated Cypher. Everything that reaches the driver,
//! template or generated, passes the same tenant-scope validator.

pub mod dynamic;
pub mod engine;
pub mod templates;
pub mod validate;

pub use dynamic::{DynamicGenerator, HttpQueryModel, QueryDryRun, QueryModel};
pub use engine::{QueryEngine, QueryOutcome, QueryRequest};
pub use templates::{QueryIntent, TemplateLibrary};
pub use validate::validate_query;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("query is not tenant-scoped: {0}")]
    TenantScopeViolation(String),

    #[error("query failed validation: {0}")]
    Validation(String),

    #[error("request is missing context: {0}")]
    MissingContext(String),

    #[error("query model call failed: {0}")]
    Model(String),

    #[error("the question could not be answered safely")]
    CouldNotAnswer,

    #[error(transparent)]
    Execution(#[from] crate::graph::GraphError),
}
