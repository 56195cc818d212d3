//! Cypher driver seam.
//!
//! The store layer builds parameterized statements; the driver runs them.
//! One `execute` call is one transaction, which is what makes a document
//! commit atomic.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::GraphError;

/// One parameterized Cypher statement.
#[derive(Debug, Clone)]
pub struct CypherQuery {
    pub text: String,
    pub params: Map<String, Value>,
}

impl CypherQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            params: Map::new(),
        }
    }

    pub fn param(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }
}

/// Executes statements against the graph database.
#[async_trait]
pub trait GraphDriver: Send + Sync {
    /// Run all statements in one transaction. Returns, per statement, the
    /// result rows as JSON objects keyed by return name.
    async fn execute(&self, queries: &[CypherQuery]) -> Result<Vec<Vec<Value>>, GraphError>;
}

/// Driver for the graph database's transactional HTTP endpoint.
pub struct HttpGraphDriver {
    client: reqwest::Client,
    commit_url: String,
    user: String,
    password: String,
}

impl HttpGraphDriver {
    /// `base_url` is the server root; statements go to the implicit-commit
    /// transaction endpoint of `database`.
    pub fn new(
        base_url: &str,
        database: &str,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            commit_url: format!("{}/db/{database}/tx/commit", base_url.trim_end_matches('/')),
            user: user.into(),
            password: password.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TxResponse {
    #[serde(default)]
    results: Vec<TxResult>,
    #[serde(default)]
    errors: Vec<TxError>,
}

#[derive(Debug, Deserialize)]
struct TxResult {
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    data: Vec<TxRow>,
}

#[derive(Debug, Deserialize)]
struct TxRow {
    #[serde(default)]
    row: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct TxError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[async_trait]
impl GraphDriver for HttpGraphDriver {
    async fn execute(&self, queries: &[CypherQuery]) -> Result<Vec<Vec<Value>>, GraphError> {
        let statements: Vec<Value> = queries
            .iter()
            .map(|q| {
                serde_json::json!({
                    "statement": q.text,
                    "parameters": Value::Object(q.params.clone()),
                })
            })
            .collect();

        let response = self
            .client
            .post(&self.commit_url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&serde_json::json!({ "statements": statements }))
            .send()
            .await
            .map_err(|e| GraphError::Driver(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GraphError::Driver(format!("endpoint returned {status}")));
        }
        let parsed: TxResponse = response
            .json()
            .await
            .map_err(|e| GraphError::Driver(format!("bad response body: {e}")))?;

        if let Some(err) = parsed.errors.first() {
            // The endpoint rolled the transaction back.
            if err.code.contains("ConstraintValidation") {
                return Err(GraphError::Constraint(err.message.clone()));
            }
            return Err(GraphError::Driver(format!("{}: {}", err.code, err.message)));
        }

        let results = parsed
            .results
            .into_iter()
            .map(|result| {
                result
                    .data
                    .into_iter()
                    .map(|row| {
                        let mut obj = Map::new();
                        for (column, value) in result.columns.iter().zip(row.row) {
                            obj.insert(column.clone(), value);
                        }
                        Value::Object(obj)
                    })
                    .collect()
            })
            .collect();
        Ok(results)
    }
}
