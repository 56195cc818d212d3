//! Structural validation of Cypher before it reaches the driver.
//!
//! The validator enforces the traversal contract: reads start at an
//! Instance node bound to `$patient_id` and reach Type nodes only through
//! `INSTANCE_OF`. It is deliberately conservative; a query it cannot prove
//! safe is rejected.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use super::QueryError;
use crate::graph::cypher::{DOCUMENT_LABEL, INSTANCE_OF, TYPE_LABEL, VALUE_LABEL};
use crate::model::PatientScope;

static WRITE_KEYWORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(CREATE|DELETE|DETACH|MERGE|SET|REMOVE|DROP|CALL)\b").unwrap()
});

static MATCH_CLAUSE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bMATCH\b").unwrap());

static WHERE_CLAUSE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bWHERE\b").unwrap());

static CONTAINS_CLAUSE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bCONTAINS\b").unwrap());

// String literal compared with `=` against a node property, e.g.
// `t.canonical_name = "HDL"`. Identifier-like properties are exempt.
static LITERAL_EQUALITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b\w+\.(?P<prop>\w+)\s*=\s*["']"#).unwrap()
});

const LITERAL_EQUALITY_ALLOWED: &[&str] = &["uuid", "catalog_id", "unit", "source_hash", "status"];

fn first_match_clause(text: &str) -> Option<&str> {
    let start = MATCH_CLAUSE.find(text)?.start();
    let rest = &text[start..];
    // The clause runs until the next top-level keyword.
    static CLAUSE_END: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)\b(WHERE|WITH|RETURN|ORDER|LIMIT|SKIP|OPTIONAL|MATCH)\b").unwrap()
    });
    let end = CLAUSE_END
        .find_at(rest, 5)
        .map(|m| m.start())
        .unwrap_or(rest.len());
    Some(&rest[..end])
}

/// Validate one read query against the tenant-scoping rules.
///
/// `params` are the parameters that will be sent with the query; the
/// `patient_id` parameter must be present and equal to the scope's.
pub fn validate_query(
    text: &str,
    scope: &PatientScope,
    params: &Map<String, Value>,
) -> Result<(), QueryError> {
    if let Some(keyword) = WRITE_KEYWORDS.find(text) {
        return Err(QueryError::Validation(format!(
            "write keyword {} is not allowed in reads",
            keyword.as_str()
        )));
    }
    if !MATCH_CLAUSE.is_match(text) {
        return Err(QueryError::Validation("query has no MATCH clause".into()));
    }

    // Anchor rule: the first MATCH binds an Instance label and names the
    // patient parameter.
    let anchor = first_match_clause(text).unwrap_or("");
    let anchored_label = anchor.contains(DOCUMENT_LABEL) || anchor.contains(VALUE_LABEL);
    if !anchored_label {
        return Err(QueryError::TenantScopeViolation(
            "first MATCH must bind a patient-owned node".into(),
        ));
    }
    if !anchor.contains("$patient_id") {
        return Err(QueryError::TenantScopeViolation(
            "first MATCH must constrain on $patient_id".into(),
        ));
    }
    match params.get("patient_id") {
        Some(Value::String(id)) if *id == scope.patient_id => {}
        _ => {
            return Err(QueryError::TenantScopeViolation(
                "patient_id parameter is missing or does not match the scope".into(),
            ));
        }
    }

    // Clause order: every MATCH comes before the first filter clause, so
    // the whole pattern is bound before anything is filtered.
    if let Some(where_pos) = WHERE_CLAUSE.find(text).map(|m| m.start()) {
        if MATCH_CLAUSE.find_at(text, where_pos).is_some() {
            return Err(QueryError::Validation(
                "MATCH after WHERE: bind the full pattern before filtering".into(),
            ));
        }
    }

    // Type nodes are reachable only through the traversal edge.
    if let Some(type_pos) = text.find(TYPE_LABEL) {
        if !text[..type_pos].contains(INSTANCE_OF) {
            return Err(QueryError::TenantScopeViolation(format!(
                "{TYPE_LABEL} may only be reached through {INSTANCE_OF}"
            )));
        }
    }

    // Name matching must be case-folded substring, not literal equality.
    for caps in LITERAL_EQUALITY.captures_iter(text) {
        let prop = &caps["prop"];
        if !LITERAL_EQUALITY_ALLOWED.contains(&prop) {
            return Err(QueryError::Validation(format!(
                "string equality on `{prop}` is too brittle, use toLower(...) CONTAINS"
            )));
        }
    }
    if CONTAINS_CLAUSE.is_match(text) && !text.contains("toLower(") {
        return Err(QueryError::Validation(
            "CONTAINS without toLower() is case-sensitive".into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> PatientScope {
        PatientScope::new("p-1", "u-1")
    }

    fn params() -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("patient_id".into(), Value::String("p-1".into()));
        map
    }

    const GOOD: &str = "MATCH (v:ObservationValueNode {patient_id: $patient_id})\
        -[:INSTANCE_OF]->(t:ObservationTypeNode) \
        WHERE toLower(t.canonical_name) CONTAINS toLower($name) \
        RETURN t.canonical_name, v.value_numeric";

    #[test]
    fn anchored_read_passes() {
        assert!(validate_query(GOOD, &scope(), &params()).is_ok());
    }

    #[test]
    fn write_keywords_are_rejected() {
        for text in [
            "MATCH (n) DELETE n",
            "CREATE (n:ObservationValueNode)",
            "MATCH (v:ObservationValueNode {patient_id: $patient_id}) SET v.x = 1",
        ] {
            assert!(matches!(
                validate_query(text, &scope(), &params()),
                Err(QueryError::Validation(_))
            ));
        }
    }

    #[test]
    fn unanchored_type_scan_is_a_scope_violation() {
        let text = "MATCH (t:ObservationTypeNode) RETURN t.canonical_name";
        assert!(matches!(
            validate_query(text, &scope(), &params()),
            Err(QueryError::TenantScopeViolation(_))
        ));
    }

    #[test]
    fn missing_patient_parameter_is_a_scope_violation() {
        let text = "MATCH (v:ObservationValueNode) RETURN v.value_numeric";
        assert!(matches!(
            validate_query(text, &scope(), &params()),
            Err(QueryError::TenantScopeViolation(_))
        ));
    }

    #[test]
    fn wrong_patient_parameter_is_a_scope_violation() {
        let mut bad = Map::new();
        bad.insert("patient_id".into(), Value::String("p-other".into()));
        assert!(matches!(
            validate_query(GOOD, &scope(), &bad),
            Err(QueryError::TenantScopeViolation(_))
        ));
    }

    #[test]
    fn literal_name_equality_is_rejected() {
        let text = "MATCH (v:ObservationValueNode {patient_id: $patient_id})\
            -[:INSTANCE_OF]->(t:ObservationTypeNode) \
            WHERE t.canonical_name = \"HDL\" RETURN v";
        assert!(matches!(
            validate_query(text, &scope(), &params()),
            Err(QueryError::Validation(_))
        ));
    }

    #[test]
    fn literal_equality_on_identifiers_is_fine() {
        let text = "MATCH (v:ObservationValueNode {patient_id: $patient_id})\
            -[:INSTANCE_OF]->(t:ObservationTypeNode) \
            WHERE t.unit = 'mg/dL' RETURN v.value_numeric";
        assert!(validate_query(text, &scope(), &params()).is_ok());
    }

    #[test]
    fn case_sensitive_contains_is_rejected() {
        let text = "MATCH (v:ObservationValueNode {patient_id: $patient_id})\
            -[:INSTANCE_OF]->(t:ObservationTypeNode) \
            WHERE t.canonical_name CONTAINS $name RETURN v";
        assert!(matches!(
            validate_query(text, &scope(), &params()),
            Err(QueryError::Validation(_))
        ));
    }

    #[test]
    fn match_after_where_is_rejected() {
        let text = "MATCH (v:ObservationValueNode {patient_id: $patient_id}) \
            WHERE v.unit = 'mg/dL' \
            MATCH (v)-[:INSTANCE_OF]->(t:ObservationTypeNode) RETURN t.canonical_name";
        assert!(matches!(
            validate_query(text, &scope(), &params()),
            Err(QueryError::Validation(_))
        ));
    }

    #[test]
    fn queries_without_match_are_rejected() {
        assert!(matches!(
            validate_query("RETURN 1", &scope(), &params()),
            Err(QueryError::Validation(_))
        ));
    }
}
