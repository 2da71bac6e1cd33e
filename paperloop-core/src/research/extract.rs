//! Structured-completion boundary.
//!
//! Model output arrives as untyped text. Each function here validates it
//! against one expected shape and converts it to a typed value before it
//! reaches the state machine. Parse failures never escape this module: every
//! shape has a documented fallback.

use crate::error::ExtractionError;
use crate::types::{Finding, PaperRef};
use serde_json::{Map, Value};

/// Returned when a synthesis object lacks a `report` field.
pub const MISSING_REPORT: &str = "No report generated";

/// Parse model output as JSON.
///
/// Tolerates surrounding whitespace and a single markdown code fence.
pub fn parse_json_response(text: &str) -> Result<Value, ExtractionError> {
    let trimmed = strip_code_fence(text.trim());
    serde_json::from_str(trimmed).map_err(|e| ExtractionError::ParseFailure {
        message: e.to_string(),
    })
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let Some(body) = rest.strip_suffix("```") else {
        return text;
    };
    // Drop an info string such as `json` on the opening fence line.
    match body.find('\n') {
        Some(newline) if !body[..newline].contains(['{', '[']) => body[newline + 1..].trim(),
        _ => body.trim(),
    }
}

/// Convert an analysis reply into a Finding.
///
/// `query` and `top_papers` always come from the round, never from the model.
/// Unparseable or non-object output yields [`Finding::parse_fallback`].
pub fn analysis_from_text(text: &str, query: &str, top_papers: Vec<PaperRef>) -> Finding {
    let object = match parse_json_response(text) {
        Ok(Value::Object(object)) => object,
        Ok(other) => {
            tracing::warn!(kind = json_kind(&other), "Analysis reply is not a JSON object");
            return Finding::parse_fallback(query, top_papers);
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to parse analysis reply, using defaults");
            return Finding::parse_fallback(query, top_papers);
        }
    };

    Finding {
        query: query.to_string(),
        insights: string_list(&object, "insights"),
        relevance_score: relevance(&object),
        summary: object
            .get("summary")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        key_points: string_list(&object, "key_points"),
        research_gaps: string_list(&object, "research_gaps"),
        top_papers,
    }
}

/// Read `should_continue` from a decision reply. Anything unreadable means stop.
pub fn decision_from_text(text: &str) -> bool {
    match parse_json_response(text) {
        Ok(value) => value
            .get("should_continue")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to parse continuation reply, stopping");
            false
        }
    }
}

/// Read a list of follow-up queries. Anything unreadable means no queries.
///
/// Entries are trimmed and kept in order, blanks included; see [`first_query`].
pub fn queries_from_text(text: &str) -> Vec<String> {
    match parse_json_response(text) {
        Ok(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.trim().to_string(),
                _ => String::new(),
            })
            .collect(),
        Ok(other) => {
            tracing::warn!(kind = json_kind(&other), "Follow-up reply is not a JSON array");
            Vec::new()
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to parse follow-up queries");
            Vec::new()
        }
    }
}

/// The query to continue with: the first suggestion, unless it is blank.
///
/// Later suggestions are never promoted; a blank first entry stops the loop.
pub fn first_query(queries: Vec<String>) -> Option<String> {
    queries
        .into_iter()
        .next()
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
}

/// Extract the report from a synthesis reply.
///
/// Any text is preferable to no report: output that is not a JSON object is
/// returned verbatim, and an object without `report` yields [`MISSING_REPORT`].
pub fn report_from_text(text: &str) -> String {
    match parse_json_response(text) {
        Ok(Value::Object(object)) => object
            .get("report")
            .map(|report| match report {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| MISSING_REPORT.to_string()),
        Ok(_) => text.to_string(),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to parse synthesis reply, returning raw text");
            text.to_string()
        }
    }
}

fn string_list(object: &Map<String, Value>, key: &str) -> Vec<String> {
    match object.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn relevance(object: &Map<String, Value>) -> u8 {
    let score = match object.get("relevance_score") {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match score {
        Some(s) if s.is_finite() => s.round().clamp(0.0, 10.0) as u8,
        _ => 5,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
