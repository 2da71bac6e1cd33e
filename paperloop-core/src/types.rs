//! Research data model.
//!
//! Defines the records that flow through the research loop: paper references,
//! per-round findings, the compacted carry-over state, the terminal result,
//! and the search request handed to a paper source.

use crate::error::FetchError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Summary shown for a round whose search came back empty.
pub const NO_PAPERS_SUMMARY: &str = "No papers found for this query";

/// Summary shown when the model's analysis could not be parsed.
pub const PARSE_FAILURE_SUMMARY: &str = "Failed to parse LLM response";

/// A paper record normalized from the paper index.
///
/// Identity is `id`. Optional upstream fields are empty strings when absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaperRef {
    #[serde(alias = "arxiv_id")]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub published: String,
    #[serde(default)]
    pub updated: String,
    #[serde(default)]
    pub primary_category: String,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub pdf_url: String,
    #[serde(default)]
    pub abs_url: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub journal_ref: String,
    #[serde(default)]
    pub doi: String,
}

impl PaperRef {
    /// The first ten characters of the publication timestamp (`YYYY-MM-DD`).
    pub fn published_date(&self) -> String {
        self.published.chars().take(10).collect()
    }
}

/// The evaluation produced by one research round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub query: String,
    #[serde(default)]
    pub insights: Vec<String>,
    pub relevance_score: u8,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub research_gaps: Vec<String>,
    #[serde(default)]
    pub top_papers: Vec<PaperRef>,
}

impl Finding {
    /// Finding for a round whose search returned nothing.
    pub fn no_papers(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            insights: Vec::new(),
            relevance_score: 0,
            summary: NO_PAPERS_SUMMARY.to_string(),
            key_points: Vec::new(),
            research_gaps: Vec::new(),
            top_papers: Vec::new(),
        }
    }

    /// Finding substituted when the model's analysis is unreadable.
    pub fn parse_fallback(query: impl Into<String>, top_papers: Vec<PaperRef>) -> Self {
        Self {
            query: query.into(),
            insights: Vec::new(),
            relevance_score: 5,
            summary: PARSE_FAILURE_SUMMARY.to_string(),
            key_points: Vec::new(),
            research_gaps: Vec::new(),
            top_papers,
        }
    }
}

/// The complete carry-over between loop iterations.
///
/// Nothing else survives a re-entry boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub topic: String,
    pub max_iterations: u32,
    #[serde(default)]
    pub current_iteration: u32,
    #[serde(default)]
    pub findings: Vec<Finding>,
    pub current_query: String,
}

impl WorkflowState {
    /// Initial state: the first query is the topic itself.
    pub fn new(topic: impl Into<String>, max_iterations: u32) -> Self {
        let topic = topic.into();
        Self {
            current_query: topic.clone(),
            topic,
            max_iterations,
            current_iteration: 0,
            findings: Vec::new(),
        }
    }

    pub fn at_cap(&self) -> bool {
        self.current_iteration >= self.max_iterations
    }
}

/// Terminal output of a completed research instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalResult {
    pub topic: String,
    pub iterations: u32,
    pub report: String,
    pub findings_count: usize,
}

/// Externally visible lifecycle of a research instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Terminated,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Failed | InstanceStatus::Terminated
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceStatus::Pending => write!(f, "pending"),
            InstanceStatus::Running => write!(f, "running"),
            InstanceStatus::Completed => write!(f, "completed"),
            InstanceStatus::Failed => write!(f, "failed"),
            InstanceStatus::Terminated => write!(f, "terminated"),
        }
    }
}

// ── Search requests ───────────────────────────────────────────

/// Sort criteria accepted by the paper index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    #[default]
    Relevance,
    LastUpdated,
    Submitted,
}

impl SortBy {
    pub fn as_api_str(&self) -> &'static str {
        match self {
            SortBy::Relevance => "relevance",
            SortBy::LastUpdated => "lastUpdatedDate",
            SortBy::Submitted => "submittedDate",
        }
    }
}

impl FromStr for SortBy {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "relevance" => Ok(SortBy::Relevance),
            "lastUpdatedDate" | "last_updated" => Ok(SortBy::LastUpdated),
            "submittedDate" | "submitted" => Ok(SortBy::Submitted),
            other => Err(FetchError::invalid(format!(
                "sort_by must be 'relevance', 'lastUpdatedDate', or 'submittedDate' (got '{}')",
                other
            ))),
        }
    }
}

/// Sort order accepted by the paper index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Ascending,
    #[default]
    Descending,
}

impl SortOrder {
    pub fn as_api_str(&self) -> &'static str {
        match self {
            SortOrder::Ascending => "ascending",
            SortOrder::Descending => "descending",
        }
    }
}

impl FromStr for SortOrder {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ascending" | "asc" => Ok(SortOrder::Ascending),
            "descending" | "desc" => Ok(SortOrder::Descending),
            other => Err(FetchError::invalid(format!(
                "sort_order must be 'ascending' or 'descending' (got '{}')",
                other
            ))),
        }
    }
}

/// Upper bound on results per request accepted by the paper index.
pub const MAX_RESULTS_LIMIT: u32 = 100;

/// Parameters of one search against the paper index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub max_results: u32,
    #[serde(default)]
    pub sort_by: SortBy,
    #[serde(default)]
    pub sort_order: SortOrder,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, max_results: u32) -> Self {
        Self {
            query: query.into(),
            max_results,
            sort_by: SortBy::Relevance,
            sort_order: SortOrder::Descending,
        }
    }

    pub fn sorted(mut self, sort_by: SortBy, sort_order: SortOrder) -> Self {
        self.sort_by = sort_by;
        self.sort_order = sort_order;
        self
    }

    /// Reject caller misuse before anything goes on the wire.
    pub fn validate(&self) -> Result<(), FetchError> {
        if self.query.trim().is_empty() {
            return Err(FetchError::invalid("query cannot be empty"));
        }
        validate_max_results(self.max_results)
    }
}

pub fn validate_max_results(max_results: u32) -> Result<(), FetchError> {
    if !(1..=MAX_RESULTS_LIMIT).contains(&max_results) {
        return Err(FetchError::invalid(format!(
            "max_results must be between 1 and {} (got {})",
            MAX_RESULTS_LIMIT, max_results
        )));
    }
    Ok(())
}
