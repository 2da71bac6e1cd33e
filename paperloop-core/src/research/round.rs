//! One research round: search the paper index for a query and evaluate what
//! comes back.

use crate::config::PaperloopConfig;
use crate::error::WorkflowError;
use crate::research::checkpoint::StepRunner;
use crate::research::model::{PaperSource, ResearchModel};
use crate::retry::{RetryPolicy, with_policy};
use crate::types::{Finding, PaperRef, SearchRequest};
use std::sync::Arc;

pub const FETCH_STEP: &str = "fetch";
pub const ANALYZE_STEP: &str = "analyze";

/// Composes the paper source and the model into a single Finding per query.
pub struct PaperResearchRound {
    source: Arc<dyn PaperSource>,
    model: Arc<dyn ResearchModel>,
    papers_per_search: u32,
    papers_to_analyze: usize,
    network: RetryPolicy,
    llm: RetryPolicy,
}

impl PaperResearchRound {
    pub fn new(
        source: Arc<dyn PaperSource>,
        model: Arc<dyn ResearchModel>,
        config: &PaperloopConfig,
    ) -> Self {
        Self {
            source,
            model,
            papers_per_search: config.workflow.papers_per_search,
            papers_to_analyze: config.workflow.papers_to_analyze,
            network: config.retry.network.clone(),
            llm: config.retry.llm.clone(),
        }
    }

    /// Run the round for `query`, journaling the fetch and the analysis.
    ///
    /// An empty search short-circuits to [`Finding::no_papers`] without a
    /// model call.
    pub async fn run(
        &self,
        steps: &mut StepRunner<'_>,
        topic: &str,
        query: &str,
    ) -> Result<Finding, WorkflowError> {
        let request = SearchRequest::new(query, self.papers_per_search);
        let source = self.source.as_ref();
        let network = &self.network;
        let request_ref = &request;
        let papers: Vec<PaperRef> = steps
            .step(FETCH_STEP, || async move {
                with_policy(network, FETCH_STEP, move || source.search(request_ref))
                    .await
                    .map_err(|failure| failure.into_step_error(FETCH_STEP))
            })
            .await?;

        if papers.is_empty() {
            tracing::info!(
                instance = %steps.instance_id(),
                query,
                "No papers found, skipping analysis"
            );
            return Ok(Finding::no_papers(query));
        }

        let found = papers.len();
        let selected: Vec<PaperRef> = papers.into_iter().take(self.papers_to_analyze).collect();
        tracing::info!(
            instance = %steps.instance_id(),
            query,
            found,
            analyzing = selected.len(),
            "Analyzing papers"
        );

        let model = self.model.as_ref();
        let llm = &self.llm;
        let selected_ref = selected.as_slice();
        let mut finding: Finding = steps
            .step(ANALYZE_STEP, || async move {
                with_policy(llm, ANALYZE_STEP, move || {
                    model.analyze(topic, query, selected_ref)
                })
                .await
                .map_err(|failure| failure.into_step_error(ANALYZE_STEP))
            })
            .await?;

        finding.query = query.to_string();
        finding.top_papers = selected;
        Ok(finding)
    }
}
