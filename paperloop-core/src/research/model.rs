//! Seams between the research loop and the outside world.
//!
//! `PaperSource` is the paper index; `ResearchModel` is the four structured
//! completions. `LlmResearchModel` implements the latter on top of any
//! `LlmProvider`.

use crate::brain::{CompletionRequest, LlmProvider, Message};
use crate::config::LlmConfig;
use crate::error::{FetchError, LlmError};
use crate::research::{extract, prompts};
use crate::types::{Finding, PaperRef, SearchRequest};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// A searchable paper index.
#[async_trait]
pub trait PaperSource: Send + Sync {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<PaperRef>, FetchError>;
}

/// The structured-completion capability the loop depends on.
///
/// Implementations recover malformed model output themselves; an `Err` means
/// the call itself failed and may be retried.
#[async_trait]
pub trait ResearchModel: Send + Sync {
    /// Evaluate the papers a query returned.
    async fn analyze(
        &self,
        topic: &str,
        query: &str,
        papers: &[PaperRef],
    ) -> Result<Finding, LlmError>;

    /// Whether another round is worthwhile.
    async fn should_continue(
        &self,
        topic: &str,
        findings: &[Finding],
        current_iteration: u32,
        max_iterations: u32,
    ) -> Result<bool, LlmError>;

    /// Candidate follow-up queries, best first. Empty means stop.
    async fn next_queries(
        &self,
        topic: &str,
        findings: &[Finding],
        iteration: u32,
    ) -> Result<Vec<String>, LlmError>;

    /// Final report text.
    async fn synthesize(&self, topic: &str, findings: &[Finding]) -> Result<String, LlmError>;
}

/// `ResearchModel` backed by a chat-completion provider.
pub struct LlmResearchModel {
    provider: Arc<dyn LlmProvider>,
    temperature: f32,
    max_tokens: u32,
    synthesis_max_tokens: u32,
    json_output: bool,
}

impl LlmResearchModel {
    pub fn new(provider: Arc<dyn LlmProvider>, config: &LlmConfig) -> Self {
        Self {
            provider,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            synthesis_max_tokens: config.synthesis_max_tokens,
            json_output: config.json_output,
        }
    }

    async fn ask(
        &self,
        messages: Vec<Message>,
        max_tokens: u32,
        json_object: bool,
    ) -> Result<String, LlmError> {
        let response = self
            .provider
            .complete(CompletionRequest {
                messages,
                temperature: self.temperature,
                max_tokens: Some(max_tokens),
                json_output: self.json_output && json_object,
            })
            .await?;
        tracing::debug!(
            model = %response.model,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "Model replied"
        );
        if response.finish_reason.as_deref() == Some("length") {
            tracing::warn!(max_tokens, "Model reply truncated at token limit");
        }
        Ok(response.text)
    }
}

#[async_trait]
impl ResearchModel for LlmResearchModel {
    async fn analyze(
        &self,
        topic: &str,
        query: &str,
        papers: &[PaperRef],
    ) -> Result<Finding, LlmError> {
        let text = self
            .ask(
                prompts::analysis_messages(topic, query, papers),
                self.max_tokens,
                true,
            )
            .await?;
        Ok(extract::analysis_from_text(&text, query, papers.to_vec()))
    }

    async fn should_continue(
        &self,
        topic: &str,
        findings: &[Finding],
        current_iteration: u32,
        max_iterations: u32,
    ) -> Result<bool, LlmError> {
        if current_iteration >= max_iterations {
            return Ok(false);
        }
        let text = self
            .ask(
                prompts::continuation_messages(topic, findings, current_iteration, max_iterations),
                self.max_tokens,
                true,
            )
            .await?;
        Ok(extract::decision_from_text(&text))
    }

    async fn next_queries(
        &self,
        topic: &str,
        findings: &[Finding],
        iteration: u32,
    ) -> Result<Vec<String>, LlmError> {
        // JSON-object mode would forbid the bare array this call expects.
        let text = self
            .ask(
                prompts::follow_up_messages(topic, findings, iteration),
                self.max_tokens,
                false,
            )
            .await?;
        Ok(extract::queries_from_text(&text))
    }

    async fn synthesize(&self, topic: &str, findings: &[Finding]) -> Result<String, LlmError> {
        let text = self
            .ask(
                prompts::synthesis_messages(topic, findings),
                self.synthesis_max_tokens,
                true,
            )
            .await?;
        Ok(extract::report_from_text(&text))
    }
}

/// A paper source that replays queued results, for testing.
///
/// Every request is recorded. An empty queue answers with no papers.
pub struct ScriptedPaperSource {
    results: Mutex<VecDeque<Result<Vec<PaperRef>, FetchError>>>,
    requests: Mutex<Vec<SearchRequest>>,
}

impl ScriptedPaperSource {
    pub fn new() -> Self {
        Self {
            results: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn queue_papers(&self, papers: Vec<PaperRef>) {
        self.lock_results().push_back(Ok(papers));
    }

    pub fn queue_error(&self, error: FetchError) {
        self.lock_results().push_back(Err(error));
    }

    pub fn requests(&self) -> Vec<SearchRequest> {
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests().len()
    }

    fn lock_results(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<Vec<PaperRef>, FetchError>>> {
        self.results
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for ScriptedPaperSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaperSource for ScriptedPaperSource {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<PaperRef>, FetchError> {
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(request.clone());
        self.lock_results().pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::MockLlmProvider;
    use crate::types::PARSE_FAILURE_SUMMARY;

    fn model(mock: Arc<MockLlmProvider>) -> LlmResearchModel {
        LlmResearchModel::new(mock, &LlmConfig::default())
    }

    fn papers() -> Vec<PaperRef> {
        vec![PaperRef {
            id: "2106.00001".into(),
            title: "On the Expressive Power of GNNs".into(),
            authors: vec!["Ada".into()],
            ..Default::default()
        }]
    }

    #[tokio::test]
    async fn test_analyze_uses_analysis_token_limit() {
        let mock = Arc::new(MockLlmProvider::new());
        mock.queue_text(r#"{"insights": ["a"], "relevance_score": 7, "summary": "s"}"#);
        let finding = model(mock.clone())
            .analyze("gnn", "gnn expressivity", &papers())
            .await
            .unwrap();

        assert_eq!(finding.relevance_score, 7);
        assert_eq!(finding.query, "gnn expressivity");
        assert_eq!(finding.top_papers.len(), 1);
        let req = &mock.requests()[0];
        assert_eq!(req.max_tokens, Some(2000));
        assert!(req.json_output);
        assert!(req.messages[1].content.contains("On the Expressive Power of GNNs"));
    }

    #[tokio::test]
    async fn test_analyze_recovers_from_prose() {
        let mock = Arc::new(MockLlmProvider::repeating("Here is my analysis: great papers."));
        let finding = model(mock).analyze("t", "q", &papers()).await.unwrap();
        assert_eq!(finding.summary, PARSE_FAILURE_SUMMARY);
        assert_eq!(finding.relevance_score, 5);
    }

    #[tokio::test]
    async fn test_should_continue_short_circuits_at_cap() {
        let mock = Arc::new(MockLlmProvider::repeating(r#"{"should_continue": true}"#));
        let m = model(mock.clone());
        assert!(!m.should_continue("t", &[], 3, 3).await.unwrap());
        assert_eq!(mock.call_count(), 0);
        assert!(m.should_continue("t", &[], 1, 3).await.unwrap());
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_next_queries_disables_json_object_mode() {
        let mock = Arc::new(MockLlmProvider::new());
        mock.queue_text(r#"["graph transformers", "oversmoothing"]"#);
        let queries = model(mock.clone()).next_queries("t", &[], 1).await.unwrap();
        assert_eq!(queries, vec!["graph transformers", "oversmoothing"]);
        assert!(!mock.requests()[0].json_output);
    }

    #[tokio::test]
    async fn test_synthesize_uses_synthesis_token_limit() {
        let mock = Arc::new(MockLlmProvider::new());
        mock.queue_text(r##"{"report": "# GNNs"}"##);
        let report = model(mock.clone()).synthesize("t", &[]).await.unwrap();
        assert_eq!(report, "# GNNs");
        assert_eq!(mock.requests()[0].max_tokens, Some(3000));
    }

    #[tokio::test]
    async fn test_scripted_source_replays_queue() {
        let source = ScriptedPaperSource::new();
        source.queue_papers(papers());
        source.queue_error(FetchError::Transport {
            message: "reset".into(),
        });

        let request = SearchRequest::new("gnn", 30);
        assert_eq!(source.search(&request).await.unwrap().len(), 1);
        assert!(source.search(&request).await.is_err());
        assert!(source.search(&request).await.unwrap().is_empty());
        assert_eq!(source.call_count(), 3);
        assert_eq!(source.requests()[0].query, "gnn");
    }

    #[tokio::test]
    async fn test_provider_errors_propagate() {
        let mock = Arc::new(MockLlmProvider::new());
        mock.queue_error(LlmError::Timeout { timeout_secs: 120 });
        let err = model(mock).synthesize("t", &[]).await.unwrap_err();
        assert!(matches!(err, LlmError::Timeout { .. }));
    }
}
