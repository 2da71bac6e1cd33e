//! Integration tests for the research loop: scripted paper index and model,
//! real state machine, in-memory and file checkpoints.

use async_trait::async_trait;
use paperloop_core::brain::MockLlmProvider;
use paperloop_core::config::{LlmConfig, PaperloopConfig};
use paperloop_core::error::{FetchError, WorkflowError};
use paperloop_core::research::{
    CheckpointStore, FileCheckpointStore, InstanceCheckpoint, IterativeResearchLoop,
    LlmResearchModel, MemoryCheckpointStore, PaperSource, ScriptedPaperSource,
};
use paperloop_core::runtime::{ResearchRuntime, Termination};
use paperloop_core::types::{
    Finding, InstanceStatus, NO_PAPERS_SUMMARY, PARSE_FAILURE_SUMMARY, PaperRef, SearchRequest,
    WorkflowState,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

fn papers(prefix: &str, n: usize) -> Vec<PaperRef> {
    (0..n)
        .map(|i| PaperRef {
            id: format!("{}.{:05}", prefix, i),
            title: format!("Result {} for {}", i, prefix),
            authors: vec!["A. Author".into(), "B. Author".into()],
            ..Default::default()
        })
        .collect()
}

fn engine(
    source: Arc<dyn PaperSource>,
    mock: Arc<MockLlmProvider>,
    store: Arc<dyn CheckpointStore>,
) -> IterativeResearchLoop {
    let model = Arc::new(LlmResearchModel::new(mock, &LlmConfig::default()));
    IterativeResearchLoop::new(source, model, store, &PaperloopConfig::default())
}

fn analysis(score: u8) -> String {
    format!(
        r#"{{"insights": ["insight"], "relevance_score": {}, "summary": "round summary", "key_points": ["k"], "research_gaps": ["g"]}}"#,
        score
    )
}

#[tokio::test]
async fn test_gnn_two_iteration_scenario() {
    let source = Arc::new(ScriptedPaperSource::new());
    source.queue_papers(papers("2106", 5));
    source.queue_papers(Vec::new());
    let mock = Arc::new(MockLlmProvider::new());
    mock.queue_text(&analysis(7));
    mock.queue_text(r#"{"should_continue": true}"#);
    mock.queue_text(r#"["gnn expressivity", "graph transformers"]"#);
    mock.queue_text(r##"{"report": "# Graph Neural Networks"}"##);
    let store = Arc::new(MemoryCheckpointStore::new());
    let engine = engine(source.clone(), mock.clone(), store.clone());

    let mut cp = InstanceCheckpoint::new(WorkflowState::new("graph neural networks", 2));
    let result = engine
        .drive(&mut cp, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.topic, "graph neural networks");
    assert_eq!(result.iterations, 2);
    assert_eq!(result.findings_count, 2);
    assert_eq!(result.report, "# Graph Neural Networks");

    let queries: Vec<String> = source.requests().into_iter().map(|r| r.query).collect();
    assert_eq!(queries, vec!["graph neural networks", "gnn expressivity"]);

    // analyze, decide, next_query for round 1; round 2 found nothing and
    // hit the cap, so only synthesis remains.
    assert_eq!(mock.call_count(), 4);

    let findings = &cp.state.findings;
    assert_eq!(findings[0].relevance_score, 7);
    assert_eq!(findings[0].top_papers.len(), 5);
    assert_eq!(findings[1].relevance_score, 0);
    assert_eq!(findings[1].summary, NO_PAPERS_SUMMARY);
    assert_eq!(findings[1].query, "gnn expressivity");

    // The synthesis prompt saw both findings and the deduplicated citations.
    let synthesis_prompt = &mock.requests()[3].messages[1].content;
    assert!(synthesis_prompt.contains("gnn expressivity"));
    assert!(synthesis_prompt.contains("[5] A. Author et al."));
}

#[tokio::test]
async fn test_n_rounds_until_stop_decision() {
    let source = Arc::new(ScriptedPaperSource::new());
    let mock = Arc::new(MockLlmProvider::new());
    let n = 4;
    for i in 1..=n {
        source.queue_papers(papers(&format!("24{:02}", i), 3));
        mock.queue_text(&analysis(6));
        if i < n {
            mock.queue_text(r#"{"should_continue": true}"#);
            mock.queue_text(&format!(r#"["follow up {}"]"#, i));
        } else {
            mock.queue_text(r#"{"should_continue": false}"#);
        }
    }
    mock.queue_text(r#"{"report": "four rounds"}"#);
    let store = Arc::new(MemoryCheckpointStore::new());
    let engine = engine(source.clone(), mock, store);

    let mut cp = InstanceCheckpoint::new(WorkflowState::new("topic", 10));
    let result = engine
        .drive(&mut cp, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.iterations, n);
    assert_eq!(result.findings_count, n as usize);
    assert_eq!(cp.generation, n - 1);
    let iteration_queries: Vec<String> = cp.state.findings.iter().map(|f| f.query.clone()).collect();
    assert_eq!(
        iteration_queries,
        vec!["topic", "follow up 1", "follow up 2", "follow up 3"]
    );
}

#[tokio::test]
async fn test_empty_follow_ups_synthesize_without_advancing() {
    let source = Arc::new(ScriptedPaperSource::new());
    source.queue_papers(papers("2301", 2));
    let mock = Arc::new(MockLlmProvider::new());
    mock.queue_text(&analysis(4));
    mock.queue_text(r#"{"should_continue": true}"#);
    mock.queue_text("[]");
    mock.queue_text(r#"{"report": "short"}"#);
    let store = Arc::new(MemoryCheckpointStore::new());
    let engine = engine(source.clone(), mock, store);

    let mut cp = InstanceCheckpoint::new(WorkflowState::new("topic", 5));
    let result = engine
        .drive(&mut cp, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.iterations, 1);
    assert_eq!(result.findings_count, 1);
    assert_eq!(source.call_count(), 1);
}

#[tokio::test]
async fn test_unparseable_analysis_round_completes_with_default() {
    let source = Arc::new(ScriptedPaperSource::new());
    source.queue_papers(papers("2302", 2));
    let mock = Arc::new(MockLlmProvider::new());
    mock.queue_text("I could not produce JSON, sorry.");
    mock.queue_text(r#"{"report": "fallback report"}"#);
    let store = Arc::new(MemoryCheckpointStore::new());
    let engine = engine(source, mock, store);

    let mut cp = InstanceCheckpoint::new(WorkflowState::new("topic", 1));
    let result = engine
        .drive(&mut cp, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.findings_count, 1);
    let finding: &Finding = &cp.state.findings[0];
    assert_eq!(finding.relevance_score, 5);
    assert_eq!(finding.summary, PARSE_FAILURE_SUMMARY);
    assert!(finding.insights.is_empty());
    assert!(finding.key_points.is_empty());
    assert!(finding.research_gaps.is_empty());
}

#[tokio::test]
async fn test_unparseable_synthesis_returns_raw_text() {
    let source = Arc::new(ScriptedPaperSource::new());
    let mock = Arc::new(MockLlmProvider::new());
    mock.queue_text("## Report\nPlain markdown.");
    let store = Arc::new(MemoryCheckpointStore::new());
    let engine = engine(source, mock, store);

    let mut cp = InstanceCheckpoint::new(WorkflowState::new("topic", 0));
    let result = engine
        .drive(&mut cp, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.report, "## Report\nPlain markdown.");
}

#[tokio::test]
async fn test_resume_from_checkpoint_runs_next_round() {
    // A checkpoint taken at a re-entry boundary after iteration 1.
    let mut state = WorkflowState::new("diffusion models", 3);
    state.current_iteration = 1;
    state.findings.push(Finding::no_papers("diffusion models"));
    state.current_query = "score matching".into();

    let run = |state: WorkflowState| async move {
        let source = Arc::new(ScriptedPaperSource::new());
        source.queue_papers(papers("2011", 2));
        let mock = Arc::new(MockLlmProvider::new());
        mock.queue_text(&analysis(9));
        mock.queue_text(r#"{"should_continue": false}"#);
        mock.queue_text(r#"{"report": "resumed report"}"#);
        let store = Arc::new(MemoryCheckpointStore::new());
        let engine = engine(source.clone(), mock, store);
        let mut cp = InstanceCheckpoint::new(state);
        let result = engine
            .drive(&mut cp, &CancellationToken::new())
            .await
            .unwrap();
        (result, source.requests(), cp.state)
    };

    let (first, first_requests, first_state) = run(state.clone()).await;
    let (second, second_requests, second_state) = run(state).await;

    assert_eq!(first, second);
    assert_eq!(first_requests, second_requests);
    assert_eq!(first_requests[0].query, "score matching");
    assert_eq!(first.iterations, 2);
    assert_eq!(first.findings_count, 2);
    assert_eq!(first_state.findings, second_state.findings);
}

#[tokio::test]
async fn test_crash_mid_iteration_replays_journal_from_disk() {
    let dir = tempfile::TempDir::new().unwrap();
    let store: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::new(dir.path()));
    let mut cp = InstanceCheckpoint::new(WorkflowState::new("protein folding", 2));
    store.save(&cp).unwrap();

    // First process: fetch and analysis succeed, the decision call fails for good.
    let source = Arc::new(ScriptedPaperSource::new());
    source.queue_papers(papers("2207", 4));
    let mock = Arc::new(MockLlmProvider::new());
    mock.queue_text(&analysis(8));
    mock.queue_error(paperloop_core::error::LlmError::AuthFailed {
        provider: "openai".into(),
    });
    let first = engine(source.clone(), mock.clone(), store.clone());
    let err = first
        .drive(&mut cp, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::StepFailed { .. }));
    assert_eq!(source.call_count(), 1);

    // Second process: reload from disk. Fetch and analysis are replayed.
    let mut reloaded = store.load(cp.id).unwrap().unwrap();
    assert!(reloaded.journal.contains_key("fetch"));
    assert!(reloaded.journal.contains_key("analyze"));
    let source2 = Arc::new(ScriptedPaperSource::new());
    let mock2 = Arc::new(MockLlmProvider::new());
    mock2.queue_text(r#"{"should_continue": false}"#);
    mock2.queue_text(r#"{"report": "after restart"}"#);
    let second = engine(source2.clone(), mock2.clone(), store.clone());
    let result = second
        .drive(&mut reloaded, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(source2.call_count(), 0);
    assert_eq!(mock2.call_count(), 2);
    assert_eq!(result.iterations, 1);
    assert_eq!(result.findings_count, 1);
    assert_eq!(result.report, "after restart");
}

/// A paper source that holds each search until released.
struct GatedSource {
    entered: Notify,
    release: Notify,
    calls: AtomicUsize,
}

impl GatedSource {
    fn new() -> Self {
        Self {
            entered: Notify::new(),
            release: Notify::new(),
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaperSource for GatedSource {
    async fn search(&self, _request: &SearchRequest) -> Result<Vec<PaperRef>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        self.release.notified().await;
        Ok(papers("2501", 1))
    }
}

#[tokio::test]
async fn test_terminate_in_flight_instance_at_next_boundary() {
    let source = Arc::new(GatedSource::new());
    let mock = Arc::new(MockLlmProvider::new());
    mock.queue_text(&analysis(5));
    let store = Arc::new(MemoryCheckpointStore::new());
    let mut config = PaperloopConfig::default();
    config.workflow.status_poll_ms = 5;
    let runtime = ResearchRuntime::new(
        engine(source.clone(), mock.clone(), store.clone()),
        config.workflow,
    );

    let id = runtime.start("quantum error correction", Some(3)).unwrap();
    source.entered.notified().await;
    assert_eq!(
        runtime.get_status(id).unwrap().status,
        InstanceStatus::Running
    );

    assert_eq!(runtime.terminate(id).unwrap(), Termination::Requested);
    source.release.notify_one();

    let err = runtime.wait(id, Duration::from_secs(5)).await.unwrap_err();
    assert!(matches!(err, WorkflowError::Terminated { .. }));
    let status = runtime.get_status(id).unwrap();
    assert_eq!(status.status, InstanceStatus::Terminated);
    assert!(status.report.is_none());
    // The in-flight fetch and its analysis finished; nothing after them ran.
    assert_eq!(mock.call_count(), 1);
}

#[tokio::test]
async fn test_failed_instance_reports_error_without_report() {
    let source = Arc::new(ScriptedPaperSource::new());
    source.queue_error(FetchError::invalid("query cannot be empty"));
    let mock = Arc::new(MockLlmProvider::new());
    let store = Arc::new(MemoryCheckpointStore::new());
    let mut config = PaperloopConfig::default();
    config.workflow.status_poll_ms = 5;
    let runtime = ResearchRuntime::new(engine(source, mock, store), config.workflow);

    let id = runtime.start("topic", Some(1)).unwrap();
    let err = runtime.wait(id, Duration::from_secs(5)).await.unwrap_err();
    assert!(matches!(err, WorkflowError::Failed { .. }));

    let status = runtime.get_status(id).unwrap();
    assert_eq!(status.status, InstanceStatus::Failed);
    assert!(status.report.is_none());
    assert!(status.error.unwrap().contains("fetch"));
}

/// Two runtimes over one state directory, as two processes would share it.
fn shared_dir_runtimes(
    dir: &std::path::Path,
    driver_source: Arc<dyn PaperSource>,
    driver_mock: Arc<MockLlmProvider>,
) -> (ResearchRuntime, ResearchRuntime, Arc<ScriptedPaperSource>, Arc<MockLlmProvider>) {
    let mut config = PaperloopConfig::default();
    config.workflow.status_poll_ms = 5;
    let driver = ResearchRuntime::new(
        engine(driver_source, driver_mock, Arc::new(FileCheckpointStore::new(dir))),
        config.workflow.clone(),
    );
    let other_source = Arc::new(ScriptedPaperSource::new());
    let other_mock = Arc::new(MockLlmProvider::new());
    let other = ResearchRuntime::new(
        engine(
            other_source.clone(),
            other_mock.clone(),
            Arc::new(FileCheckpointStore::new(dir)),
        ),
        config.workflow,
    );
    (driver, other, other_source, other_mock)
}

#[tokio::test]
async fn test_held_instance_is_driven_exactly_once() {
    let dir = tempfile::TempDir::new().unwrap();
    let source = Arc::new(GatedSource::new());
    let mock = Arc::new(MockLlmProvider::new());
    mock.queue_text(&analysis(6));
    mock.queue_text(r#"{"report": "driven once"}"#);
    let (driver, other, other_source, other_mock) =
        shared_dir_runtimes(dir.path(), source.clone(), mock.clone());

    let id = driver.start("topological data analysis", Some(1)).unwrap();
    source.entered.notified().await;

    // The instance is mid-fetch in the driver; the other runtime must not take it.
    assert!(!other.resume(id).unwrap());
    assert!(other.resume_incomplete().unwrap().is_empty());
    assert!(!other.is_running(id));

    source.release.notify_one();
    let result = other.wait(id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(result.report, "driven once");
    assert_eq!(source.calls(), 1);
    assert_eq!(mock.call_count(), 2);
    assert_eq!(other_source.call_count(), 0);
    assert_eq!(other_mock.call_count(), 0);

    // Once the driver lets go there is still nothing left to resume.
    assert!(!other.resume(id).unwrap());
}

#[tokio::test]
async fn test_terminate_from_another_runtime_reaches_the_driver() {
    let dir = tempfile::TempDir::new().unwrap();
    let source = Arc::new(GatedSource::new());
    let mock = Arc::new(MockLlmProvider::new());
    mock.queue_text(&analysis(4));
    let (driver, other, _, other_mock) =
        shared_dir_runtimes(dir.path(), source.clone(), mock.clone());

    let id = driver.start("sparse autoencoders", Some(3)).unwrap();
    source.entered.notified().await;
    assert_eq!(other.terminate(id).unwrap(), Termination::Requested);
    source.release.notify_one();

    let err = other.wait(id, Duration::from_secs(5)).await.unwrap_err();
    assert!(matches!(err, WorkflowError::Terminated { .. }));
    assert_eq!(driver.get_status(id).unwrap().status, InstanceStatus::Terminated);
    assert_eq!(source.calls(), 1);
    assert_eq!(other_mock.call_count(), 0);
}

#[tokio::test]
async fn test_terminate_undriven_instance_is_recorded_immediately() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = FileCheckpointStore::new(dir.path());
    let cp = InstanceCheckpoint::new(WorkflowState::new("left pending", 2));
    store.save(&cp).unwrap();
    let (_, other, other_source, _) = shared_dir_runtimes(
        dir.path(),
        Arc::new(ScriptedPaperSource::new()),
        Arc::new(MockLlmProvider::new()),
    );

    assert_eq!(other.terminate(cp.id).unwrap(), Termination::Recorded);
    assert_eq!(
        store.load(cp.id).unwrap().unwrap().status,
        InstanceStatus::Terminated
    );
    assert!(!other.resume(cp.id).unwrap());
    assert!(matches!(
        other.terminate(cp.id),
        Err(WorkflowError::AlreadyFinished {
            status: InstanceStatus::Terminated,
            ..
        })
    ));
    assert_eq!(other_source.call_count(), 0);
}
