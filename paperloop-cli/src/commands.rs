//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use anyhow::Context as _;
use paperloop_core::config::{PaperloopConfig, load_config};
use paperloop_core::research::{
    CheckpointStore, FileCheckpointStore, IterativeResearchLoop, LlmResearchModel,
};
use paperloop_core::error::WorkflowError;
use paperloop_core::runtime::{ResearchRuntime, StatusReport, Termination, terminate_instance};
use paperloop_core::types::FinalResult;
use paperloop_tools::ArxivClient;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Settings shared by every subcommand.
pub struct Context {
    pub workspace: PathBuf,
    pub model: Option<String>,
}

impl Context {
    fn config(&self) -> anyhow::Result<PaperloopConfig> {
        let mut config = load_config(Some(&self.workspace), None)
            .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
        if let Some(model) = &self.model {
            config.llm.model = model.clone();
        }
        config.validate()?;
        Ok(config)
    }

    fn store(&self, config: &PaperloopConfig) -> FileCheckpointStore {
        FileCheckpointStore::new(config.workflow.resolve_state_dir(&self.workspace))
    }

    /// Wire the provider, fetcher, store, and engine into a runtime.
    fn runtime(&self) -> anyhow::Result<Arc<ResearchRuntime>> {
        let config = self.config()?;
        let provider = paperloop_core::providers::create_provider(&config.llm)?;
        let model = Arc::new(LlmResearchModel::new(provider, &config.llm));
        let source = Arc::new(ArxivClient::new(&config.arxiv)?);
        let store = Arc::new(self.store(&config));
        tracing::debug!(state_dir = %store.dir().display(), "Using checkpoint store");

        let engine = IterativeResearchLoop::new(source, model, store, &config);
        Ok(Arc::new(ResearchRuntime::new(engine, config.workflow)))
    }
}

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, ctx: &Context) -> anyhow::Result<()> {
    match command {
        Commands::Research {
            topic,
            max_iterations,
            timeout,
            nowait,
        } => handle_research(ctx, &topic, max_iterations, timeout, nowait).await,
        Commands::Status { id } => handle_status(ctx, id),
        Commands::Wait { id, timeout } => handle_wait(ctx, id, timeout).await,
        Commands::Terminate { id } => handle_terminate(ctx, id),
        Commands::List => handle_list(ctx),
        Commands::Resume { timeout } => handle_resume(ctx, timeout).await,
        Commands::Serve { port, host } => handle_serve(ctx, port, host).await,
        Commands::Config { action } => handle_config(action, ctx),
    }
}

async fn handle_research(
    ctx: &Context,
    topic: &str,
    max_iterations: Option<u32>,
    timeout: u64,
    nowait: bool,
) -> anyhow::Result<()> {
    let runtime = ctx.runtime()?;
    let id = runtime.start(topic, max_iterations)?;
    println!("Started research instance {}", id);

    if nowait {
        // The checkpoint is durable; whichever process resumes it next drives it.
        println!("Continue it later with: paperloop wait {}", id);
        return Ok(());
    }

    let result = wait_interruptibly(&runtime, id, timeout).await?;
    print_result(&result);
    Ok(())
}

async fn handle_wait(ctx: &Context, id: Uuid, timeout: u64) -> anyhow::Result<()> {
    let runtime = ctx.runtime()?;
    if runtime.resume(id)? {
        println!("Resumed instance {}", id);
    } else if !runtime.get_status(id)?.status.is_terminal() {
        println!("Instance {} is being driven by another process; waiting", id);
    }
    let result = wait_interruptibly(&runtime, id, timeout).await?;
    print_result(&result);
    Ok(())
}

async fn handle_resume(ctx: &Context, timeout: u64) -> anyhow::Result<()> {
    let runtime = ctx.runtime()?;
    let resumed = runtime.resume_incomplete()?;
    if resumed.is_empty() {
        println!("No unfinished instances.");
        return Ok(());
    }
    println!("Resumed {} instance(s).", resumed.len());

    for id in resumed {
        match runtime.wait(id, Duration::from_secs(timeout)).await {
            Ok(result) => println!(
                "  {}  completed: {} iteration(s), {} finding(s)",
                id, result.iterations, result.findings_count
            ),
            Err(e) => println!("  {}  {}", id, e),
        }
    }
    Ok(())
}

/// Wait for a result; Ctrl-C requests termination instead of abandoning the run.
async fn wait_interruptibly(
    runtime: &ResearchRuntime,
    id: Uuid,
    timeout: u64,
) -> anyhow::Result<FinalResult> {
    let wait = runtime.wait(id, Duration::from_secs(timeout));
    tokio::pin!(wait);
    tokio::select! {
        result = &mut wait => Ok(result?),
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Interrupted; requesting termination of {}", id);
            match runtime.terminate(id) {
                Ok(_) | Err(WorkflowError::AlreadyFinished { .. }) => {}
                Err(e) => return Err(e.into()),
            }
            // Give the instance a moment to record that it stopped.
            let _ = runtime.wait(id, Duration::from_secs(5)).await;
            anyhow::bail!("instance {} terminated by user", id)
        }
    }
}

fn handle_status(ctx: &Context, id: Uuid) -> anyhow::Result<()> {
    let config = ctx.config()?;
    let store = ctx.store(&config);
    let cp = store
        .load(id)?
        .with_context(|| format!("Instance not found: {}", id))?;
    let report = StatusReport::from(&cp);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn handle_terminate(ctx: &Context, id: Uuid) -> anyhow::Result<()> {
    let config = ctx.config()?;
    let store = ctx.store(&config);
    match terminate_instance(&store, id) {
        Ok(Termination::Requested) => println!("Termination requested for {}.", id),
        Ok(Termination::Recorded) => println!("Instance {} terminated.", id),
        Err(WorkflowError::AlreadyFinished { status, .. }) => {
            println!("Instance {} already finished ({}).", id, status)
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn handle_list(ctx: &Context) -> anyhow::Result<()> {
    let config = ctx.config()?;
    let store = ctx.store(&config);
    let instances = store.list()?;
    if instances.is_empty() {
        println!("No research instances.");
        return Ok(());
    }
    println!("{:<36}  {:<10}  {:<20}  TOPIC", "ID", "STATUS", "CREATED");
    for cp in &instances {
        println!(
            "{:<36}  {:<10}  {:<20}  {}",
            cp.id,
            cp.status.to_string(),
            cp.created_at.format("%Y-%m-%d %H:%M:%S"),
            cp.state.topic
        );
    }
    Ok(())
}

async fn handle_serve(ctx: &Context, port: Option<u16>, host: Option<String>) -> anyhow::Result<()> {
    let mut gateway = ctx.config()?.gateway;
    if let Some(port) = port {
        gateway.port = port;
    }
    if let Some(host) = host {
        gateway.host = host;
    }

    let runtime = ctx.runtime()?;
    let resumed = runtime.resume_incomplete()?;
    if !resumed.is_empty() {
        tracing::info!(count = resumed.len(), "Resumed unfinished instances");
    }

    println!(
        "Paperloop gateway listening on http://{}:{}",
        gateway.host, gateway.port
    );
    paperloop_core::gateway::serve(runtime, &gateway).await?;
    Ok(())
}

fn handle_config(action: ConfigAction, ctx: &Context) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = ctx.workspace.join(".paperloop");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&PaperloopConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = ctx.config()?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn print_result(result: &FinalResult) {
    println!();
    println!(
        "# {} ({} iteration(s), {} finding(s))",
        result.topic, result.iterations, result.findings_count
    );
    println!();
    println!("{}", result.report);
}
