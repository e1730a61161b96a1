// Command implementations for ethosctl

use anyhow::{bail, Context, Result};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

use ethos_agent::{
    ActRequest, AlignmentTraining, ApprovalBroker, ApprovalDecision, DecisionEngine, EventStore, JsonlEventStore,
    NullEventStore, TrainingScheduler,
};
use ethos_core::{ActionDefinition, AdapterRegistry, EngineConfig, Virtue};

/// Engine plus the broker that answers its approval prompts
pub struct OpenedEngine {
    pub engine: DecisionEngine,
    pub broker: Arc<ApprovalBroker>,
}

/// Flags of the `act` command
pub struct ActOptions {
    pub next_state: Option<Vec<f32>>,
    pub done: bool,
    pub feedback: Option<f64>,
    pub auto_approve: bool,
    pub decide_only: bool,
}

pub async fn open_engine(config: EngineConfig) -> Result<OpenedEngine> {
    let store: Arc<dyn EventStore> = match &config.event_log {
        Some(path) => Arc::new(
            JsonlEventStore::open(path)
                .await
                .with_context(|| format!("Failed to open event log {}", path.display()))?,
        ),
        None => Arc::new(NullEventStore),
    };

    let registry = Arc::new(AdapterRegistry::new());
    ethos_adapters::register_builtin_adapters(&registry, &config.adapters);

    let broker = Arc::new(ApprovalBroker::new());
    let engine = DecisionEngine::new(config, registry, broker.clone(), store)
        .await
        .context("Failed to start decision engine")?;
    Ok(OpenedEngine { engine, broker })
}

pub fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let source = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&source).with_context(|| format!("Invalid JSON in {}", path.display()))
}

fn parse_virtue(name: &str) -> Result<Virtue> {
    serde_json::from_value(json!(name.trim().to_lowercase())).with_context(|| format!("Unknown virtue `{name}`"))
}

async fn save(engine: &DecisionEngine) -> Result<()> {
    let dir = engine.save().await.context("Failed to save engine state")?;
    tracing::debug!(dir = %dir.display(), "engine state saved");
    Ok(())
}

pub async fn status(engine: &DecisionEngine) -> Result<()> {
    print_json(&engine.status().await)
}

pub async fn set_weight(engine: &DecisionEngine, virtue: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        bail!("Weight must be a non-negative number, got {value}");
    }
    let virtue = parse_virtue(virtue)?;
    let mut raw = engine.weights();
    raw.set(virtue, value);
    let weights = engine.set_weights(raw).await;
    save(engine).await?;
    print_json(&weights)
}

/// Replay experiences logged since the saved cursor into memory
async fn ingest(engine: &DecisionEngine) -> Result<usize> {
    engine
        .ingest_logged_experiences()
        .await
        .context("Failed to re-ingest the event log")
}

pub async fn train(engine: &DecisionEngine, steps: usize) -> Result<()> {
    ingest(engine).await?;
    let trained = engine.train_batches(steps).await.context("Training failed")?;
    save(engine).await?;
    print_json(&json!({
        "requested": steps,
        "trained": trained,
        "steps": engine.steps().await,
        "memory": engine.memory_len().await,
    }))
}

pub async fn train_alignment(engine: &DecisionEngine, epochs: Option<usize>, batch_size: Option<usize>) -> Result<()> {
    let (default_epochs, default_batch) = engine.alignment().defaults();
    let outcome = engine
        .alignment()
        .train(epochs.unwrap_or(default_epochs), batch_size.unwrap_or(default_batch))
        .await
        .context("Alignment training failed")?;
    match outcome {
        AlignmentTraining::Trained { samples, loss } => print_json(&json!({
            "trained": true,
            "samples": samples,
            "loss": loss,
        })),
        AlignmentTraining::Skipped { samples, required } => print_json(&json!({
            "trained": false,
            "samples": samples,
            "required": required,
        })),
    }
}

pub async fn label(engine: &DecisionEngine, path: &Path, aligned: bool, note: Option<String>) -> Result<()> {
    let action: ActionDefinition = read_json(path).await?;
    action.validate().context("Invalid action definition")?;
    let meta = note.map(|note| json!({ "note": note }));
    engine
        .record_alignment_label(&action, aligned, meta)
        .await
        .context("Failed to store alignment label")?;
    print_json(&engine.alignment().status().await)
}

pub async fn act(opened: &OpenedEngine, state: Vec<f32>, candidates: &Path, options: ActOptions) -> Result<()> {
    let candidates: Vec<ActionDefinition> = read_json(candidates).await?;
    for (i, candidate) in candidates.iter().enumerate() {
        candidate
            .validate()
            .with_context(|| format!("Invalid candidate #{i}"))?;
    }

    let approver = options.auto_approve.then(|| {
        let mut prompts = opened.broker.subscribe();
        let broker = opened.broker.clone();
        tokio::spawn(async move {
            while let Ok(prompt) = prompts.recv().await {
                tracing::info!(title = %prompt.request.title, "auto-approving prompt");
                broker.resolve(prompt.id, ApprovalDecision::Approve);
            }
        })
    });

    let mut request = ActRequest::new(state, candidates);
    if options.decide_only {
        request = request.decide_only();
    }
    if let Some(feedback) = options.feedback {
        request = request.with_feedback(feedback);
    }
    let result = opened.engine.act(request).await;
    if let Some(approver) = approver {
        approver.abort();
    }

    if let Some(next_state) = options.next_state {
        if !opened.engine.update_last_experience(&next_state, options.done).await {
            tracing::warn!("no stored transition to complete");
        }
    }
    save(&opened.engine).await?;
    print_json(&result)
}

pub async fn run(engine: &DecisionEngine) -> Result<()> {
    ingest(engine).await?;
    let scheduler = TrainingScheduler::new(engine.clone());
    let started = scheduler.start_configured().await;
    tracing::info!(trainers = ?started, "trainers running; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    tracing::info!("shutting down");
    scheduler.shutdown().await;
    save(engine).await?;
    print_json(&engine.status().await)
}
