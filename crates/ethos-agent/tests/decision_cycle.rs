use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ethos_agent::journal::EXPERIENCE_EVENT;
use ethos_agent::{ActRequest, ApprovalBroker, ApprovalDecision, DecisionEngine, EngineEvent, MemoryEventStore};
use ethos_core::{
    ActionAdapter, ActionDefinition, ActionPayload, AdapterRegistry, AlignmentConfig, EngineConfig, ExecutionResult,
    TrainingConfig, Virtue,
};

type Trace = Arc<Mutex<Vec<String>>>;

struct RecordingAdapter {
    name: &'static str,
    trace: Trace,
}

#[async_trait]
impl ActionAdapter for RecordingAdapter {
    fn name(&self) -> &str {
        self.name
    }

    fn can_handle(&self, action: &ActionDefinition) -> bool {
        matches!(action.payload, ActionPayload::System { .. })
    }

    async fn execute(&self, action: &ActionDefinition) -> ExecutionResult {
        self.trace.lock().unwrap().push(format!("execute:{}", self.name));
        ExecutionResult::success(serde_json::json!({ "ran": action.label() }))
    }
}

fn config(dir: &Path) -> EngineConfig {
    EngineConfig {
        state_size: 4,
        action_size: 4,
        hidden_sizes: vec![8, 8],
        batch_size: 2,
        seed: Some(42),
        model_dir: dir.join("models"),
        event_log: None,
        alignment: AlignmentConfig {
            dir: dir.join("alignment"),
            ..AlignmentConfig::default()
        },
        training: TrainingConfig {
            rate_limit_per_sec: 0.0,
            train_after_act: false,
            ..TrainingConfig::default()
        },
        ..EngineConfig::default()
    }
}

fn system(name: &str, risk: f64, tags: &[&str]) -> ActionDefinition {
    ActionDefinition::builder(ActionPayload::System {
        command: name.into(),
        params: serde_json::Value::Null,
    })
    .name(name)
    .risk(risk)
    .tags(tags.iter().copied())
    .build()
    .unwrap()
}

struct Harness {
    engine: DecisionEngine,
    broker: Arc<ApprovalBroker>,
    store: Arc<MemoryEventStore>,
    trace: Trace,
    _dir: tempfile::TempDir,
}

async fn harness_with(tweak: impl FnOnce(&mut EngineConfig)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    tweak(&mut cfg);

    let trace: Trace = Arc::default();
    let registry = Arc::new(AdapterRegistry::new());
    registry.register(Arc::new(RecordingAdapter {
        name: "system",
        trace: trace.clone(),
    }));
    let broker = Arc::new(ApprovalBroker::new());
    let store = Arc::new(MemoryEventStore::new());
    let engine = DecisionEngine::new(cfg, registry, broker.clone(), store.clone())
        .await
        .unwrap();
    Harness {
        engine,
        broker,
        store,
        trace,
        _dir: dir,
    }
}

async fn harness() -> Harness {
    harness_with(|_| {}).await
}

/// Resolve the next prompt with `decision`, recording it in the trace first
fn answer_next_prompt(h: &Harness, decision: ApprovalDecision) -> tokio::task::JoinHandle<()> {
    let mut prompts = h.broker.subscribe();
    let broker = h.broker.clone();
    let trace = h.trace.clone();
    tokio::spawn(async move {
        let prompt = prompts.recv().await.unwrap();
        trace.lock().unwrap().push(format!("prompt:{}", prompt.request.title));
        assert!(broker.resolve(prompt.id, decision));
    })
}

#[tokio::test]
async fn approved_high_impact_action_prompts_before_executing() {
    let h = harness().await;
    let responder = answer_next_prompt(&h, ApprovalDecision::Approve);

    let result = h
        .engine
        .act(ActRequest::new(vec![0.1; 4], vec![system("checkout", 0.0, &["purchase"])]))
        .await;
    responder.await.unwrap();

    assert!(result.ok, "{result:?}");
    assert_eq!(
        *h.trace.lock().unwrap(),
        vec!["prompt:Approve checkout?".to_string(), "execute:system".to_string()]
    );
    assert!(result.result.unwrap().ok);
}

#[tokio::test]
async fn rejected_high_impact_action_never_executes() {
    let h = harness().await;
    let responder = answer_next_prompt(&h, ApprovalDecision::Reject);

    let result = h
        .engine
        .act(ActRequest::new(vec![0.1; 4], vec![system("checkout", 0.9, &["purchase"])]))
        .await;
    responder.await.unwrap();

    assert!(!result.ok);
    assert_eq!(result.error.as_deref(), Some("blocked_by_user_reject"));
    assert_eq!(result.reward, Some(-0.1));
    assert!(result.result.is_none());
    assert_eq!(*h.trace.lock().unwrap(), vec!["prompt:Approve checkout?".to_string()]);
    assert_eq!(h.engine.memory_len().await, 1);
}

#[tokio::test]
async fn risky_action_with_default_weights_is_prompted_then_executed() {
    let h = harness().await;
    let responder = answer_next_prompt(&h, ApprovalDecision::Approve);

    let result = h
        .engine
        .act(ActRequest::new(vec![0.1; 4], vec![system("checkout", 0.9, &["purchase"])]))
        .await;
    responder.await.unwrap();

    assert!(result.ok, "{result:?}");
    assert_eq!(
        *h.trace.lock().unwrap(),
        vec!["prompt:Approve checkout?".to_string(), "execute:system".to_string()]
    );
}

#[tokio::test]
async fn snake_case_tag_requires_approval() {
    let h = harness().await;
    let responder = answer_next_prompt(&h, ApprovalDecision::Reject);

    let result = h
        .engine
        .act(ActRequest::new(vec![0.0; 4], vec![system("cleanup", 0.0, &["file_delete"])]))
        .await;
    responder.await.unwrap();

    assert_eq!(result.error.as_deref(), Some("blocked_by_user_reject"));
    assert_eq!(*h.trace.lock().unwrap(), vec!["prompt:Approve cleanup?".to_string()]);
}

#[tokio::test]
async fn unanswered_prompt_times_out() {
    let h = harness_with(|c| c.approval.timeout_ms = 30).await;
    let result = h
        .engine
        .act(ActRequest::new(vec![0.0; 4], vec![system("wire", 0.0, &["transfer"])]))
        .await;
    assert_eq!(result.error.as_deref(), Some("blocked_by_user_timeout"));
    assert!(h.trace.lock().unwrap().is_empty());
    assert!(h.broker.pending().is_empty());
}

#[tokio::test]
async fn risky_action_with_low_morality_is_blocked_before_approval() {
    let h = harness().await;
    let mut raw = h.engine.weights();
    raw.set(Virtue::Morality, 0.0);
    h.engine.set_weights(raw).await;
    let epsilon = h.engine.epsilon().await;
    let result = h
        .engine
        .act(ActRequest::new(vec![0.2; 4], vec![system("format-disk", 0.9, &[])]))
        .await;

    assert!(!result.ok);
    assert_eq!(result.error.as_deref(), Some("blocked_by_value_policy"));
    assert_eq!(result.reward, Some(-0.2));
    assert!(h.trace.lock().unwrap().is_empty());
    assert!(h.broker.pending().is_empty());
    assert_eq!(h.engine.memory_len().await, 1);
    assert_eq!(h.engine.epsilon().await, epsilon);
}

#[tokio::test]
async fn unclaimed_action_reports_no_adapter() {
    let h = harness().await;
    let action = ActionDefinition::builder(ActionPayload::Ui {
        target: "#submit".into(),
        input: serde_json::Value::Null,
    })
    .build()
    .unwrap();
    let result = h.engine.act(ActRequest::new(vec![0.0; 4], vec![action])).await;

    assert!(!result.ok);
    assert_eq!(result.error.as_deref(), Some("no_adapter"));
    assert!(result.reward.unwrap() < 0.0);
    assert_eq!(h.engine.memory_len().await, 1);
}

#[tokio::test]
async fn kill_switch_stops_the_cycle_before_scoring() {
    let h = harness().await;
    h.broker.set_paused(true);
    let result = h
        .engine
        .act(ActRequest::new(vec![0.0; 4], vec![system("noop", 0.0, &[])]))
        .await;

    assert!(!result.ok);
    assert_eq!(result.error.as_deref(), Some("paused_by_kill_switch"));
    assert!(result.q_values.is_empty());
    assert!(result.index.is_none());
    assert_eq!(h.engine.memory_len().await, 0);
    assert!(h.store.events_of(EXPERIENCE_EVENT).is_empty());
}

#[tokio::test]
async fn empty_candidates_are_reported() {
    let h = harness().await;
    let result = h.engine.act(ActRequest::new(vec![0.0; 4], Vec::new())).await;
    assert_eq!(result.error.as_deref(), Some("no_candidates"));
}

#[tokio::test]
async fn epsilon_decays_monotonically_to_its_floor() {
    let h = harness_with(|c| {
        c.epsilon_decay = 0.5;
        c.epsilon_min = 0.1;
    })
    .await;
    let mut previous = h.engine.epsilon().await;
    assert_eq!(previous, 1.0);
    for _ in 0..6 {
        h.engine
            .act(ActRequest::new(vec![0.3; 4], vec![system("a", 0.0, &[]), system("b", 0.0, &[])]).decide_only())
            .await;
        let current = h.engine.epsilon().await;
        assert!(current <= previous);
        previous = current;
    }
    assert_eq!(previous, 0.1);
}

#[tokio::test]
async fn untrained_alignment_scores_neutral_action_at_half() {
    let h = harness().await;
    let score = h.engine.alignment().score_action(&system("noop", 0.0, &[])).await;
    assert!((score - 0.5).abs() < 1e-12);
}

#[tokio::test]
async fn later_registration_overrides_dispatch() {
    let h = harness().await;
    h.engine.registry().register(Arc::new(RecordingAdapter {
        name: "override",
        trace: h.trace.clone(),
    }));
    let result = h
        .engine
        .act(ActRequest::new(vec![0.0; 4], vec![system("noop", 0.0, &[])]))
        .await;
    assert!(result.ok);
    assert_eq!(*h.trace.lock().unwrap(), vec!["execute:override".to_string()]);
}

#[tokio::test]
async fn feedback_raises_the_reward() {
    let h = harness().await;
    let plain = h
        .engine
        .act(ActRequest::new(vec![0.0; 4], vec![system("noop", 0.0, &["helpful"])]))
        .await;
    let praised = h
        .engine
        .act(ActRequest::new(vec![0.0; 4], vec![system("noop", 0.0, &["helpful"])]).with_feedback(1.0))
        .await;
    let difference = praised.reward.unwrap() - plain.reward.unwrap();
    assert!((difference - 0.5).abs() < 1e-5, "difference {difference}");
}

#[tokio::test]
async fn cycle_events_are_broadcast() {
    let h = harness().await;
    let mut events = h.engine.subscribe();
    h.engine
        .act(ActRequest::new(vec![0.0; 4], vec![system("noop", 0.0, &[])]))
        .await;

    let first = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(first, EngineEvent::Decided { index: 0, .. }));
    let second = events.recv().await.unwrap();
    assert!(matches!(second, EngineEvent::Executed { ok: true, .. }));
}
