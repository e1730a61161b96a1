use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ethos_agent::trainer::run_daily_batch;
use ethos_agent::{
    ActRequest, ApprovalBroker, DecisionEngine, MemoryEventStore, TrainOutcome, TrainerKind, TrainingScheduler,
};
use ethos_core::{ActionDefinition, ActionPayload, AdapterRegistry, AlignmentConfig, EngineConfig, TrainingConfig};

fn config(dir: &Path) -> EngineConfig {
    EngineConfig {
        state_size: 3,
        action_size: 2,
        hidden_sizes: vec![6, 6],
        batch_size: 4,
        target_update_every: 3,
        seed: Some(1),
        model_dir: dir.join("models"),
        event_log: None,
        alignment: AlignmentConfig {
            dir: dir.join("alignment"),
            ..AlignmentConfig::default()
        },
        training: TrainingConfig {
            rate_limit_per_sec: 0.0,
            train_after_act: false,
            periodic_interval_ms: 10,
            micro_interval_ms: 10,
            micro_batch_size: 2,
            ..TrainingConfig::default()
        },
        ..EngineConfig::default()
    }
}

fn candidates() -> Vec<ActionDefinition> {
    ["left", "right"]
        .into_iter()
        .map(|name| {
            ActionDefinition::builder(ActionPayload::Interact {
                prompt: name.into(),
                data: serde_json::Value::Null,
            })
            .name(name)
            .build()
            .unwrap()
        })
        .collect()
}

async fn engine_with(cfg: EngineConfig, store: Arc<MemoryEventStore>) -> DecisionEngine {
    DecisionEngine::new(cfg, Arc::new(AdapterRegistry::new()), Arc::new(ApprovalBroker::new()), store)
        .await
        .unwrap()
}

async fn fill(engine: &DecisionEngine, cycles: usize) {
    for i in 0..cycles {
        let x = i as f32 / cycles as f32;
        engine
            .act(ActRequest::new(vec![x, 1.0 - x, 0.5], candidates()).decide_only())
            .await;
        engine.update_last_experience(&[1.0 - x, x, 0.5], i % 4 == 3).await;
    }
}

#[tokio::test]
async fn target_matches_policy_exactly_after_sync_interval() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(config(dir.path()), Arc::new(MemoryEventStore::new())).await;
    fill(&engine, 8).await;
    assert_eq!(engine.policy_parameters().await, engine.target_parameters().await);

    for step in 1..=2u64 {
        let outcome = engine.train_step().await.unwrap();
        assert!(matches!(outcome, TrainOutcome::Trained { step: s, synced: false, .. } if s == step));
        assert_ne!(engine.policy_parameters().await, engine.target_parameters().await);
    }

    let outcome = engine.train_step().await.unwrap();
    assert!(matches!(outcome, TrainOutcome::Trained { step: 3, synced: true, .. }));
    let policy: Vec<u32> = engine.policy_parameters().await.iter().map(|p| p.to_bits()).collect();
    let target: Vec<u32> = engine.target_parameters().await.iter().map(|p| p.to_bits()).collect();
    assert_eq!(policy, target);

    engine.train_step().await.unwrap();
    assert_ne!(engine.policy_parameters().await, engine.target_parameters().await);
}

#[tokio::test]
async fn concurrent_training_never_overlaps() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(config(dir.path()), Arc::new(MemoryEventStore::new())).await;
    fill(&engine, 8).await;

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move { engine.train_step().await.unwrap() }));
    }
    for task in tasks {
        assert!(matches!(task.await.unwrap(), TrainOutcome::Trained { .. }));
    }
    assert_eq!(engine.guard().peak(), 1);
    assert_eq!(engine.guard().active(), 0);
    assert_eq!(engine.steps().await, 16);
}

#[tokio::test]
async fn periodic_and_micro_trainers_start_and_stop_independently() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryEventStore::new());
    let engine = engine_with(config(dir.path()), store.clone()).await;
    fill(&engine, 8).await;

    let scheduler = TrainingScheduler::new(engine.clone());
    assert!(scheduler.start(TrainerKind::Periodic).await);
    assert!(!scheduler.start(TrainerKind::Periodic).await);
    assert!(scheduler.start(TrainerKind::Micro).await);
    assert_eq!(scheduler.running().await, vec![TrainerKind::Periodic, TrainerKind::Micro]);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while engine.steps().await < 4 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(engine.steps().await >= 4);

    assert!(scheduler.stop(TrainerKind::Periodic).await);
    assert!(!scheduler.is_running(TrainerKind::Periodic).await);
    assert!(scheduler.is_running(TrainerKind::Micro).await);

    scheduler.shutdown().await;
    assert!(scheduler.running().await.is_empty());
    let settled = engine.steps().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.steps().await, settled);

    assert_eq!(store.events_of("training_started").len(), 2);
    assert_eq!(store.events_of("training_stopped").len(), 2);
    assert!(engine.guard().peak() <= 1);
}

#[tokio::test]
async fn daily_batch_reingests_and_respects_batch_cap() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryEventStore::new());
    let first = engine_with(config(dir.path()), store.clone()).await;
    fill(&first, 6).await;
    drop(first);

    let mut cfg = config(dir.path());
    cfg.daily.max_batches_per_run = 5;
    cfg.daily.passes = 2;
    let engine = engine_with(cfg, store).await;
    assert_eq!(engine.memory_len().await, 0);

    let trained = run_daily_batch(&engine).await;
    assert_eq!(engine.memory_len().await, 6);
    assert_eq!(trained, 5);
    assert_eq!(engine.steps().await, 5);

    assert_eq!(run_daily_batch(&engine).await, 5);
    assert_eq!(engine.memory_len().await, 6);
}

#[tokio::test]
async fn decision_cycle_triggers_background_training() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.batch_size = 1;
    cfg.training.train_after_act = true;
    let engine = engine_with(cfg, Arc::new(MemoryEventStore::new())).await;

    engine
        .act(ActRequest::new(vec![0.1, 0.2, 0.3], candidates()).decide_only())
        .await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while engine.steps().await == 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(engine.steps().await >= 1);
}

#[tokio::test]
async fn background_step_waits_for_an_exhausted_bucket() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.batch_size = 1;
    cfg.training.rate_limit_per_sec = 5.0;
    cfg.training.burst = 1;
    cfg.training.train_after_act = true;
    let engine = engine_with(cfg, Arc::new(MemoryEventStore::new())).await;

    let settle = |target: u64| {
        let engine = engine.clone();
        async move {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
            while (engine.steps().await < target || !engine.guard().is_idle())
                && tokio::time::Instant::now() < deadline
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    };

    // the first background step spends the only token
    engine
        .act(ActRequest::new(vec![0.1, 0.2, 0.3], candidates()).decide_only())
        .await;
    settle(1).await;
    assert_eq!(engine.steps().await, 1);

    engine
        .act(ActRequest::new(vec![0.4, 0.2, 0.1], candidates()).decide_only())
        .await;
    settle(2).await;
    assert_eq!(engine.steps().await, 2);
}

#[tokio::test]
async fn decision_cycles_and_periodic_trainer_share_one_slot() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.batch_size = 2;
    cfg.training.train_after_act = true;
    let engine = engine_with(cfg, Arc::new(MemoryEventStore::new())).await;
    fill(&engine, 4).await;

    let scheduler = TrainingScheduler::new(engine.clone());
    assert!(scheduler.start(TrainerKind::Periodic).await);

    let mut tasks = Vec::new();
    for i in 0..8 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            for j in 0..10 {
                let x = (i * 10 + j) as f32 / 80.0;
                engine
                    .act(ActRequest::new(vec![x, 1.0 - x, 0.5], candidates()).decide_only())
                    .await;
                tokio::task::yield_now().await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while engine.steps().await < 2 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    scheduler.shutdown().await;

    assert!(engine.steps().await >= 2);
    assert_eq!(engine.guard().peak(), 1);
}
