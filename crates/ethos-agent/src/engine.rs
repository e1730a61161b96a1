//! Decision engine
//!
//! One decision cycle scores the candidates with the policy network, picks
//! one epsilon-greedily, passes it through the value gate and, for
//! high-impact actions, human approval, executes it through the adapter
//! registry and stores the rewarded transition for replay. Training steps
//! fit the policy against Bellman targets from the target network.
//!
//! [`DecisionEngine`] is a cheap-to-clone handle; all clones share state.

use chrono::{DateTime, Utc};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use ethos_core::{
    fit_to_size, ActionDefinition, AdapterRegistry, Architecture, EngineConfig, EthosError, ExecutionResult,
    Experience, Result, RewardSignal, ValuePolicy, ValueWeights,
};

use crate::alignment::{self, AlignmentModel, AlignmentStatus};
use crate::approval::{is_high_impact, ApprovalDecision, PermissionGate, PromptRequest};
use crate::buffer::ExperienceMemory;
use crate::journal::{EventLog, EventStore};
use crate::limiter::{ConcurrencyGuard, MemoryBudget, RateLimiter};
use crate::network::{load_or_init, QNetwork, Topology};

/// Reward stored for an action the value gate blocked
pub const BLOCKED_BY_VALUES_REWARD: f32 = -0.2;
/// Reward stored for an action the operator declined
pub const BLOCKED_BY_USER_REWARD: f32 = -0.1;

/// Reported when the kill switch is on
pub const PAUSED_BY_KILL_SWITCH: &str = "paused_by_kill_switch";
/// Reported when the value gate blocks the chosen action
pub const BLOCKED_BY_VALUE_POLICY: &str = "blocked_by_value_policy";
/// Reported when a request has no candidates
pub const NO_CANDIDATES: &str = "no_candidates";

const STATE_FILE: &str = "state.json";
const POLICY_DIR: &str = "policy";
const TARGET_DIR: &str = "target";

/// Input of one decision cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActRequest {
    /// Observation; padded or truncated to the configured state size
    pub state: Vec<f32>,
    /// Candidate actions; only the first `action_size` are scored
    pub candidates: Vec<ActionDefinition>,
    /// External feedback in `[-1, 1]` folded into the reward
    #[serde(default)]
    pub feedback: Option<f64>,
    /// Dispatch the chosen action to an adapter
    #[serde(default = "default_execute")]
    pub execute: bool,
}

fn default_execute() -> bool {
    true
}

impl ActRequest {
    /// Request that executes the chosen action
    #[must_use]
    pub fn new(state: Vec<f32>, candidates: Vec<ActionDefinition>) -> Self {
        Self {
            state,
            candidates,
            feedback: None,
            execute: true,
        }
    }

    /// Choose and reward, but do not dispatch
    #[must_use]
    pub fn decide_only(mut self) -> Self {
        self.execute = false;
        self
    }

    /// Attach external feedback
    #[must_use]
    pub fn with_feedback(mut self, feedback: f64) -> Self {
        self.feedback = Some(feedback);
        self
    }
}

/// Outcome of one decision cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActResult {
    /// The cycle completed and the action (if executed) succeeded
    pub ok: bool,
    /// Identifier shared by the log records of this cycle
    pub decision_id: Uuid,
    /// Chosen candidate index
    pub index: Option<usize>,
    /// Chosen candidate
    pub action: Option<ActionDefinition>,
    /// Raw policy values for the considered candidates
    pub q_values: Vec<f32>,
    /// Values after value and alignment shaping
    pub shaped_q: Vec<f32>,
    /// Alignment score of the chosen candidate
    pub alignment_score: Option<f64>,
    /// Chosen at random
    pub explored: bool,
    /// Reward stored for the transition
    pub reward: Option<f32>,
    /// Adapter result
    pub result: Option<ExecutionResult>,
    /// Block reason or execution error
    pub error: Option<String>,
}

impl ActResult {
    fn failed(decision_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            decision_id,
            index: None,
            action: None,
            q_values: Vec::new(),
            shaped_q: Vec::new(),
            alignment_score: None,
            explored: false,
            reward: None,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Scoring and selection without side effects on memory
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    /// Chosen candidate index
    pub index: usize,
    /// Raw policy values
    pub q_values: Vec<f32>,
    /// Shaped values
    pub shaped_q: Vec<f32>,
    /// Alignment score per considered candidate
    pub alignment_scores: Vec<f64>,
    /// Chosen at random
    pub explored: bool,
    /// Exploration rate used
    pub epsilon: f64,
}

/// Why a training attempt did nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// Another pass holds the admission slot
    Busy,
    /// The reservation would exceed the memory budget
    MemoryBudget {
        /// Bytes requested
        requested: usize,
        /// Budget limit
        limit: usize,
    },
    /// Fewer buffered experiences than the batch size
    InsufficientExperience {
        /// Experiences in memory
        available: usize,
        /// Batch size
        required: usize,
    },
}

/// Result of one training attempt
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TrainOutcome {
    /// The policy was fitted on one batch
    Trained {
        /// Training steps so far
        step: u64,
        /// Pre-update batch loss
        loss: f32,
        /// The target was synced after this step
        synced: bool,
    },
    /// Nothing was trained
    Skipped(SkipReason),
}

/// Broadcast notifications
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A candidate was selected
    Decided {
        /// Cycle identifier
        decision_id: Uuid,
        /// Chosen index
        index: usize,
        /// Chosen action label
        action: String,
        /// Chosen at random
        explored: bool,
    },
    /// The cycle was stopped before execution
    Blocked {
        /// Cycle identifier
        decision_id: Uuid,
        /// Block reason
        reason: String,
    },
    /// Approval was requested for the chosen action
    ApprovalRequested {
        /// Cycle identifier
        decision_id: Uuid,
        /// Prompt to resolve
        prompt_id: Uuid,
    },
    /// An adapter ran the chosen action
    Executed {
        /// Cycle identifier
        decision_id: Uuid,
        /// Adapter outcome
        ok: bool,
    },
    /// One training step finished
    Trained {
        /// Training steps so far
        step: u64,
        /// Batch loss
        loss: f32,
    },
    /// Policy weights were copied into the target
    TargetSynced {
        /// Step of the sync
        step: u64,
    },
    /// Value weights changed
    WeightsChanged(ValueWeights),
}

/// Engine summary
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    /// Network architecture
    pub architecture: Architecture,
    /// Exploration rate
    pub epsilon: f64,
    /// Training steps so far
    pub steps: u64,
    /// Experiences in memory
    pub memory_len: usize,
    /// Memory capacity
    pub memory_capacity: usize,
    /// Current value weights
    pub weights: ValueWeights,
    /// Passes holding an admission slot
    pub training_active: usize,
    /// Highest concurrent passes seen
    pub training_peak: usize,
    /// Registered adapters in dispatch order
    pub adapters: Vec<String>,
    /// Kill switch state
    pub paused: bool,
    /// Log cursor of the last re-ingestion
    pub daily_cursor: u64,
    /// Alignment model summary
    pub alignment: AlignmentStatus,
}

/// Contents of `state.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EngineState {
    epsilon: f64,
    steps: u64,
    weights: ValueWeights,
    #[serde(default)]
    daily_cursor: u64,
    saved_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Exploration {
    epsilon: f64,
    steps: u64,
    daily_cursor: u64,
    rng: StdRng,
}

struct EngineInner {
    config: EngineConfig,
    policy: RwLock<Box<dyn QNetwork>>,
    target: RwLock<Box<dyn QNetwork>>,
    memory: Mutex<ExperienceMemory>,
    exploration: Mutex<Exploration>,
    values: ValuePolicy,
    alignment: AlignmentModel,
    registry: Arc<AdapterRegistry>,
    permissions: Arc<dyn PermissionGate>,
    log: EventLog,
    events: broadcast::Sender<EngineEvent>,
    limiter: RateLimiter,
    guard: ConcurrencyGuard,
    budget: MemoryBudget,
}

/// Shared handle to the decision engine
#[derive(Clone)]
pub struct DecisionEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for DecisionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionEngine")
            .field("architecture", &self.inner.config.architecture)
            .field("state_size", &self.inner.config.state_size)
            .field("action_size", &self.inner.config.action_size)
            .finish_non_exhaustive()
    }
}

fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] || values[best].is_nan() {
            best = i;
        }
    }
    best
}

async fn load_state(path: &std::path::Path) -> Option<EngineState> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(error) => {
            tracing::warn!(path = %path.display(), %error, "failed to read engine state");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(state) => Some(state),
        Err(error) => {
            tracing::warn!(path = %path.display(), %error, "ignoring malformed engine state");
            None
        }
    }
}

impl DecisionEngine {
    /// Build an engine, restoring models and state from `config.model_dir`
    pub async fn new(
        config: EngineConfig,
        registry: Arc<AdapterRegistry>,
        permissions: Arc<dyn PermissionGate>,
        store: Arc<dyn EventStore>,
    ) -> Result<Self> {
        config.validate()?;
        let mut rng = config.seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        let topology = Topology::from_config(&config);

        let saved = load_state(&config.model_dir.join(STATE_FILE)).await;
        let (policy, policy_loaded) =
            load_or_init(&config.model_dir.join(POLICY_DIR), &topology, config.learning_rate, &mut rng).await?;
        let (target, target_loaded) =
            load_or_init(&config.model_dir.join(TARGET_DIR), &topology, config.learning_rate, &mut rng).await?;
        let target = if target_loaded { target } else { policy.clone_network() };

        let alignment = match AlignmentModel::open(config.alignment.clone()).await {
            Ok(model) => model,
            Err(error) => {
                tracing::warn!(%error, "alignment model unavailable, starting empty");
                AlignmentModel::empty(config.alignment.clone())
            }
        };

        let (epsilon, steps, weights, daily_cursor) = match &saved {
            Some(state) => (
                state.epsilon.clamp(config.epsilon_min, config.epsilon_start),
                state.steps,
                state.weights,
                state.daily_cursor,
            ),
            None => (config.epsilon_start, 0, ValueWeights::default(), 0),
        };

        tracing::info!(
            architecture = %config.architecture,
            state_size = config.state_size,
            action_size = config.action_size,
            policy_loaded,
            target_loaded,
            steps,
            "decision engine ready"
        );

        let (events, _) = broadcast::channel(256);
        let inner = EngineInner {
            limiter: RateLimiter::new(config.training.rate_limit_per_sec, config.training.burst),
            guard: ConcurrencyGuard::new(config.training.max_concurrent),
            budget: MemoryBudget::new(config.training.max_memory_bytes),
            memory: Mutex::new(ExperienceMemory::new(config.memory_capacity)),
            exploration: Mutex::new(Exploration {
                epsilon,
                steps,
                daily_cursor,
                rng,
            }),
            policy: RwLock::new(policy),
            target: RwLock::new(target),
            values: ValuePolicy::new(weights),
            alignment,
            registry,
            permissions,
            log: EventLog::new(store),
            events,
            config,
        };
        Ok(Self { inner: Arc::new(inner) })
    }

    fn emit(&self, event: EngineEvent) {
        // Nobody listening is not an error.
        let _ = self.inner.events.send(event);
    }

    /// Score the candidates and pick one; touches nothing but the RNG
    pub async fn decide(&self, state: &[f32], candidates: &[ActionDefinition]) -> Result<Decision> {
        if candidates.is_empty() {
            return Err(EthosError::InvalidAction(NO_CANDIDATES.into()));
        }
        let config = &self.inner.config;
        let state = fit_to_size(state, config.state_size);
        let q = self.inner.policy.read().await.predict(&state)?;

        let considered = candidates.len().min(config.action_size);
        let weights = self.inner.values.weights();
        let strength = weights.alignment_strength();

        let mut q_values = Vec::with_capacity(considered);
        let mut shaped_q = Vec::with_capacity(considered);
        let mut alignment_scores = Vec::with_capacity(considered);
        for (i, candidate) in candidates.iter().take(considered).enumerate() {
            let align = self.inner.alignment.score_action(candidate).await;
            let shaped = f64::from(q[i]) - candidate.risk_level * 0.5 * weights.morality
                + (align - 0.5) * 0.5 * strength;
            q_values.push(q[i]);
            shaped_q.push(shaped as f32);
            alignment_scores.push(align);
        }

        let (index, explored, epsilon) = {
            let mut exploration = self.inner.exploration.lock().await;
            let epsilon = exploration.epsilon;
            if exploration.rng.gen::<f64>() < epsilon {
                (exploration.rng.gen_range(0..considered), true, epsilon)
            } else {
                (argmax(&shaped_q), false, epsilon)
            }
        };

        Ok(Decision {
            index,
            q_values,
            shaped_q,
            alignment_scores,
            explored,
            epsilon,
        })
    }

    /// Run one full decision cycle
    pub async fn act(&self, request: ActRequest) -> ActResult {
        let decision_id = Uuid::new_v4();

        if self.inner.permissions.is_paused() {
            tracing::warn!(%decision_id, "decision cycle refused, kill switch is on");
            self.inner
                .log
                .decision(json!({ "decision_id": decision_id, "blocked": PAUSED_BY_KILL_SWITCH }))
                .await;
            self.emit(EngineEvent::Blocked {
                decision_id,
                reason: PAUSED_BY_KILL_SWITCH.into(),
            });
            return ActResult::failed(decision_id, PAUSED_BY_KILL_SWITCH);
        }
        if request.candidates.is_empty() {
            return ActResult::failed(decision_id, NO_CANDIDATES);
        }

        let state = fit_to_size(&request.state, self.inner.config.state_size);
        let decision = match self.decide(&state, &request.candidates).await {
            Ok(decision) => decision,
            Err(error) => {
                tracing::warn!(%decision_id, %error, "scoring failed");
                return ActResult::failed(decision_id, error.to_string());
            }
        };
        let action = request.candidates[decision.index].clone();
        let align = decision.alignment_scores[decision.index];
        self.emit(EngineEvent::Decided {
            decision_id,
            index: decision.index,
            action: action.label(),
            explored: decision.explored,
        });

        let mut outcome = ActResult {
            ok: false,
            decision_id,
            index: Some(decision.index),
            action: Some(action.clone()),
            q_values: decision.q_values.clone(),
            shaped_q: decision.shaped_q.clone(),
            alignment_score: Some(align),
            explored: decision.explored,
            reward: None,
            result: None,
            error: None,
        };

        if !self.inner.values.allowed(&RewardSignal::pending(&action)) {
            tracing::warn!(%decision_id, action = %action.label(), risk = action.risk_level, "blocked by value policy");
            return self
                .finish_blocked(outcome, &state, BLOCKED_BY_VALUE_POLICY.to_string(), BLOCKED_BY_VALUES_REWARD)
                .await;
        }

        if is_high_impact(&action, self.inner.config.approval.risk_threshold) {
            let verdict = self.request_approval(decision_id, &action).await;
            if verdict != ApprovalDecision::Approve {
                tracing::warn!(%decision_id, action = %action.label(), %verdict, "blocked by operator");
                return self
                    .finish_blocked(outcome, &state, format!("blocked_by_user_{verdict}"), BLOCKED_BY_USER_REWARD)
                    .await;
            }
        }

        let result = if request.execute {
            let result = self.inner.registry.dispatch(&action).await;
            self.inner
                .log
                .action(json!({
                    "decision_id": decision_id,
                    "action": action.label(),
                    "kind": action.kind(),
                    "result": result,
                }))
                .await;
            self.emit(EngineEvent::Executed {
                decision_id,
                ok: result.ok,
            });
            Some(result)
        } else {
            None
        };

        let success = result.as_ref().map_or(true, |r| r.ok);
        let signal = RewardSignal {
            action: &action,
            success,
            feedback: request.feedback,
        };
        let reward = (self.inner.values.reward(&signal) + (align - 0.5) * 0.5) as f32;
        self.store_experience(&state, decision.index, reward).await;
        let epsilon = self.decay_epsilon().await;

        self.inner
            .log
            .decision(json!({
                "decision_id": decision_id,
                "state_size": self.inner.config.state_size,
                "action_size": self.inner.config.action_size,
                "index": decision.index,
                "action": action.label(),
                "q_values": decision.q_values,
                "shaped_q": decision.shaped_q,
                "explored": decision.explored,
                "epsilon": epsilon,
                "alignment_score": align,
                "reward": reward,
                "executed": request.execute,
                "ok": success,
            }))
            .await;

        if self.inner.config.training.train_after_act {
            self.spawn_background_step();
        }

        outcome.ok = success;
        outcome.reward = Some(reward);
        outcome.error = result.as_ref().and_then(|r| r.error.clone());
        outcome.result = result;
        outcome
    }

    async fn request_approval(&self, decision_id: Uuid, action: &ActionDefinition) -> ApprovalDecision {
        let permissions = &self.inner.permissions;
        let prompt_id = match permissions
            .create_prompt(PromptRequest::for_action(action, decision_id))
            .await
        {
            Ok(id) => id,
            Err(error) => {
                tracing::warn!(%decision_id, %error, "could not open approval prompt");
                return ApprovalDecision::Reject;
            }
        };
        self.emit(EngineEvent::ApprovalRequested { decision_id, prompt_id });
        let timeout = Duration::from_millis(self.inner.config.approval.timeout_ms);
        permissions
            .wait_for_decision(prompt_id, timeout)
            .await
            .unwrap_or_else(|error| {
                tracing::warn!(%decision_id, %error, "approval wait failed");
                ApprovalDecision::Reject
            })
    }

    async fn finish_blocked(&self, mut outcome: ActResult, state: &[f32], reason: String, reward: f32) -> ActResult {
        if let Some(index) = outcome.index {
            self.store_experience(state, index, reward).await;
        }
        self.inner
            .log
            .decision(json!({
                "decision_id": outcome.decision_id,
                "state_size": self.inner.config.state_size,
                "action_size": self.inner.config.action_size,
                "index": outcome.index,
                "action": outcome.action.as_ref().map(ActionDefinition::label),
                "q_values": &outcome.q_values,
                "shaped_q": &outcome.shaped_q,
                "blocked": reason,
                "reward": reward,
            }))
            .await;
        self.emit(EngineEvent::Blocked {
            decision_id: outcome.decision_id,
            reason: reason.clone(),
        });
        outcome.reward = Some(reward);
        outcome.error = Some(reason);
        outcome
    }

    /// Insert the transition with `next_state = state`; corrected later by
    /// [`DecisionEngine::update_last_experience`]
    async fn store_experience(&self, state: &[f32], index: usize, reward: f32) {
        let experience = Experience {
            state: state.to_vec(),
            action_index: index,
            reward,
            next_state: state.to_vec(),
            done: false,
        };
        self.inner.memory.lock().await.add(experience.clone());
        self.inner.log.experience(&experience, false).await;
    }

    async fn decay_epsilon(&self) -> f64 {
        let config = &self.inner.config;
        let mut exploration = self.inner.exploration.lock().await;
        exploration.epsilon = (exploration.epsilon * config.epsilon_decay).max(config.epsilon_min);
        exploration.epsilon
    }

    fn spawn_background_step(&self) {
        if !self.inner.guard.is_idle() {
            return;
        }
        let engine = self.clone();
        tokio::spawn(async move {
            match engine.run_step(engine.inner.config.batch_size, false).await {
                Ok(TrainOutcome::Trained { step, .. }) => tracing::debug!(step, "background training step"),
                Ok(TrainOutcome::Skipped(reason)) => tracing::debug!(?reason, "background training skipped"),
                Err(error) => tracing::debug!(%error, "background training failed"),
            }
        });
    }

    /// Correct `next_state` and `done` of the newest transition
    pub async fn update_last_experience(&self, next_state: &[f32], done: bool) -> bool {
        let next_state = fit_to_size(next_state, self.inner.config.state_size);
        let updated = {
            let mut memory = self.inner.memory.lock().await;
            if memory.update_last(next_state, done) {
                memory.last().cloned()
            } else {
                None
            }
        };
        match updated {
            Some(experience) => {
                self.inner.log.experience(&experience, true).await;
                true
            }
            None => false,
        }
    }

    /// Label an action for the alignment dataset
    pub async fn record_alignment_label(
        &self,
        action: &ActionDefinition,
        aligned: bool,
        meta: Option<serde_json::Value>,
    ) -> Result<()> {
        self.inner
            .alignment
            .ingest(alignment::features(action), aligned, meta)
            .await
    }

    /// Replace the value weights; returns the normalized result
    pub async fn set_weights(&self, raw: ValueWeights) -> ValueWeights {
        let weights = self.inner.values.set_weights(raw);
        self.inner.log.weights(&weights).await;
        self.emit(EngineEvent::WeightsChanged(weights));
        weights
    }

    /// Current value weights
    #[must_use]
    pub fn weights(&self) -> ValueWeights {
        self.inner.values.weights()
    }

    /// One training step with the configured batch size, waiting for admission
    pub async fn train_step(&self) -> Result<TrainOutcome> {
        self.run_step(self.inner.config.batch_size, true).await
    }

    /// One training step with `batch_size`, waiting for admission
    pub async fn train_step_with(&self, batch_size: usize) -> Result<TrainOutcome> {
        self.run_step(batch_size.max(1), true).await
    }

    /// Up to `max_batches` steps; stops early when memory runs short.
    /// Returns the number of steps trained.
    pub async fn train_batches(&self, max_batches: usize) -> Result<usize> {
        let mut trained = 0;
        for _ in 0..max_batches {
            match self.train_step().await? {
                TrainOutcome::Trained { .. } => trained += 1,
                TrainOutcome::Skipped(SkipReason::InsufficientExperience { .. }) => break,
                TrainOutcome::Skipped(_) => {}
            }
        }
        Ok(trained)
    }

    async fn run_step(&self, batch_size: usize, wait: bool) -> Result<TrainOutcome> {
        let inner = &self.inner;
        let _slot = if wait {
            inner.limiter.acquire().await;
            inner.guard.acquire().await?
        } else {
            // a busy guard must not spend a token
            let Some(slot) = inner.guard.try_acquire() else {
                return Ok(TrainOutcome::Skipped(SkipReason::Busy));
            };
            inner.limiter.acquire().await;
            slot
        };

        let (batch, _reservation) = {
            let memory = inner.memory.lock().await;
            let row_bytes = (2 * inner.config.state_size + 2 * inner.config.action_size) * std::mem::size_of::<f32>()
                + std::mem::size_of::<Experience>();
            let requested = memory.approx_bytes() + batch_size * row_bytes;
            let Some(reservation) = inner.budget.try_reserve(requested) else {
                let reason = SkipReason::MemoryBudget {
                    requested,
                    limit: inner.budget.limit(),
                };
                tracing::debug!(?reason, "training skipped");
                return Ok(TrainOutcome::Skipped(reason));
            };
            if memory.len() < batch_size {
                let reason = SkipReason::InsufficientExperience {
                    available: memory.len(),
                    required: batch_size,
                };
                tracing::debug!(?reason, "training skipped");
                return Ok(TrainOutcome::Skipped(reason));
            }
            let mut exploration = inner.exploration.lock().await;
            (memory.sample_with(batch_size, &mut exploration.rng), reservation)
        };

        let size = inner.config.state_size;
        let states = Array2::from_shape_fn((batch.len(), size), |(r, c)| batch[r].state[c]);
        let next_states = Array2::from_shape_fn((batch.len(), size), |(r, c)| batch[r].next_state[c]);
        let next_q = inner.target.read().await.predict_batch(&next_states)?;

        let mut policy = inner.policy.write().await;
        let mut targets = policy.predict_batch(&states)?;
        for (r, experience) in batch.iter().enumerate() {
            let best_next = next_q.row(r).iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let continuation = if experience.done { 0.0 } else { 1.0 };
            if let Some(target) = targets.get_mut((r, experience.action_index)) {
                *target = experience.reward + inner.config.gamma * best_next * continuation;
            }
        }
        let loss = policy.fit_batch(&states, &targets)?;

        let step = {
            let mut exploration = inner.exploration.lock().await;
            exploration.steps += 1;
            exploration.steps
        };
        let synced = step % inner.config.target_update_every == 0;
        if synced {
            let params = policy.parameters();
            inner.target.write().await.set_parameters(&params)?;
            tracing::info!(step, "target network synced");
            self.emit(EngineEvent::TargetSynced { step });
        }
        drop(policy);

        inner.log.trained(step, loss, synced).await;
        self.emit(EngineEvent::Trained { step, loss });
        Ok(TrainOutcome::Trained { step, loss, synced })
    }

    /// Pull experiences logged since the stored cursor back into memory.
    /// Returns how many were restored.
    pub async fn ingest_logged_experiences(&self) -> Result<usize> {
        let cursor = self.inner.exploration.lock().await.daily_cursor;
        let batch = self.inner.log.store().experiences_since(cursor).await?;

        let size = self.inner.config.state_size;
        let actions = self.inner.config.action_size;
        let mut restored: Vec<Experience> = Vec::new();
        for logged in batch.experiences {
            if logged.replaces_previous {
                restored.pop();
            }
            let e = logged.experience;
            if e.state.len() == size && e.next_state.len() == size && e.action_index < actions {
                restored.push(e);
            }
        }

        let count = restored.len();
        {
            let mut memory = self.inner.memory.lock().await;
            for experience in restored {
                memory.add(experience);
            }
        }
        self.inner.exploration.lock().await.daily_cursor = batch.cursor;
        tracing::info!(count, cursor = batch.cursor, "re-ingested logged experiences");
        Ok(count)
    }

    /// Persist policy, target and engine state under `model_dir`
    pub async fn save(&self) -> Result<PathBuf> {
        let dir = self.inner.config.model_dir.clone();
        let policy = self.inner.policy.read().await.snapshot();
        policy.save(&dir.join(POLICY_DIR)).await?;
        let target = self.inner.target.read().await.snapshot();
        target.save(&dir.join(TARGET_DIR)).await?;

        let state = {
            let exploration = self.inner.exploration.lock().await;
            EngineState {
                epsilon: exploration.epsilon,
                steps: exploration.steps,
                weights: self.inner.values.weights(),
                daily_cursor: exploration.daily_cursor,
                saved_at: Utc::now(),
            }
        };
        tokio::fs::write(dir.join(STATE_FILE), serde_json::to_vec_pretty(&state)?).await?;
        tracing::info!(dir = %dir.display(), steps = state.steps, "engine saved");
        Ok(dir)
    }

    /// Snapshot of the engine
    pub async fn status(&self) -> EngineStatus {
        let (epsilon, steps, daily_cursor) = {
            let exploration = self.inner.exploration.lock().await;
            (exploration.epsilon, exploration.steps, exploration.daily_cursor)
        };
        let (memory_len, memory_capacity) = {
            let memory = self.inner.memory.lock().await;
            (memory.len(), memory.capacity())
        };
        EngineStatus {
            architecture: self.inner.config.architecture,
            epsilon,
            steps,
            memory_len,
            memory_capacity,
            weights: self.weights(),
            training_active: self.inner.guard.active(),
            training_peak: self.inner.guard.peak(),
            adapters: self.inner.registry.names(),
            paused: self.inner.permissions.is_paused(),
            daily_cursor,
            alignment: self.inner.alignment.status().await,
        }
    }

    /// Receive engine events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    /// Flat policy parameters
    pub async fn policy_parameters(&self) -> Vec<f32> {
        self.inner.policy.read().await.parameters()
    }

    /// Flat target parameters
    pub async fn target_parameters(&self) -> Vec<f32> {
        self.inner.target.read().await.parameters()
    }

    /// Current exploration rate
    pub async fn epsilon(&self) -> f64 {
        self.inner.exploration.lock().await.epsilon
    }

    /// Training steps so far
    pub async fn steps(&self) -> u64 {
        self.inner.exploration.lock().await.steps
    }

    /// Experiences in memory
    pub async fn memory_len(&self) -> usize {
        self.inner.memory.lock().await.len()
    }

    /// Admission guard shared by every training pass
    #[must_use]
    pub fn guard(&self) -> &ConcurrencyGuard {
        &self.inner.guard
    }

    /// Alignment model
    #[must_use]
    pub fn alignment(&self) -> &AlignmentModel {
        &self.inner.alignment
    }

    /// Value policy
    #[must_use]
    pub fn values(&self) -> &ValuePolicy {
        &self.inner.values
    }

    /// Adapter registry
    #[must_use]
    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.inner.registry
    }

    /// Event log
    #[must_use]
    pub fn log(&self) -> &EventLog {
        &self.inner.log
    }

    /// Configuration the engine was built with
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }
}
