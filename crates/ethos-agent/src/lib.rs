//! Decision engine and online learning for Ethos
//!
//! This crate provides the trainable side of the agent:
//! - Experience replay memory
//! - Q-networks (dense, gated and 1-D convolutional) with persistence
//! - The learned alignment classifier
//! - Admission control for training passes
//! - Human approval for high-impact actions
//! - The decision engine and its background trainers

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]

pub mod alignment;
pub mod approval;
pub mod buffer;
pub mod engine;
pub mod journal;
pub mod limiter;
pub mod network;
pub mod trainer;

pub use alignment::{AlignmentModel, AlignmentStatus, AlignmentTraining, FEATURE_LEN};
pub use approval::{ApprovalBroker, ApprovalDecision, PermissionGate, Prompt, PromptId, PromptLevel, PromptRequest};
pub use buffer::ExperienceMemory;
pub use engine::{
    ActRequest, ActResult, Decision, DecisionEngine, EngineEvent, EngineStatus, SkipReason, TrainOutcome,
};
pub use journal::{EventLog, EventStore, JsonlEventStore, MemoryEventStore, NullEventStore};
pub use limiter::{ConcurrencyGuard, MemoryBudget, RateLimiter};
pub use network::{build_network, load_or_init, NetworkSnapshot, QNetwork, Topology};
pub use trainer::{TrainerKind, TrainingScheduler};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        ActRequest, ActResult, ApprovalBroker, ApprovalDecision, DecisionEngine, EngineEvent, PermissionGate,
        TrainOutcome, TrainingScheduler,
    };
    pub use ethos_core::prelude::*;
}
