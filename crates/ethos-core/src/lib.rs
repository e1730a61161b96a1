//! Core types for the Ethos value-aligned decision engine
//!
//! This crate holds the vocabulary shared by the engine, the adapters and
//! host applications: action definitions and execution results, replay
//! transitions, the value policy with its safety gate, the adapter contract
//! and registry, configuration and errors.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod action;
pub mod adapter;
pub mod config;
pub mod error;
pub mod experience;
pub mod values;

// Re-export core traits and types
pub use action::{ActionDefinition, ActionDefinitionBuilder, ActionKind, ActionPayload, ExecutionResult, FileOp};
pub use adapter::{ActionAdapter, AdapterRegistry, NO_ADAPTER};
pub use config::{
    AdaptersConfig, AlignmentConfig, ApprovalConfig, Architecture, DailyConfig, EngineConfig, TrainingConfig,
};
pub use error::{EthosError, Result};
pub use experience::{fit_to_size, Experience};
pub use values::{value_allowed, value_reward, RewardSignal, ValuePolicy, ValueWeights, Virtue};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        ActionAdapter, ActionDefinition, ActionKind, ActionPayload, AdapterRegistry, EngineConfig, EthosError,
        ExecutionResult, Experience, Result, ValuePolicy, ValueWeights,
    };
}
