//! Human approval for high-impact actions
//!
//! The engine talks to a [`PermissionGate`]: it opens a prompt, then waits
//! for a decision with a timeout. [`ApprovalBroker`] is an in-process gate a
//! host UI drives through [`ApprovalBroker::pending`] and
//! [`ApprovalBroker::resolve`]. It also carries the kill switch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use uuid::Uuid;

use ethos_core::{ActionDefinition, EthosError, Result};

lazy_static! {
    static ref HIGH_IMPACT_TAG: Regex =
        Regex::new(r"(?i)\b(pay|purchase|book|financial|transfer|delete|shutdown)").expect("valid pattern");
}

/// Split a tag into space-separated words at punctuation, `_`, `-` and
/// lower-to-upper case changes: `autoPay_now` becomes `auto Pay now`
fn tag_words(tag: &str) -> String {
    let mut words = String::with_capacity(tag.len() + 4);
    let mut after_lower = false;
    for c in tag.chars() {
        if c.is_alphanumeric() {
            if c.is_uppercase() && after_lower {
                words.push(' ');
            }
            after_lower = c.is_lowercase() || c.is_numeric();
            words.push(c);
        } else {
            words.push(' ');
            after_lower = false;
        }
    }
    words
}

/// Whether `action` needs explicit approval before it runs
#[must_use]
pub fn is_high_impact(action: &ActionDefinition, risk_threshold: f64) -> bool {
    action.risk_level >= risk_threshold
        || action
            .tags
            .iter()
            .any(|tag| HIGH_IMPACT_TAG.is_match(&tag_words(tag)))
}

/// Prompt identifier
pub type PromptId = Uuid;

/// Outcome of an approval prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    /// Go ahead
    Approve,
    /// Do not run the action
    Reject,
    /// Not now
    Delay,
    /// Nobody answered in time
    Timeout,
}

impl ApprovalDecision {
    /// Lower-case name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalDecision::Approve => "approve",
            ApprovalDecision::Reject => "reject",
            ApprovalDecision::Delay => "delay",
            ApprovalDecision::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity shown to the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptLevel {
    /// Informational
    Info,
    /// Needs attention
    #[default]
    Warning,
    /// Irreversible or costly
    Critical,
}

/// What the engine asks the operator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptRequest {
    /// Severity
    pub level: PromptLevel,
    /// Short title
    pub title: String,
    /// Why approval is needed
    pub rationale: String,
    /// Decisions offered
    pub options: Vec<ApprovalDecision>,
    /// Action and decision context
    #[serde(default)]
    pub meta: serde_json::Value,
}

impl PromptRequest {
    /// Approval request for `action`
    #[must_use]
    pub fn for_action(action: &ActionDefinition, decision_id: Uuid) -> Self {
        let level = if action.risk_level >= 0.9 {
            PromptLevel::Critical
        } else {
            PromptLevel::Warning
        };
        Self {
            level,
            title: format!("Approve {}?", action.label()),
            rationale: format!(
                "risk {:.2}, tags [{}]",
                action.risk_level,
                action.tags.iter().cloned().collect::<Vec<_>>().join(", ")
            ),
            options: vec![ApprovalDecision::Approve, ApprovalDecision::Reject, ApprovalDecision::Delay],
            meta: serde_json::json!({ "decision_id": decision_id, "action": action }),
        }
    }
}

/// An open prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    /// Identifier used to resolve the prompt
    pub id: PromptId,
    /// The request
    #[serde(flatten)]
    pub request: PromptRequest,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Permission collaborator used by the decision engine
#[async_trait]
pub trait PermissionGate: Send + Sync {
    /// Open a prompt
    async fn create_prompt(&self, request: PromptRequest) -> Result<PromptId>;

    /// Wait for the operator's decision; [`ApprovalDecision::Timeout`] when
    /// none arrives within `timeout`
    async fn wait_for_decision(&self, id: PromptId, timeout: Duration) -> Result<ApprovalDecision>;

    /// Kill switch; no decision cycle runs while set
    fn is_paused(&self) -> bool;
}

struct Pending {
    prompt: Prompt,
    reply: oneshot::Sender<ApprovalDecision>,
}

/// In-process permission gate
pub struct ApprovalBroker {
    pending: DashMap<PromptId, Pending>,
    waiters: DashMap<PromptId, oneshot::Receiver<ApprovalDecision>>,
    paused: AtomicBool,
    prompts: broadcast::Sender<Prompt>,
}

impl fmt::Debug for ApprovalBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApprovalBroker")
            .field("pending", &self.pending.len())
            .field("paused", &self.is_paused())
            .finish()
    }
}

impl Default for ApprovalBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl ApprovalBroker {
    /// Empty broker, not paused
    #[must_use]
    pub fn new() -> Self {
        let (prompts, _) = broadcast::channel(64);
        Self {
            pending: DashMap::new(),
            waiters: DashMap::new(),
            paused: AtomicBool::new(false),
            prompts,
        }
    }

    /// Answer an open prompt; false when it is unknown or already closed
    pub fn resolve(&self, id: PromptId, decision: ApprovalDecision) -> bool {
        match self.pending.remove(&id) {
            Some((_, pending)) => {
                tracing::info!(%id, %decision, "approval prompt resolved");
                pending.reply.send(decision).is_ok()
            }
            None => false,
        }
    }

    /// Open prompts, oldest first
    #[must_use]
    pub fn pending(&self) -> Vec<Prompt> {
        let mut prompts: Vec<Prompt> = self.pending.iter().map(|entry| entry.prompt.clone()).collect();
        prompts.sort_by_key(|p| p.created_at);
        prompts
    }

    /// Set or clear the kill switch
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
        tracing::warn!(paused, "kill switch changed");
    }

    /// Receive every new prompt
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Prompt> {
        self.prompts.subscribe()
    }
}

#[async_trait]
impl PermissionGate for ApprovalBroker {
    async fn create_prompt(&self, request: PromptRequest) -> Result<PromptId> {
        let prompt = Prompt {
            id: Uuid::new_v4(),
            request,
            created_at: Utc::now(),
        };
        let id = prompt.id;
        let (reply, waiter) = oneshot::channel();
        self.waiters.insert(id, waiter);
        self.pending.insert(
            id,
            Pending {
                prompt: prompt.clone(),
                reply,
            },
        );
        tracing::info!(%id, title = %prompt.request.title, "approval prompt opened");
        // No subscribers is fine; the prompt stays listed in `pending`.
        let _ = self.prompts.send(prompt);
        Ok(id)
    }

    async fn wait_for_decision(&self, id: PromptId, timeout: Duration) -> Result<ApprovalDecision> {
        let (_, waiter) = self
            .waiters
            .remove(&id)
            .ok_or_else(|| EthosError::Approval(format!("unknown prompt {id}")))?;
        match tokio::time::timeout(timeout, waiter).await {
            Ok(Ok(decision)) => Ok(decision),
            Ok(Err(_)) => Err(EthosError::Approval(format!("prompt {id} was dropped"))),
            Err(_) => {
                self.pending.remove(&id);
                tracing::info!(%id, "approval prompt timed out");
                Ok(ApprovalDecision::Timeout)
            }
        }
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethos_core::ActionPayload;
    use std::sync::Arc;

    fn action(risk: f64, tags: &[&str]) -> ActionDefinition {
        ActionDefinition::builder(ActionPayload::System {
            command: "noop".into(),
            params: serde_json::Value::Null,
        })
        .risk(risk)
        .tags(tags.iter().copied())
        .build()
        .unwrap()
    }

    #[test]
    fn high_impact_by_risk_or_tag() {
        assert!(is_high_impact(&action(0.8, &[]), 0.8));
        assert!(!is_high_impact(&action(0.79, &[]), 0.8));
        assert!(is_high_impact(&action(0.0, &["Payment"]), 0.8));
        assert!(is_high_impact(&action(0.0, &["wire-transfer"]), 0.8));
        assert!(is_high_impact(&action(0.0, &["booking"]), 0.8));
        assert!(!is_high_impact(&action(0.0, &["repay"]), 0.8));
        assert!(!is_high_impact(&action(0.0, &["notebook"]), 0.8));
    }

    #[test]
    fn compound_tags_are_split_into_words() {
        for tag in [
            "file_delete",
            "bulk_delete",
            "auto_purchase",
            "system_shutdown",
            "autoPay",
            "scheduleBooking",
            "FUNDS.TRANSFER",
            "x-financial-report",
        ] {
            assert!(is_high_impact(&action(0.0, &[tag]), 0.8), "{tag} should need approval");
        }
        for tag in ["repay_loan", "notebook_sync", "display", "undeleted"] {
            assert!(!is_high_impact(&action(0.0, &[tag]), 0.8), "{tag} should not need approval");
        }
        assert_eq!(tag_words("autoPay_now"), "auto Pay now");
    }

    #[tokio::test]
    async fn resolved_prompt_returns_decision() {
        let broker = Arc::new(ApprovalBroker::new());
        let mut prompts = broker.subscribe();
        let id = broker
            .create_prompt(PromptRequest::for_action(&action(0.9, &[]), Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(prompts.recv().await.unwrap().id, id);
        assert_eq!(broker.pending().len(), 1);

        let resolver = Arc::clone(&broker);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(resolver.resolve(id, ApprovalDecision::Delay));
        });
        let decision = broker.wait_for_decision(id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(decision, ApprovalDecision::Delay);
        assert!(broker.pending().is_empty());
        assert!(!broker.resolve(id, ApprovalDecision::Approve));
    }

    #[tokio::test]
    async fn unanswered_prompt_times_out() {
        let broker = ApprovalBroker::new();
        let id = broker
            .create_prompt(PromptRequest::for_action(&action(0.9, &[]), Uuid::new_v4()))
            .await
            .unwrap();
        let decision = broker.wait_for_decision(id, Duration::from_millis(20)).await.unwrap();
        assert_eq!(decision, ApprovalDecision::Timeout);
        assert!(broker.pending().is_empty());
        assert!(broker.wait_for_decision(id, Duration::from_millis(1)).await.is_err());
    }

    #[test]
    fn kill_switch_toggles() {
        let broker = ApprovalBroker::new();
        assert!(!broker.is_paused());
        broker.set_paused(true);
        assert!(broker.is_paused());
    }
}
