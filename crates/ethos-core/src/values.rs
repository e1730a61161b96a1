//! Value weights, value-shaped reward and the safety gate

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::ActionDefinition;

/// The six value dimensions the policy is weighted on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Virtue {
    /// Moral and safe conduct
    Morality,
    /// Kind, polite conduct
    Kindness,
    /// Willingness to take on risk
    Courage,
    /// Persistence and focus
    Determination,
    /// Caring about others
    Empathy,
    /// Helping and assisting
    Helpfulness,
}

impl Virtue {
    /// All virtues in feature order
    pub const ALL: [Virtue; 6] = [
        Virtue::Morality,
        Virtue::Kindness,
        Virtue::Courage,
        Virtue::Determination,
        Virtue::Empathy,
        Virtue::Helpfulness,
    ];

    /// Tag keywords that credit this virtue
    #[must_use]
    pub fn keywords(self) -> &'static [&'static str] {
        match self {
            Virtue::Morality => &["moral", "safe", "ethical"],
            Virtue::Kindness => &["kind", "nice", "polite"],
            Virtue::Courage => &["brave", "risk"],
            Virtue::Determination => &["persist", "focus"],
            Virtue::Empathy => &["empath", "care"],
            Virtue::Helpfulness => &["help", "assist", "support"],
        }
    }

    /// Whether a lower-cased tag fuzzy-matches this virtue
    #[must_use]
    pub fn matches(self, tag_lowercase: &str) -> bool {
        self.keywords().iter().any(|k| tag_lowercase.contains(k))
    }
}

/// Normalized value weights; always sum to 1
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueWeights {
    /// Morality weight
    pub morality: f64,
    /// Kindness weight
    pub kindness: f64,
    /// Courage weight
    pub courage: f64,
    /// Determination weight
    pub determination: f64,
    /// Empathy weight
    pub empathy: f64,
    /// Helpfulness weight
    pub helpfulness: f64,
}

impl ValueWeights {
    /// Upper clamp applied to raw weights before normalization
    pub const MAX_RAW: f64 = 10.0;

    /// Equal weight on every virtue
    #[must_use]
    pub fn uniform() -> Self {
        let w = 1.0 / 6.0;
        Self {
            morality: w,
            kindness: w,
            courage: w,
            determination: w,
            empathy: w,
            helpfulness: w,
        }
    }

    /// Clamp each raw value to `[0, MAX_RAW]` and normalize to sum 1.
    /// An all-zero input normalizes to [`ValueWeights::uniform`].
    #[must_use]
    pub fn normalize(raw: Self) -> Self {
        let clamp = |v: f64| if v.is_finite() { v.clamp(0.0, Self::MAX_RAW) } else { 0.0 };
        let clamped = Self {
            morality: clamp(raw.morality),
            kindness: clamp(raw.kindness),
            courage: clamp(raw.courage),
            determination: clamp(raw.determination),
            empathy: clamp(raw.empathy),
            helpfulness: clamp(raw.helpfulness),
        };
        let total = clamped.sum();
        if total <= f64::EPSILON {
            return Self::uniform();
        }
        Self {
            morality: clamped.morality / total,
            kindness: clamped.kindness / total,
            courage: clamped.courage / total,
            determination: clamped.determination / total,
            empathy: clamped.empathy / total,
            helpfulness: clamped.helpfulness / total,
        }
    }

    /// Sum of all six weights
    #[must_use]
    pub fn sum(&self) -> f64 {
        self.morality + self.kindness + self.courage + self.determination + self.empathy + self.helpfulness
    }

    /// Weight of one virtue
    #[must_use]
    pub fn get(&self, virtue: Virtue) -> f64 {
        match virtue {
            Virtue::Morality => self.morality,
            Virtue::Kindness => self.kindness,
            Virtue::Courage => self.courage,
            Virtue::Determination => self.determination,
            Virtue::Empathy => self.empathy,
            Virtue::Helpfulness => self.helpfulness,
        }
    }

    /// Set one raw weight; the result is not normalized
    pub fn set(&mut self, virtue: Virtue, value: f64) {
        match virtue {
            Virtue::Morality => self.morality = value,
            Virtue::Kindness => self.kindness = value,
            Virtue::Courage => self.courage = value,
            Virtue::Determination => self.determination = value,
            Virtue::Empathy => self.empathy = value,
            Virtue::Helpfulness => self.helpfulness = value,
        }
    }

    /// morality + kindness + empathy + helpfulness; scales the alignment bonus
    #[must_use]
    pub fn alignment_strength(&self) -> f64 {
        self.morality + self.kindness + self.empathy + self.helpfulness
    }
}

/// Morality-leaning starting weights; morality sits above the gate floor
impl Default for ValueWeights {
    fn default() -> Self {
        Self {
            morality: 0.25,
            kindness: 0.15,
            courage: 0.15,
            determination: 0.15,
            empathy: 0.15,
            helpfulness: 0.15,
        }
    }
}

/// Inputs for reward shaping and the safety gate
#[derive(Debug, Clone, Copy)]
pub struct RewardSignal<'a> {
    /// The acting definition
    pub action: &'a ActionDefinition,
    /// Whether execution succeeded
    pub success: bool,
    /// External feedback in `[-1, 1]`
    pub feedback: Option<f64>,
}

impl<'a> RewardSignal<'a> {
    /// Signal for an action that has not been executed yet
    #[must_use]
    pub fn pending(action: &'a ActionDefinition) -> Self {
        Self {
            action,
            success: false,
            feedback: None,
        }
    }
}

/// Risk above which low morality blocks an action
pub const GATE_RISK_THRESHOLD: f64 = 0.8;
/// Morality below which risky actions are blocked
pub const GATE_MORALITY_FLOOR: f64 = 0.2;

/// Value-shaped reward for `signal` under `weights`
#[must_use]
pub fn value_reward(weights: &ValueWeights, signal: &RewardSignal<'_>) -> f64 {
    let mut reward = 0.0;
    for tag in signal.action.tags_lowercase() {
        for virtue in Virtue::ALL {
            if virtue.matches(&tag) {
                reward += weights.get(virtue);
            }
        }
    }
    reward += if signal.success { 0.5 } else { -0.5 };
    if let Some(feedback) = signal.feedback.filter(|f| f.is_finite()) {
        reward += feedback.clamp(-1.0, 1.0) * 0.5;
    }
    reward - signal.action.risk_level * weights.morality * 0.8
}

/// Safety gate: blocks iff risk is above 0.8 while morality is below 0.2
#[must_use]
pub fn value_allowed(weights: &ValueWeights, signal: &RewardSignal<'_>) -> bool {
    !(signal.action.risk_level > GATE_RISK_THRESHOLD && weights.morality < GATE_MORALITY_FLOOR)
}

/// Holds the live value weights and notifies subscribers on change
#[derive(Debug)]
pub struct ValuePolicy {
    weights: watch::Sender<ValueWeights>,
}

impl ValuePolicy {
    /// Create a policy from raw weights (normalized on entry)
    #[must_use]
    pub fn new(raw: ValueWeights) -> Self {
        let (weights, _) = watch::channel(ValueWeights::normalize(raw));
        Self { weights }
    }

    /// Current normalized weights
    #[must_use]
    pub fn weights(&self) -> ValueWeights {
        *self.weights.borrow()
    }

    /// Replace all weights; returns the normalized result
    pub fn set_weights(&self, raw: ValueWeights) -> ValueWeights {
        let normalized = ValueWeights::normalize(raw);
        self.weights.send_replace(normalized);
        tracing::info!(?normalized, "value weights updated");
        normalized
    }

    /// Change one weight relative to the others, then renormalize
    pub fn set_weight(&self, virtue: Virtue, value: f64) -> ValueWeights {
        let mut raw = self.weights();
        raw.set(virtue, value);
        self.set_weights(raw)
    }

    /// Receive every weight change
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ValueWeights> {
        self.weights.subscribe()
    }

    /// Reward under the current weights
    #[must_use]
    pub fn reward(&self, signal: &RewardSignal<'_>) -> f64 {
        value_reward(&self.weights(), signal)
    }

    /// Safety gate under the current weights
    #[must_use]
    pub fn allowed(&self, signal: &RewardSignal<'_>) -> bool {
        value_allowed(&self.weights(), signal)
    }
}

impl Default for ValuePolicy {
    fn default() -> Self {
        Self::new(ValueWeights::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ActionPayload;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn action(risk: f64, tags: &[&str]) -> ActionDefinition {
        ActionDefinition::builder(ActionPayload::Interact {
            prompt: "hello".into(),
            data: serde_json::Value::Null,
        })
        .risk(risk)
        .tags(tags.iter().copied())
        .build()
        .unwrap()
    }

    fn weights_with_morality(morality: f64) -> ValueWeights {
        let rest = (1.0 - morality) / 5.0;
        ValueWeights {
            morality,
            kindness: rest,
            courage: rest,
            determination: rest,
            empathy: rest,
            helpfulness: rest,
        }
    }

    #[test]
    fn gate_blocks_only_risky_and_amoral() {
        let risky = action(0.9, &[]);
        let signal = RewardSignal::pending(&risky);
        assert!(!value_allowed(&weights_with_morality(0.1), &signal));
        assert!(value_allowed(&weights_with_morality(0.5), &signal));

        let calm = action(0.5, &[]);
        assert!(value_allowed(&weights_with_morality(0.1), &RewardSignal::pending(&calm)));
    }

    #[test]
    fn reward_accumulates_tag_weights() {
        let weights = ValueWeights::uniform();
        let act = action(0.0, &["helpful", "polite"]);
        let signal = RewardSignal {
            action: &act,
            success: true,
            feedback: Some(1.0),
        };
        // helpfulness + kindness + success + feedback
        assert_relative_eq!(value_reward(&weights, &signal), 2.0 / 6.0 + 0.5 + 0.5, epsilon = 1e-9);
    }

    #[test]
    fn reward_penalizes_failure_and_risk() {
        let weights = weights_with_morality(0.5);
        let act = action(1.0, &[]);
        let signal = RewardSignal {
            action: &act,
            success: false,
            feedback: Some(-5.0),
        };
        assert_relative_eq!(value_reward(&weights, &signal), -0.5 - 0.5 - 0.4, epsilon = 1e-9);
    }

    #[test]
    fn default_weights_let_risky_actions_through_the_gate() {
        let weights = ValueWeights::default();
        assert_relative_eq!(weights.sum(), 1.0, epsilon = 1e-12);
        assert!(weights.morality >= GATE_MORALITY_FLOOR);
        assert_relative_eq!(ValueWeights::normalize(weights).morality, 0.25, epsilon = 1e-12);

        let risky = action(0.95, &["purchase"]);
        assert!(value_allowed(&weights, &RewardSignal::pending(&risky)));
        assert!(ValuePolicy::default().allowed(&RewardSignal::pending(&risky)));
    }

    #[test]
    fn all_zero_weights_become_uniform() {
        let zero = ValueWeights {
            morality: 0.0,
            kindness: 0.0,
            courage: 0.0,
            determination: 0.0,
            empathy: 0.0,
            helpfulness: 0.0,
        };
        assert_eq!(ValueWeights::normalize(zero), ValueWeights::uniform());
    }

    #[test]
    fn set_weights_notifies_subscribers() {
        let policy = ValuePolicy::default();
        let mut rx = policy.subscribe();
        let updated = policy.set_weight(Virtue::Morality, 1.0);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), updated);
        assert!(updated.morality > updated.kindness);
    }

    proptest! {
        #[test]
        fn normalized_weights_sum_to_one(
            raw in proptest::array::uniform6(0.0f64..1000.0)
        ) {
            let weights = ValueWeights::normalize(ValueWeights {
                morality: raw[0],
                kindness: raw[1],
                courage: raw[2],
                determination: raw[3],
                empathy: raw[4],
                helpfulness: raw[5],
            });
            prop_assert!((weights.sum() - 1.0).abs() < 1e-6);
            prop_assert!(Virtue::ALL.iter().all(|v| weights.get(*v) >= 0.0));
        }
    }
}
