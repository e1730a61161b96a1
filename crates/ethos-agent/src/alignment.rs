//! Learned alignment classifier
//!
//! Scores how well an action fits the operator's values. Until enough
//! labelled samples exist the score comes from a fixed heuristic over the
//! action's risk and tags; afterwards a one-hidden-layer classifier trained
//! on the labelled dataset takes over.

use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use ethos_core::{ActionDefinition, ActionKind, AlignmentConfig, EthosError, Result, Virtue};

use crate::network::Adam;

/// Length of an alignment feature vector
pub const FEATURE_LEN: usize = ActionKind::ALL.len() + Virtue::ALL.len() + 2;

const RISK_FEATURE: usize = FEATURE_LEN - 2;
const POSITIVE_FEATURE: usize = FEATURE_LEN - 1;

const DATASET_FILE: &str = "dataset.jsonl";
const CLASSIFIER_FILE: &str = "classifier.json";

/// Feature vector: kind one-hot, virtue indicators, risk, positive-tag fraction
#[must_use]
pub fn features(action: &ActionDefinition) -> Vec<f32> {
    let mut out = vec![0.0; FEATURE_LEN];
    out[action.kind().index()] = 1.0;

    let tags: Vec<String> = action.tags_lowercase().collect();
    let offset = ActionKind::ALL.len();
    for (i, virtue) in Virtue::ALL.iter().enumerate() {
        if tags.iter().any(|t| virtue.matches(t)) {
            out[offset + i] = 1.0;
        }
    }

    out[RISK_FEATURE] = action.risk_level as f32;
    if !tags.is_empty() {
        let positive = tags
            .iter()
            .filter(|t| Virtue::ALL.iter().any(|v| v.matches(t)))
            .count();
        out[POSITIVE_FEATURE] = positive as f32 / tags.len() as f32;
    }
    out
}

/// Score used before a classifier is available
#[must_use]
pub fn heuristic_score(features: &[f32]) -> f64 {
    let risk = f64::from(features.get(RISK_FEATURE).copied().unwrap_or(0.0));
    let positive = f64::from(features.get(POSITIVE_FEATURE).copied().unwrap_or(0.0));
    (0.5 + positive * 0.4 - risk * 0.4).clamp(0.0, 1.0)
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// One labelled example
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentSample {
    /// Feature vector of length [`FEATURE_LEN`]
    pub features: Vec<f32>,
    /// 1 when the action was judged aligned, else 0
    pub label: u8,
    /// Free-form context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
    /// When the label was recorded
    pub recorded_at: DateTime<Utc>,
}

/// Binary classifier: ReLU hidden layer, sigmoid output
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Classifier {
    w1: Array2<f32>,
    b1: Array1<f32>,
    w2: Array1<f32>,
    b2: f32,
}

impl Classifier {
    fn new(hidden: usize, rng: &mut StdRng) -> Result<Self> {
        let std = (2.0 / FEATURE_LEN as f32).sqrt();
        let normal = Normal::new(0.0, std).map_err(|e| EthosError::Model(e.to_string()))?;
        let out_std = (1.0 / hidden.max(1) as f32).sqrt();
        let out_normal = Normal::new(0.0, out_std).map_err(|e| EthosError::Model(e.to_string()))?;
        Ok(Self {
            w1: Array2::from_shape_fn((FEATURE_LEN, hidden), |_| normal.sample(rng)),
            b1: Array1::zeros(hidden),
            w2: Array1::from_shape_fn(hidden, |_| out_normal.sample(rng)),
            b2: 0.0,
        })
    }

    fn probabilities(&self, x: &Array2<f32>) -> (Array2<f32>, Array1<f32>) {
        let hidden = (x.dot(&self.w1) + &self.b1).mapv(|v| v.max(0.0));
        let probs = (hidden.dot(&self.w2) + self.b2).mapv(sigmoid);
        (hidden, probs)
    }

    fn predict(&self, features: &[f32]) -> Result<f64> {
        let x = Array2::from_shape_vec((1, features.len()), features.to_vec())
            .map_err(|e| EthosError::Model(e.to_string()))?;
        let (_, probs) = self.probabilities(&x);
        Ok(f64::from(probs[0]))
    }

    fn parameters(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.w1.len() + self.b1.len() + self.w2.len() + 1);
        out.extend(self.w1.iter());
        out.extend(self.b1.iter());
        out.extend(self.w2.iter());
        out.push(self.b2);
        out
    }

    fn set_parameters(&mut self, params: &[f32]) {
        let mut it = params.iter().copied();
        for w in self.w1.iter_mut().chain(self.b1.iter_mut()).chain(self.w2.iter_mut()) {
            *w = it.next().unwrap_or(*w);
        }
        if let Some(b) = it.next() {
            self.b2 = b;
        }
    }

    /// Mean binary cross-entropy and flat gradients
    fn loss_and_gradients(&self, x: &Array2<f32>, y: &Array1<f32>) -> (f32, Vec<f32>) {
        let n = x.nrows().max(1) as f32;
        let (hidden, probs) = self.probabilities(x);
        let eps = 1e-7;
        let loss = probs
            .iter()
            .zip(y)
            .map(|(&p, &t)| -(t * (p + eps).ln() + (1.0 - t) * (1.0 - p + eps).ln()))
            .sum::<f32>()
            / n;

        let dz = (&probs - y) / n;
        let grad_w2 = hidden.t().dot(&dz);
        let grad_b2 = dz.sum();
        let mut dh = dz.insert_axis(Axis(1)).dot(&self.w2.view().insert_axis(Axis(0)));
        dh.zip_mut_with(&hidden, |g, &h| {
            if h <= 0.0 {
                *g = 0.0;
            }
        });
        let grad_w1 = x.t().dot(&dh);
        let grad_b1 = dh.sum_axis(Axis(0));

        let mut grads = Vec::with_capacity(self.w1.len() + self.b1.len() + self.w2.len() + 1);
        grads.extend(grad_w1.iter());
        grads.extend(grad_b1.iter());
        grads.extend(grad_w2.iter());
        grads.push(grad_b2);
        (loss, grads)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TrainedClassifier {
    classifier: Classifier,
    trained_on: usize,
    last_loss: f32,
    trained_at: DateTime<Utc>,
}

/// Result of [`AlignmentModel::train`]
#[derive(Debug, Clone, PartialEq)]
pub enum AlignmentTraining {
    /// Classifier fitted and persisted
    Trained {
        /// Samples in the dataset
        samples: usize,
        /// Mean loss of the final epoch
        loss: f32,
    },
    /// Not enough labelled samples
    Skipped {
        /// Samples in the dataset
        samples: usize,
        /// Samples required
        required: usize,
    },
}

/// Snapshot of the model state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentStatus {
    /// Whether scores come from the classifier
    pub trained: bool,
    /// Labelled samples on hand
    pub samples: usize,
    /// Dataset size at the last training run
    pub trained_on: usize,
    /// Final loss of the last training run
    pub last_loss: Option<f32>,
    /// Time of the last training run
    pub trained_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct AlignmentState {
    samples: VecDeque<AlignmentSample>,
    trained: Option<TrainedClassifier>,
}

/// Alignment dataset plus classifier
#[derive(Debug)]
pub struct AlignmentModel {
    config: AlignmentConfig,
    state: RwLock<AlignmentState>,
}

impl AlignmentModel {
    /// Open the model stored in `config.dir`, creating the directory if needed
    pub async fn open(config: AlignmentConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.dir).await?;

        let mut samples = VecDeque::new();
        match tokio::fs::read_to_string(config.dir.join(DATASET_FILE)).await {
            Ok(content) => {
                for line in content.lines().filter(|l| !l.trim().is_empty()) {
                    match serde_json::from_str::<AlignmentSample>(line) {
                        Ok(sample) if sample.features.len() == FEATURE_LEN => samples.push_back(sample),
                        Ok(_) => tracing::debug!("skipping alignment sample with wrong feature length"),
                        Err(error) => tracing::debug!(%error, "skipping malformed alignment sample"),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        while samples.len() > config.max_samples {
            samples.pop_front();
        }

        let trained = match tokio::fs::read(config.dir.join(CLASSIFIER_FILE)).await {
            Ok(bytes) => match serde_json::from_slice::<TrainedClassifier>(&bytes) {
                Ok(t) if t.classifier.w1.nrows() == FEATURE_LEN => Some(t),
                Ok(_) => {
                    tracing::warn!("stored alignment classifier has a different feature layout, ignoring");
                    None
                }
                Err(error) => {
                    tracing::warn!(%error, "failed to load alignment classifier, using heuristic");
                    None
                }
            },
            Err(_) => None,
        };

        tracing::debug!(samples = samples.len(), trained = trained.is_some(), "alignment model opened");
        Ok(Self {
            config,
            state: RwLock::new(AlignmentState { samples, trained }),
        })
    }

    /// Empty model; nothing is read from disk
    pub fn empty(config: AlignmentConfig) -> Self {
        Self {
            config,
            state: RwLock::new(AlignmentState::default()),
        }
    }

    fn dataset_path(&self) -> PathBuf {
        self.config.dir.join(DATASET_FILE)
    }

    /// Alignment score in `[0, 1]`
    pub async fn score(&self, features: &[f32]) -> f64 {
        let state = self.state.read().await;
        if let Some(trained) = state
            .trained
            .as_ref()
            .filter(|t| t.trained_on >= self.config.min_samples)
        {
            match trained.classifier.predict(features) {
                Ok(p) if p.is_finite() => return p.clamp(0.0, 1.0),
                Ok(_) => tracing::debug!("classifier produced a non-finite score"),
                Err(error) => tracing::debug!(%error, "classifier scoring failed"),
            }
        }
        heuristic_score(features)
    }

    /// Score an action directly
    pub async fn score_action(&self, action: &ActionDefinition) -> f64 {
        self.score(&features(action)).await
    }

    /// Append a labelled sample and trim the dataset to its cap
    pub async fn ingest(&self, features: Vec<f32>, aligned: bool, meta: Option<serde_json::Value>) -> Result<()> {
        if features.len() != FEATURE_LEN {
            return Err(EthosError::DimensionMismatch {
                expected: FEATURE_LEN,
                actual: features.len(),
            });
        }
        let sample = AlignmentSample {
            features,
            label: u8::from(aligned),
            meta,
            recorded_at: Utc::now(),
        };

        let mut state = self.state.write().await;
        state.samples.push_back(sample.clone());
        if state.samples.len() > self.config.max_samples {
            while state.samples.len() > self.config.max_samples {
                state.samples.pop_front();
            }
            let mut content = String::new();
            for s in &state.samples {
                content.push_str(&serde_json::to_string(s)?);
                content.push('\n');
            }
            tokio::fs::write(self.dataset_path(), content).await?;
        } else {
            let mut line = serde_json::to_string(&sample)?;
            line.push('\n');
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.dataset_path())
                .await?;
            file.write_all(line.as_bytes()).await?;
        }
        Ok(())
    }

    /// Fit a fresh classifier on the whole dataset and persist it
    pub async fn train(&self, epochs: usize, batch_size: usize) -> Result<AlignmentTraining> {
        let samples: Vec<AlignmentSample> = self.state.read().await.samples.iter().cloned().collect();
        if samples.len() < self.config.min_samples {
            tracing::debug!(
                samples = samples.len(),
                required = self.config.min_samples,
                "alignment training skipped"
            );
            return Ok(AlignmentTraining::Skipped {
                samples: samples.len(),
                required: self.config.min_samples,
            });
        }

        let (classifier, loss) = self.fit(&samples, epochs.max(1), batch_size.max(1))?;
        let trained = TrainedClassifier {
            classifier,
            trained_on: samples.len(),
            last_loss: loss,
            trained_at: Utc::now(),
        };
        tokio::fs::create_dir_all(&self.config.dir).await?;
        tokio::fs::write(
            self.config.dir.join(CLASSIFIER_FILE),
            serde_json::to_vec(&trained)?,
        )
        .await?;
        self.state.write().await.trained = Some(trained);

        tracing::info!(samples = samples.len(), loss, "alignment classifier trained");
        Ok(AlignmentTraining::Trained {
            samples: samples.len(),
            loss,
        })
    }

    fn fit(&self, samples: &[AlignmentSample], epochs: usize, batch_size: usize) -> Result<(Classifier, f32)> {
        let mut rng = StdRng::from_entropy();
        let mut classifier = Classifier::new(self.config.hidden_size.max(1), &mut rng)?;
        let mut optimizer = Adam::new(self.config.learning_rate);
        let mut order: Vec<usize> = (0..samples.len()).collect();
        let mut epoch_loss = 0.0;

        for _ in 0..epochs {
            order.shuffle(&mut rng);
            let mut total = 0.0;
            for chunk in order.chunks(batch_size) {
                let x = Array2::from_shape_fn((chunk.len(), FEATURE_LEN), |(r, c)| samples[chunk[r]].features[c]);
                let y = Array1::from_iter(chunk.iter().map(|&i| f32::from(samples[i].label)));
                let (loss, grads) = classifier.loss_and_gradients(&x, &y);
                let mut params = classifier.parameters();
                optimizer.step(&mut params, &grads);
                classifier.set_parameters(&params);
                total += loss * chunk.len() as f32;
            }
            epoch_loss = total / samples.len() as f32;
        }
        if !epoch_loss.is_finite() {
            return Err(EthosError::Model("alignment training diverged".into()));
        }
        Ok((classifier, epoch_loss))
    }

    /// Dataset and classifier summary
    pub async fn status(&self) -> AlignmentStatus {
        let state = self.state.read().await;
        AlignmentStatus {
            trained: state.trained.is_some(),
            samples: state.samples.len(),
            trained_on: state.trained.as_ref().map_or(0, |t| t.trained_on),
            last_loss: state.trained.as_ref().map(|t| t.last_loss),
            trained_at: state.trained.as_ref().map(|t| t.trained_at),
        }
    }

    /// Default epochs and batch size from the configuration
    #[must_use]
    pub fn defaults(&self) -> (usize, usize) {
        (self.config.epochs, self.config.batch_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ethos_core::ActionPayload;

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

    fn config(dir: &std::path::Path) -> AlignmentConfig {
        AlignmentConfig {
            dir: dir.to_path_buf(),
            max_samples: 50,
            ..AlignmentConfig::default()
        }
    }

    #[test]
    fn features_encode_kind_virtues_and_risk() {
        let f = features(&action(0.3, &["Helpful", "urgent"]));
        assert_eq!(f.len(), 19);
        assert_eq!(f[ActionKind::Interact.index()], 1.0);
        assert_eq!(f.iter().take(ActionKind::ALL.len()).sum::<f32>(), 1.0);
        assert_eq!(f[ActionKind::ALL.len() + 5], 1.0);
        assert_eq!(f[ActionKind::ALL.len()], 0.0);
        assert_relative_eq!(f[RISK_FEATURE], 0.3);
        assert_relative_eq!(f[POSITIVE_FEATURE], 0.5);
    }

    #[tokio::test]
    async fn untrained_model_uses_heuristic() {
        let dir = tempfile::tempdir().unwrap();
        let model = AlignmentModel::open(config(dir.path())).await.unwrap();
        assert_relative_eq!(model.score_action(&action(0.0, &[])).await, 0.5);
        assert_relative_eq!(model.score_action(&action(1.0, &[])).await, 0.1, epsilon = 1e-6);
        assert_relative_eq!(model.score_action(&action(0.0, &["kind"])).await, 0.9, epsilon = 1e-6);
    }

    #[tokio::test]
    async fn training_below_minimum_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let model = AlignmentModel::open(config(dir.path())).await.unwrap();
        for _ in 0..5 {
            model.ingest(features(&action(0.1, &[])), true, None).await.unwrap();
        }
        let outcome = model.train(5, 4).await.unwrap();
        assert_eq!(outcome, AlignmentTraining::Skipped { samples: 5, required: 20 });
        assert!(!model.status().await.trained);
    }

    #[tokio::test]
    async fn dataset_is_capped_and_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let model = AlignmentModel::open(config(dir.path())).await.unwrap();
        for i in 0..60 {
            let meta = Some(serde_json::json!({ "i": i }));
            model.ingest(features(&action(0.2, &["care"])), i % 2 == 0, meta).await.unwrap();
        }
        assert_eq!(model.status().await.samples, 50);
        assert!(model.ingest(vec![0.0; 3], true, None).await.is_err());

        let reopened = AlignmentModel::open(config(dir.path())).await.unwrap();
        let state = reopened.state.read().await;
        assert_eq!(state.samples.len(), 50);
        assert_eq!(state.samples[0].meta, Some(serde_json::json!({ "i": 10 })));
    }

    #[tokio::test]
    async fn classifier_learns_separable_labels() {
        let dir = tempfile::tempdir().unwrap();
        let model = AlignmentModel::open(config(dir.path())).await.unwrap();
        for i in 0..40 {
            let (sample, aligned) = if i % 2 == 0 {
                (action(0.05, &["help"]), true)
            } else {
                (action(0.95, &["transfer"]), false)
            };
            model.ingest(features(&sample), aligned, None).await.unwrap();
        }

        let outcome = model.train(200, 8).await.unwrap();
        assert!(matches!(outcome, AlignmentTraining::Trained { samples: 40, .. }));

        let good = model.score_action(&action(0.05, &["help"])).await;
        let bad = model.score_action(&action(0.95, &["transfer"])).await;
        assert!(good > 0.8, "good {good}");
        assert!(bad < 0.2, "bad {bad}");

        let status = model.status().await;
        assert!(status.trained);
        assert_eq!(status.trained_on, 40);

        let reopened = AlignmentModel::open(config(dir.path())).await.unwrap();
        assert_relative_eq!(
            reopened.score_action(&action(0.05, &["help"])).await,
            good,
            epsilon = 1e-6
        );
    }
}
