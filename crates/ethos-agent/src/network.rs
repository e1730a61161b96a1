//! Trainable Q-networks for the policy and target
//!
//! Networks are pure ndarray stacks of layers with hand-written backward
//! passes. Every architecture maps a state vector of length `input_dim` to
//! `output_dim` action values, so the engine never needs to know which one is
//! configured. Parameters are exchanged as one flat `Vec<f32>` in layer
//! order, which is what target sync, the optimizer and persistence use.

use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2, Axis, Zip};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::path::Path;

use ethos_core::{Architecture, EngineConfig, EthosError, Result};

/// Topology descriptor file inside a model directory
pub const TOPOLOGY_FILE: &str = "model.json";
/// Weight tensor file inside a model directory
pub const WEIGHTS_FILE: &str = "weights.bin";

const MODEL_FORMAT: u32 = 1;
const CONV_FILTERS: usize = 8;
const CONV_KERNEL: usize = 3;

/// Q-network trait shared by every architecture
pub trait QNetwork: Send + Sync {
    /// Shape of the network
    fn topology(&self) -> &Topology;

    /// Configured layer stack
    fn architecture(&self) -> Architecture {
        self.topology().architecture
    }

    /// State vector length
    fn input_dim(&self) -> usize {
        self.topology().input_dim
    }

    /// Number of action values
    fn output_dim(&self) -> usize {
        self.topology().output_dim
    }

    /// Action values for one state
    fn predict(&self, state: &[f32]) -> Result<Array1<f32>>;

    /// Action values for a batch of states, one row per state
    fn predict_batch(&self, states: &Array2<f32>) -> Result<Array2<f32>>;

    /// One MSE gradient step over the whole batch; returns the pre-update loss
    fn fit_batch(&mut self, states: &Array2<f32>, targets: &Array2<f32>) -> Result<f32>;

    /// Flat copy of every parameter in layer order
    fn parameters(&self) -> Vec<f32>;

    /// Overwrite every parameter from a flat slice
    fn set_parameters(&mut self, params: &[f32]) -> Result<()>;

    /// Deep copy of the network
    fn clone_network(&self) -> Box<dyn QNetwork>;

    /// Topology plus parameters, ready to persist
    fn snapshot(&self) -> NetworkSnapshot {
        NetworkSnapshot {
            topology: self.topology().clone(),
            parameters: self.parameters(),
        }
    }
}

/// Architecture and layer widths of a network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    /// Layer stack
    pub architecture: Architecture,
    /// State vector length
    pub input_dim: usize,
    /// Number of action values
    pub output_dim: usize,
    /// Hidden widths
    pub hidden: Vec<usize>,
}

impl Topology {
    /// Policy topology described by the engine configuration
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            architecture: config.architecture,
            input_dim: config.state_size,
            output_dim: config.action_size,
            hidden: config.hidden_sizes.clone(),
        }
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn model_err(e: impl std::fmt::Display) -> EthosError {
    EthosError::Model(e.to_string())
}

/// He-normal initialised matrix
fn he_init<R: Rng>(rows: usize, cols: usize, fan_in: usize, rng: &mut R) -> Result<Array2<f32>> {
    let std = (2.0 / fan_in.max(1) as f32).sqrt();
    let normal = Normal::new(0.0, std).map_err(model_err)?;
    Ok(Array2::from_shape_fn((rows, cols), |_| normal.sample(rng)))
}

/// Fully connected layer
#[derive(Debug, Clone)]
pub struct Dense {
    /// `(in, out)` weight matrix
    pub weights: Array2<f32>,
    /// Output bias
    pub bias: Array1<f32>,
}

impl Dense {
    fn new<R: Rng>(in_dim: usize, out_dim: usize, rng: &mut R) -> Result<Self> {
        Ok(Self {
            weights: he_init(in_dim, out_dim, in_dim, rng)?,
            bias: Array1::zeros(out_dim),
        })
    }

    fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        x.dot(&self.weights) + &self.bias
    }

    fn backward(&self, x: &Array2<f32>, grad: &Array2<f32>, grads: &mut Vec<f32>) -> Array2<f32> {
        let grad_w = x.t().dot(grad);
        let grad_b = grad.sum_axis(Axis(0));
        grads.extend(grad_w.iter());
        grads.extend(grad_b.iter());
        grad.dot(&self.weights.t())
    }

    fn param_count(&self) -> usize {
        self.weights.len() + self.bias.len()
    }

    fn write_params(&self, out: &mut Vec<f32>) {
        out.extend(self.weights.iter());
        out.extend(self.bias.iter());
    }

    fn read_params(&mut self, src: &[f32]) -> usize {
        let split = self.weights.len();
        for (w, v) in self.weights.iter_mut().zip(&src[..split]) {
            *w = *v;
        }
        for (b, v) in self.bias.iter_mut().zip(&src[split..]) {
            *b = *v;
        }
        self.param_count()
    }
}

/// Attention-gated block: `relu(value(x)) * sigmoid(gate(x))`
#[derive(Debug, Clone)]
pub struct Gated {
    value: Dense,
    gate: Dense,
}

impl Gated {
    fn new<R: Rng>(in_dim: usize, out_dim: usize, rng: &mut R) -> Result<Self> {
        Ok(Self {
            value: Dense::new(in_dim, out_dim, rng)?,
            gate: Dense::new(in_dim, out_dim, rng)?,
        })
    }

    fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let mut out = self.value.forward(x);
        let gate = self.gate.forward(x);
        Zip::from(&mut out).and(&gate).for_each(|a, &g| *a = a.max(0.0) * sigmoid(g));
        out
    }

    fn backward(&self, x: &Array2<f32>, grad: &Array2<f32>, grads: &mut Vec<f32>) -> Array2<f32> {
        let pre_value = self.value.forward(x);
        let pre_gate = self.gate.forward(x);
        let mut grad_value = grad.clone();
        let mut grad_gate = grad.clone();
        Zip::from(&mut grad_value)
            .and(&mut grad_gate)
            .and(&pre_value)
            .and(&pre_gate)
            .for_each(|dv, dg, &a, &g| {
                let upstream = *dv;
                let s = sigmoid(g);
                *dv = if a > 0.0 { upstream * s } else { 0.0 };
                *dg = upstream * a.max(0.0) * s * (1.0 - s);
            });

        let mut value_grads = Vec::with_capacity(self.value.param_count());
        let mut gate_grads = Vec::with_capacity(self.gate.param_count());
        let dx_value = self.value.backward(x, &grad_value, &mut value_grads);
        let dx_gate = self.gate.backward(x, &grad_gate, &mut gate_grads);
        grads.extend(value_grads);
        grads.extend(gate_grads);
        dx_value + dx_gate
    }

    fn param_count(&self) -> usize {
        self.value.param_count() + self.gate.param_count()
    }

    fn write_params(&self, out: &mut Vec<f32>) {
        self.value.write_params(out);
        self.gate.write_params(out);
    }

    fn read_params(&mut self, src: &[f32]) -> usize {
        let used = self.value.read_params(src);
        used + self.gate.read_params(&src[used..])
    }
}

/// Single-channel 1-D convolution, stride 1, no padding.
/// Output column `f * out_len + t` holds filter `f` at offset `t`.
#[derive(Debug, Clone)]
pub struct Conv1d {
    kernels: Array2<f32>,
    bias: Array1<f32>,
    input_len: usize,
}

impl Conv1d {
    fn new<R: Rng>(input_len: usize, filters: usize, kernel: usize, rng: &mut R) -> Result<Self> {
        let kernel = kernel.clamp(1, input_len.max(1));
        Ok(Self {
            kernels: he_init(filters, kernel, kernel, rng)?,
            bias: Array1::zeros(filters),
            input_len,
        })
    }

    fn out_len(&self) -> usize {
        self.input_len - self.kernels.ncols() + 1
    }

    fn output_dim(&self) -> usize {
        self.kernels.nrows() * self.out_len()
    }

    fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let (filters, kernel) = self.kernels.dim();
        let len = self.out_len();
        let mut out = Array2::zeros((x.nrows(), filters * len));
        for (row, mut out_row) in x.outer_iter().zip(out.outer_iter_mut()) {
            for f in 0..filters {
                for t in 0..len {
                    let mut acc = self.bias[f];
                    for j in 0..kernel {
                        acc += self.kernels[[f, j]] * row[t + j];
                    }
                    out_row[f * len + t] = acc;
                }
            }
        }
        out
    }

    fn backward(&self, x: &Array2<f32>, grad: &Array2<f32>, grads: &mut Vec<f32>) -> Array2<f32> {
        let (filters, kernel) = self.kernels.dim();
        let len = self.out_len();
        let mut grad_k = Array2::<f32>::zeros((filters, kernel));
        let mut grad_b = Array1::<f32>::zeros(filters);
        let mut grad_x = Array2::<f32>::zeros(x.dim());
        for b in 0..x.nrows() {
            for f in 0..filters {
                for t in 0..len {
                    let g = grad[[b, f * len + t]];
                    grad_b[f] += g;
                    for j in 0..kernel {
                        grad_k[[f, j]] += g * x[[b, t + j]];
                        grad_x[[b, t + j]] += g * self.kernels[[f, j]];
                    }
                }
            }
        }
        grads.extend(grad_k.iter());
        grads.extend(grad_b.iter());
        grad_x
    }

    fn param_count(&self) -> usize {
        self.kernels.len() + self.bias.len()
    }

    fn write_params(&self, out: &mut Vec<f32>) {
        out.extend(self.kernels.iter());
        out.extend(self.bias.iter());
    }

    fn read_params(&mut self, src: &[f32]) -> usize {
        let split = self.kernels.len();
        for (k, v) in self.kernels.iter_mut().zip(&src[..split]) {
            *k = *v;
        }
        for (b, v) in self.bias.iter_mut().zip(&src[split..]) {
            *b = *v;
        }
        self.param_count()
    }
}

#[derive(Debug, Clone)]
enum Layer {
    Dense(Dense),
    Relu,
    Gated(Gated),
    Conv1d(Conv1d),
}

impl Layer {
    fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        match self {
            Layer::Dense(l) => l.forward(x),
            Layer::Relu => x.mapv(|v| v.max(0.0)),
            Layer::Gated(l) => l.forward(x),
            Layer::Conv1d(l) => l.forward(x),
        }
    }

    fn backward(&self, x: &Array2<f32>, grad: &Array2<f32>, grads: &mut Vec<f32>) -> Array2<f32> {
        match self {
            Layer::Dense(l) => l.backward(x, grad, grads),
            Layer::Relu => {
                let mut out = grad.clone();
                Zip::from(&mut out).and(x).for_each(|g, &v| {
                    if v <= 0.0 {
                        *g = 0.0;
                    }
                });
                out
            }
            Layer::Gated(l) => l.backward(x, grad, grads),
            Layer::Conv1d(l) => l.backward(x, grad, grads),
        }
    }

    fn param_count(&self) -> usize {
        match self {
            Layer::Dense(l) => l.param_count(),
            Layer::Relu => 0,
            Layer::Gated(l) => l.param_count(),
            Layer::Conv1d(l) => l.param_count(),
        }
    }

    fn write_params(&self, out: &mut Vec<f32>) {
        match self {
            Layer::Dense(l) => l.write_params(out),
            Layer::Relu => {}
            Layer::Gated(l) => l.write_params(out),
            Layer::Conv1d(l) => l.write_params(out),
        }
    }

    fn read_params(&mut self, src: &[f32]) -> usize {
        match self {
            Layer::Dense(l) => l.read_params(src),
            Layer::Relu => 0,
            Layer::Gated(l) => l.read_params(src),
            Layer::Conv1d(l) => l.read_params(src),
        }
    }
}

/// Adam optimizer over a flat parameter vector
#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    m: Vec<f32>,
    v: Vec<f32>,
    t: i32,
}

impl Adam {
    /// Create an optimizer with the usual moment decay rates
    #[must_use]
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
            m: Vec::new(),
            v: Vec::new(),
            t: 0,
        }
    }

    /// Apply one update in place
    pub fn step(&mut self, params: &mut [f32], grads: &[f32]) {
        if self.m.len() != params.len() {
            self.m = vec![0.0; params.len()];
            self.v = vec![0.0; params.len()];
            self.t = 0;
        }
        self.t = self.t.saturating_add(1);
        let correction1 = 1.0 - self.beta1.powi(self.t);
        let correction2 = 1.0 - self.beta2.powi(self.t);
        for (((p, &g), m), v) in params.iter_mut().zip(grads).zip(&mut self.m).zip(&mut self.v) {
            *m = self.beta1 * *m + (1.0 - self.beta1) * g;
            *v = self.beta2 * *v + (1.0 - self.beta2) * g * g;
            let m_hat = *m / correction1;
            let v_hat = *v / correction2;
            *p -= self.learning_rate * m_hat / (v_hat.sqrt() + self.epsilon);
        }
    }
}

/// Layer stack implementing [`QNetwork`]
#[derive(Debug, Clone)]
pub struct SequentialNet {
    topology: Topology,
    layers: Vec<Layer>,
    optimizer: Adam,
}

impl SequentialNet {
    /// Build a randomly initialised network
    pub fn new<R: Rng>(topology: Topology, learning_rate: f32, rng: &mut R) -> Result<Self> {
        if topology.input_dim == 0 || topology.output_dim == 0 || topology.hidden.is_empty() {
            return Err(EthosError::Model(format!("invalid topology {topology:?}")));
        }
        let mut layers = Vec::new();
        let mut width = topology.input_dim;
        match topology.architecture {
            Architecture::Dense => {
                for &hidden in &topology.hidden {
                    layers.push(Layer::Dense(Dense::new(width, hidden, rng)?));
                    layers.push(Layer::Relu);
                    width = hidden;
                }
            }
            Architecture::Gated => {
                for &hidden in &topology.hidden {
                    layers.push(Layer::Gated(Gated::new(width, hidden, rng)?));
                    width = hidden;
                }
            }
            Architecture::Conv1d => {
                let conv = Conv1d::new(width, CONV_FILTERS, CONV_KERNEL, rng)?;
                width = conv.output_dim();
                layers.push(Layer::Conv1d(conv));
                layers.push(Layer::Relu);
                let hidden = topology.hidden[topology.hidden.len() - 1];
                layers.push(Layer::Dense(Dense::new(width, hidden, rng)?));
                layers.push(Layer::Relu);
                width = hidden;
            }
        }
        layers.push(Layer::Dense(Dense::new(width, topology.output_dim, rng)?));

        Ok(Self {
            topology,
            layers,
            optimizer: Adam::new(learning_rate),
        })
    }

    fn param_count(&self) -> usize {
        self.layers.iter().map(Layer::param_count).sum()
    }

    fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        self.layers.iter().fold(x.clone(), |h, layer| layer.forward(&h))
    }

    fn check_batch(&self, states: &Array2<f32>) -> Result<()> {
        if states.ncols() != self.topology.input_dim {
            return Err(EthosError::DimensionMismatch {
                expected: self.topology.input_dim,
                actual: states.ncols(),
            });
        }
        Ok(())
    }

    /// MSE loss and flat parameter gradients for a batch
    fn loss_and_gradients(&self, states: &Array2<f32>, targets: &Array2<f32>) -> Result<(f32, Vec<f32>)> {
        self.check_batch(states)?;
        if targets.dim() != (states.nrows(), self.topology.output_dim) || states.nrows() == 0 {
            return Err(EthosError::Model(format!(
                "targets shape {:?} does not match batch of {} x {}",
                targets.dim(),
                states.nrows(),
                self.topology.output_dim
            )));
        }

        let mut inputs = Vec::with_capacity(self.layers.len());
        let mut hidden = states.clone();
        for layer in &self.layers {
            let next = layer.forward(&hidden);
            inputs.push(hidden);
            hidden = next;
        }

        let diff = &hidden - targets;
        let n = diff.len() as f32;
        let loss = diff.mapv(|d| d * d).sum() / n;
        let mut grad = diff.mapv(|d| 2.0 * d / n);

        let mut per_layer = vec![Vec::new(); self.layers.len()];
        for (i, layer) in self.layers.iter().enumerate().rev() {
            let mut layer_grads = Vec::with_capacity(layer.param_count());
            grad = layer.backward(&inputs[i], &grad, &mut layer_grads);
            per_layer[i] = layer_grads;
        }
        Ok((loss, per_layer.into_iter().flatten().collect()))
    }
}

impl QNetwork for SequentialNet {
    fn topology(&self) -> &Topology {
        &self.topology
    }

    fn predict(&self, state: &[f32]) -> Result<Array1<f32>> {
        let x = Array2::from_shape_vec((1, state.len()), state.to_vec()).map_err(model_err)?;
        let out = self.predict_batch(&x)?;
        Ok(out.row(0).to_owned())
    }

    fn predict_batch(&self, states: &Array2<f32>) -> Result<Array2<f32>> {
        self.check_batch(states)?;
        Ok(self.forward(states))
    }

    fn fit_batch(&mut self, states: &Array2<f32>, targets: &Array2<f32>) -> Result<f32> {
        let (loss, grads) = self.loss_and_gradients(states, targets)?;
        if !loss.is_finite() {
            return Err(EthosError::Model("non-finite training loss".into()));
        }
        let mut params = self.parameters();
        self.optimizer.step(&mut params, &grads);
        self.set_parameters(&params)?;
        Ok(loss)
    }

    fn parameters(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.param_count());
        for layer in &self.layers {
            layer.write_params(&mut out);
        }
        out
    }

    fn set_parameters(&mut self, params: &[f32]) -> Result<()> {
        let expected = self.param_count();
        if params.len() != expected {
            return Err(EthosError::DimensionMismatch {
                expected,
                actual: params.len(),
            });
        }
        let mut offset = 0;
        for layer in &mut self.layers {
            offset += layer.read_params(&params[offset..]);
        }
        Ok(())
    }

    fn clone_network(&self) -> Box<dyn QNetwork> {
        Box::new(self.clone())
    }
}

/// Build a fresh network for `topology`
pub fn build_network<R: Rng>(topology: &Topology, learning_rate: f32, rng: &mut R) -> Result<Box<dyn QNetwork>> {
    Ok(Box::new(SequentialNet::new(topology.clone(), learning_rate, rng)?))
}

/// Contents of `model.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ModelDescriptor {
    format: u32,
    topology: Topology,
    parameter_count: usize,
    saved_at: DateTime<Utc>,
}

/// Topology plus flat parameters
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkSnapshot {
    /// Shape of the network
    pub topology: Topology,
    /// Parameters in layer order
    pub parameters: Vec<f32>,
}

impl NetworkSnapshot {
    /// Write `model.json` and `weights.bin` into `dir`
    pub async fn save(&self, dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dir).await?;
        let descriptor = ModelDescriptor {
            format: MODEL_FORMAT,
            topology: self.topology.clone(),
            parameter_count: self.parameters.len(),
            saved_at: Utc::now(),
        };
        tokio::fs::write(dir.join(TOPOLOGY_FILE), serde_json::to_vec_pretty(&descriptor)?).await?;
        let weights = bincode::serialize(&self.parameters).map_err(model_err)?;
        tokio::fs::write(dir.join(WEIGHTS_FILE), weights).await?;
        Ok(())
    }

    /// Read a snapshot written by [`NetworkSnapshot::save`]
    pub async fn load(dir: &Path) -> Result<Self> {
        let descriptor: ModelDescriptor = serde_json::from_slice(&tokio::fs::read(dir.join(TOPOLOGY_FILE)).await?)?;
        if descriptor.format != MODEL_FORMAT {
            return Err(EthosError::Model(format!("unsupported model format {}", descriptor.format)));
        }
        let parameters: Vec<f32> =
            bincode::deserialize(&tokio::fs::read(dir.join(WEIGHTS_FILE)).await?).map_err(model_err)?;
        if parameters.len() != descriptor.parameter_count {
            return Err(EthosError::DimensionMismatch {
                expected: descriptor.parameter_count,
                actual: parameters.len(),
            });
        }
        Ok(Self {
            topology: descriptor.topology,
            parameters,
        })
    }

    /// Rebuild a live network from this snapshot
    pub fn restore<R: Rng>(&self, learning_rate: f32, rng: &mut R) -> Result<Box<dyn QNetwork>> {
        let mut network = build_network(&self.topology, learning_rate, rng)?;
        network.set_parameters(&self.parameters)?;
        Ok(network)
    }
}

/// Load the network stored in `dir`, or build a fresh one.
///
/// A missing directory, unreadable files or a topology that differs from
/// `topology` all fall back to random initialisation. The flag reports
/// whether weights were restored.
pub async fn load_or_init<R: Rng>(
    dir: &Path,
    topology: &Topology,
    learning_rate: f32,
    rng: &mut R,
) -> Result<(Box<dyn QNetwork>, bool)> {
    let loaded = if dir.join(TOPOLOGY_FILE).exists() {
        match NetworkSnapshot::load(dir).await {
            Ok(snapshot) if snapshot.topology == *topology => Some(snapshot),
            Ok(snapshot) => {
                tracing::warn!(
                    dir = %dir.display(),
                    stored = ?snapshot.topology,
                    "stored model topology differs from configuration, reinitialising"
                );
                None
            }
            Err(error) => {
                tracing::warn!(dir = %dir.display(), %error, "failed to load model, reinitialising");
                None
            }
        }
    } else {
        None
    };

    if let Some(snapshot) = loaded {
        match snapshot.restore(learning_rate, rng) {
            Ok(network) => return Ok((network, true)),
            Err(error) => tracing::warn!(dir = %dir.display(), %error, "failed to restore model, reinitialising"),
        }
    }
    Ok((build_network(topology, learning_rate, rng)?, false))
}
