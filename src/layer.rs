//! Batch normalization layer implementation
//!
//! This module provides a `BatchNormLayer` that normalizes repeated
//! channel-wide blocks of its input, applies a learned affine transform, and
//! participates in reverse-mode differentiation through the fused primitives
//! in [`crate::primitives`].
//!
//! # Batch Normalization Theory
//!
//! For each of C channel positions, across the N blocks of one evaluation:
//!
//! 1. Compute batch statistics: mean μ and variance σ² = E[x²] − E[x]²
//! 2. Normalize: x_norm = (x − μ) / sqrt(σ² + ε)
//! 3. Scale and shift: y = scale · x_norm + bias
//!
//! During training the statistics come from the current batch itself and the
//! whole chain is differentiable, so gradients flow to `scale`, `bias`, and
//! (when requested) the input. Once statistics for the full sample set have
//! been installed by [`crate::statistics::calibrate`], the layer is frozen:
//! it normalizes with the stored statistics and never recomputes them.
//!
//! # References
//!
//! Ioffe, S., & Szegedy, C. (2015). Batch Normalization: Accelerating Deep
//! Network Training by Reducing Internal Covariate Shift. ICML.

use std::error::Error;
use std::fs;
use std::rc::Rc;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::graph::{pool, pow, scale as scale_op, Value, Variable};
use crate::primitives::{add_mul, mean, mean_of_squares, mul_add, std_dev};
use crate::DEFAULT_STABILIZER;

/// Lifecycle state of a [`BatchNormLayer`].
///
/// The transition from `Training` to `Frozen` happens exactly one way: by
/// installing statistics via [`BatchNormLayer::install_statistics`]. There is
/// no implicit fallback based on which vectors happen to be populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Statistics are recomputed from each batch; the full chain is
    /// differentiable.
    Training,
    /// Installed statistics are broadcast as constants; only `scale` and
    /// `bias` receive gradients.
    Frozen,
}

/// Batch normalization layer with learnable per-channel scale and bias.
///
/// The layer normalizes inputs made of N repeated blocks of `channel_width`
/// values. For placement after a dense layer the channel width is the full
/// layer size (N = batch size); after a convolution it is the filter count
/// (N = spatial positions × batch size).
///
/// `scale` and `bias` are owned by the layer and exposed as shared variables
/// so an external optimizer can register them for gradients and step them
/// between passes. The frozen statistics are owned by the layer and
/// overwritten wholesale by the calibration driver.
///
/// # Example
///
/// ```
/// use batchnorm::layer::{BatchNormLayer, Mode};
///
/// let layer = BatchNormLayer::new(512, 1e-5);
/// assert_eq!(layer.channel_width(), 512);
/// assert_eq!(layer.mode(), Mode::Training);
/// assert_eq!(layer.parameter_count(), 1024); // 512 scale + 512 bias
/// ```
pub struct BatchNormLayer {
    channel_width: usize,
    scale: Rc<Variable>,
    bias: Rc<Variable>,
    stabilizer: f64,
    mode: Mode,
    neg_mean: Vec<f64>,
    inv_std_dev: Vec<f64>,
}

impl BatchNormLayer {
    /// Creates a layer in training mode with identity parameters.
    ///
    /// `scale` is initialized to 1.0 (no scaling) and `bias` to 0.0 (no
    /// shift), so the network can learn to undo the normalization when that
    /// is optimal. A `stabilizer` of 0.0 selects [`DEFAULT_STABILIZER`].
    ///
    /// # Panics
    ///
    /// Panics if `channel_width` is zero or `stabilizer` is negative or
    /// non-finite.
    ///
    /// # Examples
    ///
    /// ```
    /// use batchnorm::layer::BatchNormLayer;
    /// let layer = BatchNormLayer::new(256, 0.0);
    /// assert_eq!(layer.stabilizer(), batchnorm::DEFAULT_STABILIZER);
    /// ```
    pub fn new(channel_width: usize, stabilizer: f64) -> Self {
        assert!(channel_width > 0, "channel width must be positive");
        assert!(
            stabilizer >= 0.0 && stabilizer.is_finite(),
            "stabilizer must be a non-negative finite number, got {}",
            stabilizer
        );

        Self {
            channel_width,
            scale: Variable::new(vec![1.0; channel_width]),
            bias: Variable::new(vec![0.0; channel_width]),
            stabilizer,
            mode: Mode::Training,
            neg_mean: Vec::new(),
            inv_std_dev: Vec::new(),
        }
    }

    /// Number of independently normalized positions per block.
    pub fn channel_width(&self) -> usize {
        self.channel_width
    }

    /// Current lifecycle state.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// The effective stabilizer: the configured value, or the default when
    /// the caller supplied zero.
    pub fn stabilizer(&self) -> f64 {
        if self.stabilizer == 0.0 {
            DEFAULT_STABILIZER
        } else {
            self.stabilizer
        }
    }

    /// Shared handle to the learned scale parameters.
    pub fn scale(&self) -> Rc<Variable> {
        Rc::clone(&self.scale)
    }

    /// Shared handle to the learned bias parameters.
    pub fn bias(&self) -> Rc<Variable> {
        Rc::clone(&self.bias)
    }

    /// The learnable variables, for gradient registration.
    pub fn parameters(&self) -> Vec<Rc<Variable>> {
        vec![Rc::clone(&self.scale), Rc::clone(&self.bias)]
    }

    /// Get the number of trainable parameters (scale + bias).
    ///
    /// Frozen statistics are not trainable.
    pub fn parameter_count(&self) -> usize {
        2 * self.channel_width
    }

    /// The installed negated means, empty while training.
    pub fn neg_mean(&self) -> &[f64] {
        &self.neg_mean
    }

    /// The installed inverse standard deviations, empty while training.
    pub fn inv_std_dev(&self) -> &[f64] {
        &self.inv_std_dev
    }

    /// Install frozen statistics and enter (or stay in) `Frozen` mode.
    ///
    /// `neg_mean[j]` is the negated per-channel mean and `inv_std_dev[j]` the
    /// reciprocal of the stabilized standard deviation, typically produced by
    /// [`crate::statistics::calibrate`]. Repeated installation overwrites the
    /// statistics wholesale; the mode transition itself is one-way.
    ///
    /// # Panics
    ///
    /// Panics if either vector's length differs from the channel width.
    pub fn install_statistics(&mut self, neg_mean: Vec<f64>, inv_std_dev: Vec<f64>) {
        assert_eq!(
            neg_mean.len(),
            self.channel_width,
            "neg_mean len mismatch: expected {}, got {}",
            self.channel_width,
            neg_mean.len()
        );
        assert_eq!(
            inv_std_dev.len(),
            self.channel_width,
            "inv_std_dev len mismatch: expected {}, got {}",
            self.channel_width,
            inv_std_dev.len()
        );
        self.neg_mean = neg_mean;
        self.inv_std_dev = inv_std_dev;
        self.mode = Mode::Frozen;
    }

    /// Apply the layer to a single input, deriving the block count from its
    /// length.
    ///
    /// In training mode the input's own blocks provide the statistics; note
    /// that a single C-wide sample then has zero variance and is normalized
    /// by the stabilizer alone, which is why inference should happen in
    /// frozen mode.
    ///
    /// # Panics
    ///
    /// Panics if the input length is not a positive multiple of the channel
    /// width.
    pub fn apply(&self, input: Rc<dyn Value>) -> Rc<dyn Value> {
        let len = input.output().len();
        let n = self.block_count(len);
        match self.mode {
            Mode::Training => self.training_batch(input, n),
            Mode::Frozen => self.frozen_batch(input, n),
        }
    }

    /// Apply the layer to a batch of `n` blocks.
    ///
    /// # Panics
    ///
    /// Panics if the input length is not exactly `n` blocks of the channel
    /// width.
    pub fn batch(&self, input: Rc<dyn Value>, n: usize) -> Rc<dyn Value> {
        let len = input.output().len();
        assert_eq!(
            len,
            n * self.channel_width,
            "input len mismatch: expected {} ({} blocks of width {}), got {}",
            n * self.channel_width,
            n,
            self.channel_width,
            len
        );
        assert!(n > 0, "batch requires at least one block");
        match self.mode {
            Mode::Training => self.training_batch(input, n),
            Mode::Frozen => self.frozen_batch(input, n),
        }
    }

    fn block_count(&self, len: usize) -> usize {
        assert!(
            len > 0 && len % self.channel_width == 0,
            "invalid input size: {} is not a positive multiple of channel width {}",
            len,
            self.channel_width
        );
        len / self.channel_width
    }

    /// Training path: normalize with the batch's own statistics.
    ///
    /// The input is pooled so its forward value is computed once and shared
    /// by the mean, the mean of squares, and the recentering step; the
    /// backward pass aggregates their gradients before the input sees them.
    fn training_batch(&self, input: Rc<dyn Value>, n: usize) -> Rc<dyn Value> {
        let width = self.channel_width;
        let stabilizer = self.stabilizer();
        pool(input, |shared| {
            let shared: Rc<dyn Value> = shared;
            let m = mean(Rc::clone(&shared), width);
            let ms = mean_of_squares(Rc::clone(&shared), width);
            let sd = std_dev(Rc::clone(&m), ms, stabilizer);
            let inv_std = pow(sd, -1.0);
            let neg_mean = scale_op(m, -1.0);
            let normalized = add_mul(shared, neg_mean, inv_std, n);
            mul_add(normalized, self.scale(), self.bias(), n)
        })
    }

    /// Frozen path: broadcast the installed statistics as constants through
    /// the same fused chain, `((input + negMean) * invStdDev) * scale + bias`.
    fn frozen_batch(&self, input: Rc<dyn Value>, n: usize) -> Rc<dyn Value> {
        assert_eq!(
            self.neg_mean.len(),
            self.channel_width,
            "frozen layer has no installed statistics"
        );
        // Fresh variables are never registered in a gradient, so the frozen
        // statistics stay constant for every backward pass.
        let neg_mean = Variable::new(self.neg_mean.clone());
        let inv_std = Variable::new(self.inv_std_dev.clone());
        let normalized = add_mul(input, neg_mean, inv_std, n);
        mul_add(normalized, self.scale(), self.bias(), n)
    }
}

/// Serialized form of the layer state.
///
/// Carries the full tuple needed to reproduce `apply` behavior, including
/// the explicit mode flag.
#[derive(Serialize, Deserialize)]
struct LayerRecord {
    channel_width: usize,
    scale: Vec<f64>,
    bias: Vec<f64>,
    neg_mean: Vec<f64>,
    inv_std_dev: Vec<f64>,
    stabilizer: f64,
    mode: Mode,
}

impl Serialize for BatchNormLayer {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        LayerRecord {
            channel_width: self.channel_width,
            scale: self.scale.output(),
            bias: self.bias.output(),
            neg_mean: self.neg_mean.clone(),
            inv_std_dev: self.inv_std_dev.clone(),
            stabilizer: self.stabilizer,
            mode: self.mode,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for BatchNormLayer {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let record = LayerRecord::deserialize(deserializer)?;
        if record.channel_width == 0 {
            return Err(D::Error::custom("channel_width must be positive"));
        }
        if record.scale.len() != record.channel_width
            || record.bias.len() != record.channel_width
        {
            return Err(D::Error::custom(format!(
                "parameter lengths {}/{} do not match channel width {}",
                record.scale.len(),
                record.bias.len(),
                record.channel_width
            )));
        }
        if record.mode == Mode::Frozen
            && (record.neg_mean.len() != record.channel_width
                || record.inv_std_dev.len() != record.channel_width)
        {
            return Err(D::Error::custom(
                "frozen layer requires statistics of channel width length",
            ));
        }
        if !(record.stabilizer >= 0.0 && record.stabilizer.is_finite()) {
            return Err(D::Error::custom("stabilizer must be non-negative and finite"));
        }
        Ok(Self {
            channel_width: record.channel_width,
            scale: Variable::new(record.scale),
            bias: Variable::new(record.bias),
            stabilizer: record.stabilizer,
            mode: record.mode,
            neg_mean: record.neg_mean,
            inv_std_dev: record.inv_std_dev,
        })
    }
}

/// Saves a layer's state as JSON to the file at `path`.
pub fn save_layer(layer: &BatchNormLayer, path: &str) -> Result<(), Box<dyn Error>> {
    let contents = serde_json::to_string_pretty(layer)?;
    fs::write(path, contents)?;
    Ok(())
}

/// Loads a layer's state from the JSON file at `path`.
///
/// # Returns
///
/// `Ok(BatchNormLayer)` on success, or an error if the file cannot be read
/// or the JSON is invalid.
pub fn load_layer(path: &str) -> Result<BatchNormLayer, Box<dyn Error>> {
    let contents = fs::read_to_string(path)?;
    let layer: BatchNormLayer = serde_json::from_str(&contents)?;
    Ok(layer)
}
