//! Feed-forward layer stacks and sample sets.
//!
//! The calibration driver in [`crate::statistics`] needs two things from the
//! surrounding network: a way to run a prefix of layers over an input, and a
//! way to tell which layers are normalization layers so it can freeze them
//! one at a time. `NetworkLayer` makes that distinction explicit while
//! leaving every other layer kind behind a single trait.

use std::rc::Rc;

use crate::graph::Value;
use crate::layer::BatchNormLayer;

/// A differentiable network stage: anything that maps one graph value to
/// another.
///
/// Implementations build fresh nodes on every call, so the same layer can
/// appear in many graphs at once.
pub trait Layer {
    /// Builds this layer's output node on top of `input`.
    fn apply(&self, input: Rc<dyn Value>) -> Rc<dyn Value>;
}

/// One slot in a [`Network`].
///
/// Normalization layers are held directly so the calibration driver can
/// reach their statistics; everything else is an opaque [`Layer`].
pub enum NetworkLayer {
    /// A batch normalization layer, visible to calibration.
    Norm(BatchNormLayer),
    /// Any other layer kind, opaque to calibration.
    Plain(Box<dyn Layer>),
}

impl NetworkLayer {
    /// Builds this slot's output node on top of `input`.
    pub fn apply(&self, input: Rc<dyn Value>) -> Rc<dyn Value> {
        match self {
            NetworkLayer::Norm(layer) => layer.apply(input),
            NetworkLayer::Plain(layer) => layer.apply(input),
        }
    }

    /// The contained normalization layer, if this slot holds one.
    pub fn norm(&self) -> Option<&BatchNormLayer> {
        match self {
            NetworkLayer::Norm(layer) => Some(layer),
            NetworkLayer::Plain(_) => None,
        }
    }

    /// Mutable access to the contained normalization layer, if any.
    pub fn norm_mut(&mut self) -> Option<&mut BatchNormLayer> {
        match self {
            NetworkLayer::Norm(layer) => Some(layer),
            NetworkLayer::Plain(_) => None,
        }
    }
}

/// Runs `input` through `layers` in order, returning the last output node.
///
/// An empty slice returns the input unchanged. This is the building block
/// the calibration driver uses to evaluate layer prefixes.
pub fn apply_layers(layers: &[NetworkLayer], input: Rc<dyn Value>) -> Rc<dyn Value> {
    layers.iter().fold(input, |value, layer| layer.apply(value))
}

/// An ordered stack of layers applied input-to-output.
///
/// # Example
///
/// ```
/// use batchnorm::layer::BatchNormLayer;
/// use batchnorm::network::{Network, NetworkLayer};
///
/// let mut net = Network::new();
/// net.push(NetworkLayer::Norm(BatchNormLayer::new(8, 1e-5)));
/// assert_eq!(net.len(), 1);
/// ```
pub struct Network {
    pub layers: Vec<NetworkLayer>,
}

impl Network {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    /// Appends a layer to the output end of the stack.
    pub fn push(&mut self, layer: NetworkLayer) {
        self.layers.push(layer);
    }

    /// Number of layers in the stack.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether the stack is empty.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Runs `input` through the whole stack.
    pub fn apply(&self, input: Rc<dyn Value>) -> Rc<dyn Value> {
        apply_layers(&self.layers, input)
    }
}

impl Default for Network {
    fn default() -> Self {
        Self::new()
    }
}

/// One training or calibration sample: an input vector and an optional
/// supervision target.
#[derive(Debug, Clone)]
pub struct VectorSample {
    pub input: Vec<f64>,
    pub target: Option<Vec<f64>>,
}

impl VectorSample {
    /// An unsupervised sample, as used for calibration.
    pub fn unlabeled(input: Vec<f64>) -> Self {
        Self { input, target: None }
    }
}

/// Read access to an indexed collection of sample inputs.
///
/// Calibration only consumes inputs, so targets are not part of the trait.
pub trait SampleSet {
    /// Number of samples in the set.
    fn len(&self) -> usize;

    /// Whether the set holds no samples.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The input vector of sample `idx`.
    fn input(&self, idx: usize) -> &[f64];
}

impl SampleSet for Vec<VectorSample> {
    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn input(&self, idx: usize) -> &[f64] {
        &self[idx].input
    }
}

impl SampleSet for [VectorSample] {
    fn len(&self) -> usize {
        <[VectorSample]>::len(self)
    }

    fn input(&self, idx: usize) -> &[f64] {
        &self[idx].input
    }
}
