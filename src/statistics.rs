//! Sample-set statistics and the calibration driver.
//!
//! Freezing a network's normalization layers requires each layer's input
//! statistics over the full sample set, with every earlier normalization
//! layer already frozen. The driver walks the network input-to-output,
//! evaluating layer prefixes per sample through an [`OutputCache`] that
//! trades memory for re-evaluation: consecutive prefixes share all but the
//! last layer, so a cached output at depth d turns the next prefix into a
//! one-layer replay.

use crate::graph::{Value, Variable};
use crate::layer::BatchNormLayer;
use crate::network::{apply_layers, Network, NetworkLayer, SampleSet};
use crate::DEFAULT_STABILIZER;

/// Per-sample memo of the deepest prefix output seen so far.
///
/// The cache is bounded by a capacity counted in stored floats, not entries:
/// sample outputs can differ in length across layers, and the caller's
/// budget is memory. A store that would exceed the capacity is skipped and
/// the affected sample is simply re-evaluated from scratch next time, so any
/// capacity (including zero) yields the same results.
pub struct OutputCache {
    capacity: usize,
    stored: usize,
    depths: Vec<usize>,
    outputs: Vec<Option<Vec<f64>>>,
}

impl OutputCache {
    /// Creates a cache for `sample_count` samples holding at most `capacity`
    /// floats.
    pub fn new(capacity: usize, sample_count: usize) -> Self {
        Self {
            capacity,
            stored: 0,
            depths: vec![0; sample_count],
            outputs: vec![None; sample_count],
        }
    }

    /// Evaluates sample `idx` through the `layers` prefix, reusing the
    /// cached output when possible.
    ///
    /// Three cases: a cached output at exactly this depth is returned as is;
    /// a shallower cached output is replayed through the remaining layers
    /// only; otherwise (no entry, or one deeper than requested) the sample
    /// input is replayed through the full prefix. The result replaces the
    /// cached entry when the capacity allows.
    pub fn eval(
        &mut self,
        layers: &[NetworkLayer],
        samples: &(impl SampleSet + ?Sized),
        idx: usize,
    ) -> Vec<f64> {
        let depth = layers.len();
        if let Some(cached) = &self.outputs[idx] {
            let cached_depth = self.depths[idx];
            if cached_depth == depth {
                return cached.clone();
            }
            if cached_depth < depth {
                let start: std::rc::Rc<dyn Value> = Variable::new(cached.clone());
                let result = apply_layers(&layers[cached_depth..], start).output();
                self.store(idx, depth, result.clone());
                return result;
            }
        }
        let start: std::rc::Rc<dyn Value> = Variable::new(samples.input(idx).to_vec());
        let result = apply_layers(layers, start).output();
        self.store(idx, depth, result.clone());
        result
    }

    /// The prefix depth of sample `idx`'s cached output, 0 when none.
    pub fn cached_depth(&self, idx: usize) -> usize {
        self.depths[idx]
    }

    /// Total floats currently held.
    pub fn stored_floats(&self) -> usize {
        self.stored
    }

    fn store(&mut self, idx: usize, depth: usize, output: Vec<f64>) {
        // Depth 0 is the raw sample input; the sample set already holds it.
        if depth == 0 {
            return;
        }
        let replaced = self.outputs[idx].as_ref().map_or(0, Vec::len);
        let total = self.stored - replaced + output.len();
        if total > self.capacity {
            return;
        }
        self.stored = total;
        self.depths[idx] = depth;
        self.outputs[idx] = Some(output);
    }
}

/// Per-channel mean and variance of the `prefix` outputs over a sample set.
///
/// Every output is read as consecutive blocks of `channel_width` values and
/// all blocks from all samples contribute equally. Outputs may differ in
/// length between samples as long as each is a multiple of the width.
///
/// # Returns
///
/// `(mean, variance)` vectors of `channel_width` values, with the variance
/// computed as `E[x²] − E[x]²`.
///
/// # Panics
///
/// Panics if the sample set is empty or any prefix output's length is not a
/// positive multiple of `channel_width`.
pub fn batch_statistics(
    prefix: &[NetworkLayer],
    samples: &(impl SampleSet + ?Sized),
    channel_width: usize,
    cache: &mut OutputCache,
) -> (Vec<f64>, Vec<f64>) {
    assert!(channel_width > 0, "channel width must be positive");
    assert!(!samples.is_empty(), "statistics require at least one sample");

    let mut sum = vec![0.0; channel_width];
    let mut sum_sq = vec![0.0; channel_width];
    let mut blocks = 0usize;
    for idx in 0..samples.len() {
        let out = cache.eval(prefix, samples, idx);
        assert!(
            !out.is_empty() && out.len() % channel_width == 0,
            "layer {} produced size {} (not divisible by {})",
            prefix.len(),
            out.len(),
            channel_width
        );
        blocks += out.len() / channel_width;
        for (j, x) in out.iter().enumerate() {
            let c = j % channel_width;
            sum[c] += x;
            sum_sq[c] += x * x;
        }
    }

    let n = blocks as f64;
    let mean: Vec<f64> = sum.iter().map(|s| s / n).collect();
    let variance = sum_sq
        .iter()
        .zip(&mean)
        .map(|(s, m)| s / n - m * m)
        .collect();
    (mean, variance)
}

/// Freezes every normalization layer in `net` with statistics over `samples`.
///
/// Layers are processed input-to-output. For each normalization layer the
/// driver measures the mean and variance of its input over the whole sample
/// set, with every earlier normalization layer already frozen, and installs
/// `negMean = −mean` and `invStdDev = 1 / sqrt(stabilizer + variance)`.
/// Afterwards the layer normalizes any input with those fixed statistics,
/// which is what inference and later layers' statistics see.
///
/// `cache_capacity` bounds the float count of the prefix-output cache; it
/// affects running time only, never the installed statistics. A zero
/// `stabilizer` selects [`DEFAULT_STABILIZER`].
///
/// # Panics
///
/// Panics if the sample set is empty, the stabilizer is negative, or a
/// layer's input size does not divide by its channel width.
pub fn calibrate(
    net: &mut Network,
    samples: &(impl SampleSet + ?Sized),
    stabilizer: f64,
    cache_capacity: usize,
) {
    assert!(
        stabilizer >= 0.0 && stabilizer.is_finite(),
        "stabilizer must be a non-negative finite number, got {}",
        stabilizer
    );
    let stabilizer = if stabilizer == 0.0 {
        DEFAULT_STABILIZER
    } else {
        stabilizer
    };
    assert!(!samples.is_empty(), "calibration requires at least one sample");

    let mut cache = OutputCache::new(cache_capacity, samples.len());
    for i in 0..net.layers.len() {
        let (prefix, rest) = net.layers.split_at_mut(i);
        let layer: &mut BatchNormLayer = match rest[0].norm_mut() {
            Some(layer) => layer,
            None => continue,
        };
        // Cached outputs all sit at depths <= i, upstream of the layer being
        // rewritten, so the mutation cannot invalidate them.
        let (mean, variance) =
            batch_statistics(prefix, samples, layer.channel_width(), &mut cache);
        let neg_mean = mean.iter().map(|m| -m).collect();
        let inv_std = variance
            .iter()
            .map(|v| 1.0 / (stabilizer + v).sqrt())
            .collect();
        layer.install_statistics(neg_mean, inv_std);
    }
}
