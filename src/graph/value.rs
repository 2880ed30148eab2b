//! Core value abstraction for reverse-mode automatic differentiation.
//!
//! Every differentiable quantity in this crate implements the [`Value`] trait:
//! it exposes a dense forward output, answers whether it is constant with
//! respect to a gradient-accumulation pass, and knows how to push an upstream
//! gradient down to its inputs. Graphs are implicit: nodes hold `Rc` handles
//! to their operands, so one evaluation call builds a DAG that is dropped when
//! the last handle goes away.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_VARIABLE_ID: AtomicU64 = AtomicU64::new(0);

/// A differentiable value: a node in the implicit computation graph.
///
/// Implementations compute their output eagerly at construction time, so
/// `output` is a cheap read. `propagate` takes ownership of the upstream
/// gradient; implementations are free to mutate it in place when that is the
/// last use of the buffer.
pub trait Value {
    /// The forward output of this node.
    fn output(&self) -> Vec<f64>;

    /// True when no variable tracked by `grad` is reachable from this node.
    ///
    /// Backward passes use this to skip whole branches that cannot receive
    /// gradients.
    fn is_constant(&self, grad: &Gradient) -> bool;

    /// Push `upstream` (same length as `output`) down toward tracked
    /// variables, accumulating into `grad`.
    fn propagate(&self, upstream: Vec<f64>, grad: &mut Gradient);
}

/// A leaf value holding mutable data.
///
/// Variables are the only nodes that receive gradients directly. Their data
/// sits behind a `RefCell` so an external optimizer can step parameters
/// between graph builds; a graph must not outlive a mutation it did not see.
///
/// # Example
///
/// ```
/// use batchnorm::graph::{Value, Variable};
///
/// let v = Variable::new(vec![1.0, 2.0]);
/// assert_eq!(v.output(), vec![1.0, 2.0]);
/// v.set_data(vec![3.0, 4.0]);
/// assert_eq!(v.output(), vec![3.0, 4.0]);
/// ```
pub struct Variable {
    id: u64,
    data: RefCell<Vec<f64>>,
}

impl Variable {
    /// Create a shared variable holding `data`.
    pub fn new(data: Vec<f64>) -> Rc<Self> {
        Rc::new(Self {
            id: NEXT_VARIABLE_ID.fetch_add(1, Ordering::Relaxed),
            data: RefCell::new(data),
        })
    }

    /// Number of elements held.
    pub fn len(&self) -> usize {
        self.data.borrow().len()
    }

    /// True when the variable holds no elements.
    pub fn is_empty(&self) -> bool {
        self.data.borrow().is_empty()
    }

    /// Replace the variable's data.
    ///
    /// The length must not change; nodes built from this variable assume a
    /// fixed shape.
    ///
    /// # Panics
    ///
    /// Panics if `data` has a different length than the current contents.
    pub fn set_data(&self, data: Vec<f64>) {
        let mut held = self.data.borrow_mut();
        assert_eq!(
            held.len(),
            data.len(),
            "variable len mismatch: expected {}, got {}",
            held.len(),
            data.len()
        );
        *held = data;
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

impl Value for Variable {
    fn output(&self) -> Vec<f64> {
        self.data.borrow().clone()
    }

    fn is_constant(&self, grad: &Gradient) -> bool {
        !grad.tracks(self)
    }

    fn propagate(&self, upstream: Vec<f64>, grad: &mut Gradient) {
        grad.accumulate(self, &upstream);
    }
}

/// Gradient accumulation buffers for one backward pass.
///
/// A `Gradient` tracks exactly the variables it was created from; every other
/// variable is a constant for that pass. Buffers start at zero and sum the
/// contributions of every consumer that propagates into them.
///
/// # Example
///
/// ```
/// use batchnorm::graph::{Gradient, Value, Variable};
///
/// let v = Variable::new(vec![1.0, 2.0]);
/// let mut grad = Gradient::new(&[v.clone()]);
/// v.propagate(vec![0.5, 0.5], &mut grad);
/// v.propagate(vec![0.5, 0.5], &mut grad);
/// assert_eq!(grad.get(&v), Some(&[1.0, 1.0][..]));
/// ```
pub struct Gradient {
    slots: HashMap<u64, Vec<f64>>,
}

impl Gradient {
    /// Create a gradient tracking `variables`, with zeroed buffers.
    pub fn new(variables: &[Rc<Variable>]) -> Self {
        let mut slots = HashMap::with_capacity(variables.len());
        for v in variables {
            slots.insert(v.id(), vec![0.0; v.len()]);
        }
        Self { slots }
    }

    /// True when `variable` receives gradients in this pass.
    pub fn tracks(&self, variable: &Variable) -> bool {
        self.slots.contains_key(&variable.id())
    }

    /// The accumulated gradient for `variable`, if tracked.
    pub fn get(&self, variable: &Variable) -> Option<&[f64]> {
        self.slots.get(&variable.id()).map(Vec::as_slice)
    }

    /// Add `upstream` into the buffer for `variable`.
    ///
    /// Untracked variables are ignored; a propagation that reaches them is
    /// simply discarded.
    pub fn accumulate(&mut self, variable: &Variable, upstream: &[f64]) {
        if let Some(slot) = self.slots.get_mut(&variable.id()) {
            assert_eq!(
                slot.len(),
                upstream.len(),
                "gradient len mismatch: expected {}, got {}",
                slot.len(),
                upstream.len()
            );
            for (s, u) in slot.iter_mut().zip(upstream) {
                *s += u;
            }
        }
    }

    /// Start tracking `variable` with a zeroed buffer.
    ///
    /// Used by pooling to collect the aggregate gradient of a shared value
    /// before forwarding it upstream once.
    pub(crate) fn insert_zero(&mut self, variable: &Variable) {
        self.slots.insert(variable.id(), vec![0.0; variable.len()]);
    }

    /// Stop tracking `variable`, returning whatever accumulated.
    pub(crate) fn take(&mut self, variable: &Variable) -> Option<Vec<f64>> {
        self.slots.remove(&variable.id())
    }
}
