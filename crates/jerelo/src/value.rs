//! Blanket bound for values carried by computations.

/// Anything that can travel on an outcome channel or serve as an environment.
///
/// Runs are independent and may be re-entered from deferred callbacks, so
/// channel values must be cloneable and thread-portable. Implemented for every
/// eligible type; never implement it by hand.
pub trait Value: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Value for T {}
