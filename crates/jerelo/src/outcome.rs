//! The three-channel outcome model.
//!
//! Every run of a computation settles on exactly one of three disjoint
//! channels: `Then` (success), `Else` (typed business failure), or `Crash`
//! (unexpected failure outside the typed contract).

use crate::crash::Crash;

/// One settled outcome of a computation.
///
/// ```text
/// run ──┬──► Then(A)          success
///       ├──► Else(F)          typed failure
///       └──► Crash(Crash)     unexpected failure
/// ```
#[derive(Debug, Clone)]
pub enum Outcome<F, A> {
    /// Successful value.
    Then(A),
    /// Typed business failure.
    Else(F),
    /// Unexpected failure outside the typed error contract.
    Crash(Crash),
}

impl<F, A> Outcome<F, A> {
    /// Whether this outcome settled on the then channel.
    #[must_use]
    pub fn is_then(&self) -> bool {
        matches!(self, Self::Then(_))
    }

    /// Whether this outcome settled on the else channel.
    #[must_use]
    pub fn is_else(&self) -> bool {
        matches!(self, Self::Else(_))
    }

    /// Whether this outcome settled on the crash channel.
    #[must_use]
    pub fn is_crash(&self) -> bool {
        matches!(self, Self::Crash(_))
    }

    /// The success value, if any.
    pub fn into_then(self) -> Option<A> {
        match self {
            Self::Then(a) => Some(a),
            _ => None,
        }
    }

    /// The typed error, if any.
    pub fn into_else(self) -> Option<F> {
        match self {
            Self::Else(f) => Some(f),
            _ => None,
        }
    }

    /// The crash, if any.
    pub fn into_crash(self) -> Option<Crash> {
        match self {
            Self::Crash(c) => Some(c),
            _ => None,
        }
    }
}
