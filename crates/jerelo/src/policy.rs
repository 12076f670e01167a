//! Execution policies for the parallel combinators.
//!
//! Every parallel combinator takes a policy choosing how operands are
//! scheduled and how their outcomes merge:
//!
//! * `Sequence` — run operands in order, stopping at the first decisive
//!   outcome;
//! * `QuitFast` — run under a shared runtime whose cancellation trips as soon
//!   as the decisive outcome arrives; late siblings observe it and drop;
//! * `RunAll` — wait for every operand and merge same-channel outcomes with
//!   the supplied combiners.

use std::fmt;
use std::sync::Arc;

/// Policy for the success-oriented combinators.
///
/// For `both`/`all` the parameter is the error type (the combiner merges
/// errors); for `either`/`any` it is the success type (the combiner merges
/// successes).
pub enum OkPolicy<T> {
    /// Run operands in order; stop at the first decisive outcome.
    Sequence,
    /// Run in parallel; the first decisive outcome cancels the rest.
    QuitFast,
    /// Run in parallel and wait for every operand.
    RunAll {
        /// Merges two same-channel values, applied in first-settled order.
        combine: Arc<dyn Fn(T, T) -> T + Send + Sync>,
        /// When true a crash anywhere dominates the merged outcome; when
        /// false non-crash outcomes take priority.
        favor_crash: bool,
    },
}

impl<T> OkPolicy<T> {
    /// Run-all policy from a combiner closure.
    pub fn run_all(combine: impl Fn(T, T) -> T + Send + Sync + 'static, favor_crash: bool) -> Self {
        Self::RunAll {
            combine: Arc::new(combine),
            favor_crash,
        }
    }
}

impl<T> Clone for OkPolicy<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Sequence => Self::Sequence,
            Self::QuitFast => Self::QuitFast,
            Self::RunAll {
                combine,
                favor_crash,
            } => Self::RunAll {
                combine: Arc::clone(combine),
                favor_crash: *favor_crash,
            },
        }
    }
}

impl<T> fmt::Debug for OkPolicy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequence => f.write_str("OkPolicy::Sequence"),
            Self::QuitFast => f.write_str("OkPolicy::QuitFast"),
            Self::RunAll { favor_crash, .. } => f
                .debug_struct("OkPolicy::RunAll")
                .field("favor_crash", favor_crash)
                .finish_non_exhaustive(),
        }
    }
}

/// Policy for the crash-fusing combinators (`coalesce`/`converge`).
pub enum CrashPolicy<F, A> {
    /// Run operands in order; stop at the first non-crash outcome.
    Sequence,
    /// Run in parallel; the first non-crash outcome cancels the rest.
    QuitFast,
    /// Run in parallel and wait for every operand.
    RunAll {
        /// When true, merged typed failures beat merged successes.
        favor_else: bool,
        /// Merges two typed failures, applied in first-settled order.
        combine_else: Arc<dyn Fn(F, F) -> F + Send + Sync>,
        /// Merges two successes, applied in first-settled order.
        combine_then: Arc<dyn Fn(A, A) -> A + Send + Sync>,
    },
}

impl<F, A> CrashPolicy<F, A> {
    /// Run-all policy from the two combiner closures.
    pub fn run_all(
        favor_else: bool,
        combine_else: impl Fn(F, F) -> F + Send + Sync + 'static,
        combine_then: impl Fn(A, A) -> A + Send + Sync + 'static,
    ) -> Self {
        Self::RunAll {
            favor_else,
            combine_else: Arc::new(combine_else),
            combine_then: Arc::new(combine_then),
        }
    }
}

impl<F, A> Clone for CrashPolicy<F, A> {
    fn clone(&self) -> Self {
        match self {
            Self::Sequence => Self::Sequence,
            Self::QuitFast => Self::QuitFast,
            Self::RunAll {
                favor_else,
                combine_else,
                combine_then,
            } => Self::RunAll {
                favor_else: *favor_else,
                combine_else: Arc::clone(combine_else),
                combine_then: Arc::clone(combine_then),
            },
        }
    }
}

impl<F, A> fmt::Debug for CrashPolicy<F, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequence => f.write_str("CrashPolicy::Sequence"),
            Self::QuitFast => f.write_str("CrashPolicy::QuitFast"),
            Self::RunAll { favor_else, .. } => f
                .debug_struct("CrashPolicy::RunAll")
                .field("favor_else", favor_else)
                .finish_non_exhaustive(),
        }
    }
}
