//! Crash values: unexpected failures caught at computation boundaries.
//!
//! A [`Crash`] is the third outcome channel, carrying failures that fall
//! outside a computation's typed error contract. Every user closure the
//! runtime invokes is wrapped in [`trap`], which converts an unwinding panic
//! into a [`Crash::Normal`] with the extracted payload message and a captured
//! backtrace. Parallel compositions fuse sibling crashes into
//! [`Crash::Merged`] (two-way, operand order preserved) or
//! [`Crash::Collected`] (n-way, keyed by input index).

use std::any::Any;
use std::backtrace::Backtrace;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use thiserror::Error;

/// Result of running a closure through the [`trap`] boundary.
pub type CrashOr<T> = Result<T, Crash>;

// =============================================================================
// Crash detail
// =============================================================================

/// Message and backtrace extracted from a single caught panic.
///
/// Panic payloads are `Box<dyn Any + Send>`; the message is recovered when the
/// payload is a `&str` or `String` (which covers `panic!` with a literal or a
/// format string). The backtrace is captured at trap time and shared, so crash
/// values stay cheap to clone and computations that carry them stay reusable.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct CrashInfo {
    message: String,
    backtrace: Arc<Backtrace>,
}

impl CrashInfo {
    fn capture(message: String) -> Self {
        Self {
            message,
            backtrace: Arc::new(Backtrace::capture()),
        }
    }

    /// The panic message, or a placeholder when the payload was not a string.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Backtrace captured where the panic was trapped.
    ///
    /// Enabled by the usual `RUST_BACKTRACE` / `RUST_LIB_BACKTRACE` env vars.
    #[must_use]
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

// =============================================================================
// Crash sum
// =============================================================================

/// An unexpected failure delivered on the crash channel.
#[derive(Debug, Clone)]
pub enum Crash {
    /// A single caught panic.
    Normal(CrashInfo),
    /// Two crashes fused by a two-way parallel composition.
    ///
    /// `left` is always the left operand's crash, regardless of which operand
    /// crashed first.
    Merged {
        left: Box<Crash>,
        right: Box<Crash>,
    },
    /// Crashes from an n-way list composition, keyed by input index.
    Collected(BTreeMap<usize, Crash>),
}

impl Crash {
    /// Crash with an explicit message, capturing a backtrace here.
    pub fn message(message: impl Into<String>) -> Self {
        Self::Normal(CrashInfo::capture(message.into()))
    }

    /// Convert a caught panic payload into a crash.
    #[must_use]
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "opaque panic payload".to_string()
        };
        Self::Normal(CrashInfo::capture(message))
    }

    /// Fuse two sibling crashes, preserving operand order.
    #[must_use]
    pub fn merged(left: Crash, right: Crash) -> Self {
        Self::Merged {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Collect crashes from an n-way composition, keyed by input index.
    #[must_use]
    pub fn collected(crashes: BTreeMap<usize, Crash>) -> Self {
        Self::Collected(crashes)
    }

    /// The message of the first `Normal` crash in composition order.
    #[must_use]
    pub fn first_message(&self) -> &str {
        match self {
            Self::Normal(info) => info.message(),
            Self::Merged { left, .. } => left.first_message(),
            Self::Collected(map) => map
                .values()
                .next()
                .map_or("empty crash collection", Crash::first_message),
        }
    }
}

impl fmt::Display for Crash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal(info) => write!(f, "{}", info.message()),
            Self::Merged { left, right } => write!(f, "[{left}] merged with [{right}]"),
            Self::Collected(map) => {
                write!(f, "collected {{")?;
                for (i, (idx, crash)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "#{idx}: {crash}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl std::error::Error for Crash {}

// =============================================================================
// Trap boundary
// =============================================================================

/// Run a closure, converting an unwinding panic into a [`Crash`].
///
/// This is the protective frame around every user-supplied function the
/// runtime invokes: `from_run` bodies, `then_do` continuations, mapping and
/// predicate functions, policy combiners.
pub fn trap<T>(f: impl FnOnce() -> T) -> CrashOr<T> {
    std::panic::catch_unwind(AssertUnwindSafe(f)).map_err(Crash::from_panic)
}

/// Surface a crash outside any enclosing trap.
///
/// Used when the panic sink itself fails: the crash is logged and re-raised on
/// a detached thread so the process-global panic hook sees it, without
/// unwinding into the caller.
pub(crate) fn raise_last_resort(crash: Crash) {
    tracing::error!(target: "jerelo", %crash, "panic sink failed; re-raising out of band");
    let message = crash.to_string();
    let _ = std::thread::Builder::new()
        .name("jerelo-last-resort".to_string())
        .spawn(move || std::panic::panic_any(message));
}

// =============================================================================
// Tests
// =============================================================================
