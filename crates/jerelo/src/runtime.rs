//! Runtime context threaded through every run: environment, cooperative
//! cancellation, and the panic sink.
//!
//! A [`Runtime`] is handed to every run procedure alongside an observer. It is
//! never global: derivations produce new runtimes with a replaced environment
//! (`local`), an extended cancellation query (parallel combinators), or
//! cancellation hard-wired off (bracket release).
//!
//! Cancellation is cooperative and monotonic. [`CancelToken::cancel`] sets a
//! flag; computations poll it at operator boundaries and exit without emitting
//! when it is set. Nothing is preempted.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::crash::{Crash, raise_last_resort, trap};

pub(crate) type CancelQuery = Arc<dyn Fn() -> bool + Send + Sync>;
pub(crate) type PanicSink = Arc<dyn Fn(Crash) + Send + Sync>;

// =============================================================================
// Cancel token
// =============================================================================

/// Shared cancellation flag returned by `run`.
///
/// Co-owned by the caller (to signal) and the runtime (to query). `cancel` is
/// idempotent, and the flag is monotonic: once set it stays set.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// A fresh, un-cancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Safe to call any number of times.
    pub fn cancel(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            tracing::trace!(target: "jerelo", "cancellation requested");
        }
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub(crate) fn query(&self) -> CancelQuery {
        let flag = Arc::clone(&self.flag);
        Arc::new(move || flag.load(Ordering::SeqCst))
    }
}

// =============================================================================
// Runtime
// =============================================================================

/// Per-run context: environment value, cancellation query, panic sink.
pub struct Runtime<E> {
    env: E,
    cancelled: CancelQuery,
    panic_sink: PanicSink,
}

impl<E: Clone> Clone for Runtime<E> {
    fn clone(&self) -> Self {
        Self {
            env: self.env.clone(),
            cancelled: Arc::clone(&self.cancelled),
            panic_sink: Arc::clone(&self.panic_sink),
        }
    }
}

impl<E> Runtime<E> {
    pub(crate) fn new(env: E, cancelled: CancelQuery, panic_sink: PanicSink) -> Self {
        Self {
            env,
            cancelled,
            panic_sink,
        }
    }

    /// The environment value this run observes.
    #[must_use]
    pub fn env(&self) -> &E {
        &self.env
    }

    /// Whether cancellation has been requested for this run.
    ///
    /// Monotonic: once true, stays true. Derived runtimes may extend the query
    /// with additional flags or hard-wire it off.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        (*self.cancelled)()
    }

    /// Route a crash to the panic sink.
    ///
    /// The sink handles failures in callbacks that were supposed to report an
    /// outcome; such failures never travel through the operator graph. A sink
    /// that itself panics is swallowed and re-raised out of band, so this
    /// method never unwinds into its caller.
    pub fn panic(&self, crash: Crash) {
        let sink = Arc::clone(&self.panic_sink);
        if let Err(second) = trap(move || (*sink)(crash)) {
            raise_last_resort(second);
        }
    }

    /// Derive a runtime with the environment replaced, keeping cancellation
    /// and the panic sink.
    pub(crate) fn with_env<E2>(&self, env: E2) -> Runtime<E2> {
        Runtime {
            env,
            cancelled: Arc::clone(&self.cancelled),
            panic_sink: Arc::clone(&self.panic_sink),
        }
    }
}

impl<E: Clone> Runtime<E> {
    /// Derive a runtime whose cancellation query is this runtime's flag OR an
    /// extra policy-local flag. Parallel combinators use this to stop losing
    /// siblings once the decisive outcome has arrived.
    pub(crate) fn extend_cancelled(
        &self,
        extra: impl Fn() -> bool + Send + Sync + 'static,
    ) -> Runtime<E> {
        let parent = Arc::clone(&self.cancelled);
        Runtime {
            env: self.env.clone(),
            cancelled: Arc::new(move || (*parent)() || extra()),
            panic_sink: Arc::clone(&self.panic_sink),
        }
    }

    /// Derive a runtime that never reports cancellation.
    ///
    /// Bracket acquire/release run under this view so a cancellation arriving
    /// mid-protocol cannot strand a live resource.
    pub(crate) fn uncancellable(&self) -> Runtime<E> {
        Runtime {
            env: self.env.clone(),
            cancelled: Arc::new(|| false),
            panic_sink: Arc::clone(&self.panic_sink),
        }
    }

    /// Derive a runtime with a replaced panic sink.
    pub(crate) fn with_panic_sink(&self, sink: PanicSink) -> Runtime<E> {
        Runtime {
            env: self.env.clone(),
            cancelled: Arc::clone(&self.cancelled),
            panic_sink: sink,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn plain_runtime<E>(env: E) -> (Runtime<E>, CancelToken) {
        let token = CancelToken::new();
        let rt = Runtime::new(env, token.query(), Arc::new(|_| {}));
        (rt, token)
    }

    // -- CancelToken -----------------------------------------------------------

    #[test]
    fn token_starts_uncancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn cancel_is_idempotent_and_monotonic() {
        let token = CancelToken::new();
        token.cancel();
        assert!(token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn clones_share_the_flag() {
        let token = CancelToken::new();
        let copy = token.clone();
        copy.cancel();
        assert!(token.is_cancelled());
    }

    // -- Runtime derivations ---------------------------------------------------

    #[test]
    fn runtime_reflects_token() {
        let (rt, token) = plain_runtime(());
        assert!(!rt.is_cancelled());
        token.cancel();
        assert!(rt.is_cancelled());
    }

    #[test]
    fn with_env_replaces_environment_only() {
        let (rt, token) = plain_runtime(1_u32);
        let derived = rt.with_env("hello");
        assert_eq!(*derived.env(), "hello");
        token.cancel();
        assert!(derived.is_cancelled());
    }

    #[test]
    fn extend_cancelled_combines_flags() {
        let (rt, parent) = plain_runtime(());
        let local = CancelToken::new();
        let derived = rt.extend_cancelled({
            let local = local.clone();
            move || local.is_cancelled()
        });

        assert!(!derived.is_cancelled());
        local.cancel();
        assert!(derived.is_cancelled());
        // The parent view is unaffected by the local flag.
        assert!(!rt.is_cancelled());

        parent.cancel();
        assert!(rt.is_cancelled());
    }

    #[test]
    fn uncancellable_ignores_parent_flag() {
        let (rt, token) = plain_runtime(());
        let release_view = rt.uncancellable();
        token.cancel();
        assert!(rt.is_cancelled());
        assert!(!release_view.is_cancelled());
    }

    // -- Panic sink ------------------------------------------------------------

    #[test]
    fn panic_routes_to_sink() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let token = CancelToken::new();
        let rt = Runtime::new(
            (),
            token.query(),
            Arc::new(move |crash: Crash| {
                sink_seen.lock().unwrap().push(crash.first_message().to_string());
            }),
        );

        rt.panic(Crash::message("callback failed"));
        assert_eq!(seen.lock().unwrap().as_slice(), ["callback failed"]);
    }

    #[test]
    fn raising_sink_does_not_unwind_into_caller() {
        let token = CancelToken::new();
        let rt = Runtime::new((), token.query(), Arc::new(|_| panic!("sink broke")));
        // Must not propagate the sink's panic.
        rt.panic(Crash::message("original"));
    }
}
