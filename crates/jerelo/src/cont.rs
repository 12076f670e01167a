//! The cold continuation value and its run surface.
//!
//! A [`Cont<E, F, A>`] describes how a result of type `A` may eventually be
//! produced under an environment `E`, possibly terminating instead with a
//! typed error `F` or crashing. Nothing executes at construction; a value may
//! be run any number of times, and every run is independent.
//!
//! # Usage
//!
//! ```rust,ignore
//! use jerelo::{Cont, RunCallbacks};
//!
//! let doubled = Cont::<(), &str, i32>::of(20)
//!     .then_map(|n| n + 1)
//!     .then_do(|n| Cont::of(n * 2));
//!
//! doubled.run((), RunCallbacks::new().on_then(|n| println!("got {n}")));
//! ```
//!
//! # Execution model
//!
//! Construction is descending: each operator wraps the run procedure of its
//! inner computation. Execution is ascending: running the outermost value
//! drives the innermost `from_run` body, whose emission climbs back up through
//! the wrapped observers. [`Cont::from_run`] is the single chokepoint that
//! enforces the runtime guarantees: entry cancellation guard, single-emission
//! observer, synchronous-panic trapping, and panic containment.

use std::sync::Arc;

use crate::crash::{Crash, raise_last_resort, trap};
use crate::observer::{Callback, Observer};
use crate::runtime::{CancelToken, Runtime};
use crate::value::Value;

type RunFn<E, F, A> = dyn Fn(&Runtime<E>, Observer<F, A>) + Send + Sync;

/// A cold, lazy, reusable computation delivering one of three outcomes.
pub struct Cont<E, F, A> {
    run_fn: Arc<RunFn<E, F, A>>,
}

impl<E, F, A> Clone for Cont<E, F, A> {
    fn clone(&self) -> Self {
        Self {
            run_fn: Arc::clone(&self.run_fn),
        }
    }
}

impl<E, F, A> Cont<E, F, A>
where
    E: Value,
    F: Value,
    A: Value,
{
    /// Wrap a raw run procedure into a computation.
    ///
    /// The wrapper enforces the runtime contract on every run:
    ///
    /// 1. if the runtime is already cancelled, return without emitting;
    /// 2. hand the body a single-emission observer that drops late and
    ///    cancelled emissions and routes raising callbacks to the panic sink;
    /// 3. trap a panic escaping the body itself and deliver it as a crash.
    ///
    /// Operators compose by calling `from_run`, never by stacking raw
    /// closures, so these guarantees hold at every level of a pipeline.
    pub fn from_run(run: impl Fn(&Runtime<E>, Observer<F, A>) + Send + Sync + 'static) -> Self {
        let run = Arc::new(run);
        Self {
            run_fn: Arc::new(move |rt: &Runtime<E>, obs: Observer<F, A>| {
                if rt.is_cancelled() {
                    tracing::trace!(target: "jerelo", "run skipped: already cancelled");
                    return;
                }
                let safe = obs.into_safe(rt);
                if let Err(crash) = trap(|| (*run)(rt, safe.clone())) {
                    safe.on_crash(crash);
                }
            }),
        }
    }

    pub(crate) fn run_raw(&self, rt: &Runtime<E>, obs: Observer<F, A>) {
        (self.run_fn)(rt, obs);
    }

    // -- leaf constructors -----------------------------------------------------

    /// Computation that emits `Then(value)`.
    pub fn of(value: A) -> Self {
        Self::from_run(move |_rt, obs| obs.on_then(value.clone()))
    }

    /// Computation that emits `Else(error)`.
    pub fn error(error: F) -> Self {
        Self::from_run(move |_rt, obs| obs.on_else(error.clone()))
    }

    /// Computation that emits `Crash(crash)`.
    pub fn crash(crash: Crash) -> Self {
        Self::from_run(move |_rt, obs| obs.on_crash(crash.clone()))
    }

    /// Defer production of the computation itself until run time.
    ///
    /// The thunk is evaluated on every run; a panic in it becomes a crash.
    pub fn from_deferred(thunk: impl Fn() -> Cont<E, F, A> + Send + Sync + 'static) -> Self {
        Self::from_run(move |rt, obs| match trap(&thunk) {
            Ok(inner) => inner.run_raw(rt, obs),
            Err(crash) => obs.on_crash(crash),
        })
    }

    // -- environment -----------------------------------------------------------

    /// Run under an environment derived from the outer one.
    pub fn local<E2>(self, map: impl Fn(&E2) -> E + Send + Sync + 'static) -> Cont<E2, F, A>
    where
        E2: Value,
    {
        Cont::from_run(move |rt: &Runtime<E2>, obs| {
            let inner_rt = rt.with_env(map(rt.env()));
            self.run_raw(&inner_rt, obs);
        })
    }

    /// Run under a fixed environment, erasing the requirement on the outer one.
    pub fn with_env<E2>(self, env: E) -> Cont<E2, F, A>
    where
        E2: Value,
    {
        self.local(move |_| env.clone())
    }

    // -- decoration ------------------------------------------------------------

    /// Expose the raw run step to a wrapping function.
    ///
    /// `wrap` receives the inner computation, the runtime, and the observer,
    /// and chooses when and how to invoke the run (possibly with an observer
    /// derived via the `with_on_*` methods). The type signature is preserved.
    pub fn decorate(
        self,
        wrap: impl Fn(Cont<E, F, A>, Runtime<E>, Observer<F, A>) + Send + Sync + 'static,
    ) -> Cont<E, F, A> {
        Cont::from_run(move |rt, obs| wrap(self.clone(), rt.clone(), obs))
    }

    // -- run surface -----------------------------------------------------------

    /// Run the computation under `env`, delivering the outcome to `callbacks`.
    ///
    /// Builds a fresh runtime and observer, invokes the computation, and
    /// returns the cancel token shared with the new run. Never raises:
    /// synchronous panics inside the computation surface on `on_crash`, and
    /// raising outcome callbacks are routed to `on_panic`.
    pub fn run(&self, env: E, callbacks: RunCallbacks<F, A>) -> CancelToken {
        let RunCallbacks {
            then_fn,
            else_fn,
            crash_fn,
            panic_fn,
        } = callbacks;
        let token = CancelToken::new();
        let rt = Runtime::new(env, token.query(), panic_fn);
        let obs = Observer::new(
            move |c| (*crash_fn)(c),
            move |f| (*else_fn)(f),
            move |a| (*then_fn)(a),
        );
        tracing::trace!(target: "jerelo", "run started");
        self.run_raw(&rt, obs);
        token
    }

    /// Fire and forget: run with every outcome dropped.
    pub fn ff(&self, env: E) -> CancelToken {
        self.run(env, RunCallbacks::new())
    }
}

impl<E, F> Cont<E, F, E>
where
    E: Value,
    F: Value,
{
    /// Computation that emits the environment on the then channel.
    pub fn ask_then() -> Self {
        Cont::from_run(|rt: &Runtime<E>, obs| obs.on_then(rt.env().clone()))
    }
}

impl<E, A> Cont<E, E, A>
where
    E: Value,
    A: Value,
{
    /// Computation that emits the environment on the else channel.
    pub fn ask_else() -> Self {
        Cont::from_run(|rt: &Runtime<E>, obs| obs.on_else(rt.env().clone()))
    }
}

// =============================================================================
// Run callbacks
// =============================================================================

/// Outcome callbacks installed by [`Cont::run`].
///
/// Defaults: `on_then` / `on_else` / `on_crash` drop their input; `on_panic`
/// re-raises out of band so a failure inside an outcome callback still
/// surfaces as an unhandled failure of the host process.
pub struct RunCallbacks<F, A> {
    pub(crate) then_fn: Callback<A>,
    pub(crate) else_fn: Callback<F>,
    pub(crate) crash_fn: Callback<Crash>,
    pub(crate) panic_fn: Callback<Crash>,
}

impl<F, A> Default for RunCallbacks<F, A>
where
    F: Send + 'static,
    A: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<F, A> RunCallbacks<F, A>
where
    F: Send + 'static,
    A: Send + 'static,
{
    /// All-default callbacks.
    #[must_use]
    pub fn new() -> Self {
        Self {
            then_fn: Arc::new(|_| {}),
            else_fn: Arc::new(|_| {}),
            crash_fn: Arc::new(|_| {}),
            panic_fn: Arc::new(raise_last_resort),
        }
    }

    /// Install the success callback.
    #[must_use]
    pub fn on_then(mut self, f: impl Fn(A) + Send + Sync + 'static) -> Self {
        self.then_fn = Arc::new(f);
        self
    }

    /// Install the typed-failure callback.
    #[must_use]
    pub fn on_else(mut self, f: impl Fn(F) + Send + Sync + 'static) -> Self {
        self.else_fn = Arc::new(f);
        self
    }

    /// Install the crash callback.
    #[must_use]
    pub fn on_crash(mut self, f: impl Fn(Crash) + Send + Sync + 'static) -> Self {
        self.crash_fn = Arc::new(f);
        self
    }

    /// Install the panic-sink callback.
    #[must_use]
    pub fn on_panic(mut self, f: impl Fn(Crash) + Send + Sync + 'static) -> Self {
        self.panic_fn = Arc::new(f);
        self
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recorded<F, A>() -> (Arc<Mutex<Vec<String>>>, RunCallbacks<F, A>)
    where
        F: std::fmt::Debug + Send + Sync + 'static,
        A: std::fmt::Debug + Send + Sync + 'static,
    {
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let l1 = Arc::clone(&log);
        let l2 = Arc::clone(&log);
        let l3 = Arc::clone(&log);
        let callbacks = RunCallbacks::new()
            .on_then(move |a: A| l1.lock().unwrap().push(format!("then:{a:?}")))
            .on_else(move |f: F| l2.lock().unwrap().push(format!("else:{f:?}")))
            .on_crash(move |c| l3.lock().unwrap().push(format!("crash:{}", c.first_message())));
        (log, callbacks)
    }

    // -- leaf constructors -----------------------------------------------------

    #[test]
    fn of_emits_then() {
        let (log, callbacks) = recorded::<&str, i32>();
        Cont::<(), &str, i32>::of(42).run((), callbacks);
        assert_eq!(log.lock().unwrap().as_slice(), ["then:42"]);
    }

    #[test]
    fn error_emits_else() {
        let (log, callbacks) = recorded::<&str, i32>();
        Cont::<(), &str, i32>::error("nf").run((), callbacks);
        assert_eq!(log.lock().unwrap().as_slice(), ["else:\"nf\""]);
    }

    #[test]
    fn crash_emits_crash() {
        let (log, callbacks) = recorded::<&str, i32>();
        Cont::<(), &str, i32>::crash(Crash::message("boom")).run((), callbacks);
        assert_eq!(log.lock().unwrap().as_slice(), ["crash:boom"]);
    }

    #[test]
    fn ask_then_reads_environment() {
        let (log, callbacks) = recorded::<&str, i32>();
        Cont::<i32, &str, i32>::ask_then().run(7, callbacks);
        assert_eq!(log.lock().unwrap().as_slice(), ["then:7"]);
    }

    #[test]
    fn ask_else_reads_environment() {
        let (log, callbacks) = recorded::<i32, i32>();
        Cont::<i32, i32, i32>::ask_else().run(9, callbacks);
        assert_eq!(log.lock().unwrap().as_slice(), ["else:9"]);
    }

    // -- from_run contract -----------------------------------------------------

    #[test]
    fn raising_run_body_becomes_a_crash() {
        let (log, callbacks) = recorded::<&str, i32>();
        Cont::<(), &str, i32>::from_run(|_rt, _obs| panic!("body broke")).run((), callbacks);
        assert_eq!(log.lock().unwrap().as_slice(), ["crash:body broke"]);
    }

    #[test]
    fn run_body_emission_wins_over_later_panic() {
        // The body emits and then panics; the emission already settled the
        // observer, so the trapped panic is dropped by the done flag.
        let (log, callbacks) = recorded::<&str, i32>();
        Cont::<(), &str, i32>::from_run(|_rt, obs| {
            obs.on_then(1);
            panic!("after emit");
        })
        .run((), callbacks);
        assert_eq!(log.lock().unwrap().as_slice(), ["then:1"]);
    }

    #[test]
    fn construction_is_cold() {
        let count = Arc::new(AtomicUsize::new(0));
        let effect = Arc::clone(&count);
        let cont = Cont::<(), &str, i32>::from_deferred(move || {
            effect.fetch_add(1, Ordering::SeqCst);
            Cont::of(1)
        });
        assert_eq!(count.load(Ordering::SeqCst), 0);
        cont.ff(());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn runs_are_independent() {
        let count = Arc::new(AtomicUsize::new(0));
        let effect = Arc::clone(&count);
        let cont = Cont::<(), &str, i32>::from_run(move |_rt, obs| {
            let n = effect.fetch_add(1, Ordering::SeqCst);
            obs.on_then(i32::try_from(n).unwrap_or(i32::MAX));
        });

        let (log, callbacks) = recorded::<&str, i32>();
        cont.run((), callbacks);
        let (log2, callbacks2) = recorded::<&str, i32>();
        cont.run((), callbacks2);

        assert_eq!(log.lock().unwrap().as_slice(), ["then:0"]);
        assert_eq!(log2.lock().unwrap().as_slice(), ["then:1"]);
    }

    #[test]
    fn from_deferred_panic_becomes_crash() {
        let (log, callbacks) = recorded::<&str, i32>();
        Cont::<(), &str, i32>::from_deferred(|| panic!("thunk broke")).run((), callbacks);
        assert_eq!(log.lock().unwrap().as_slice(), ["crash:thunk broke"]);
    }

    // -- cancellation ----------------------------------------------------------

    #[test]
    fn cancel_before_emission_is_silent() {
        let slot: Arc<Mutex<Option<Observer<&'static str, i32>>>> = Arc::new(Mutex::new(None));
        let capture = Arc::clone(&slot);
        let cont = Cont::<(), &str, i32>::from_run(move |_rt, obs| {
            *capture.lock().unwrap() = Some(obs);
        });

        let (log, callbacks) = recorded::<&str, i32>();
        let token = cont.run((), callbacks);
        token.cancel();
        token.cancel(); // idempotent

        let obs = slot.lock().unwrap().take().expect("observer captured");
        obs.on_then(42);
        assert!(log.lock().unwrap().is_empty());
    }

    // -- environment -----------------------------------------------------------

    #[test]
    fn local_replaces_environment() {
        let (log, callbacks) = recorded::<&str, i32>();
        Cont::<i32, &str, i32>::ask_then()
            .local(|outer: &String| i32::try_from(outer.len()).unwrap_or(i32::MAX))
            .run("seven!!".to_string(), callbacks);
        assert_eq!(log.lock().unwrap().as_slice(), ["then:7"]);
    }

    #[test]
    fn with_env_pins_environment() {
        let (log, callbacks) = recorded::<&str, i32>();
        Cont::<i32, &str, i32>::ask_then()
            .with_env::<()>(13)
            .run((), callbacks);
        assert_eq!(log.lock().unwrap().as_slice(), ["then:13"]);
    }

    // -- decorate --------------------------------------------------------------

    #[test]
    fn decorate_controls_invocation() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&invocations);
        let (log, callbacks) = recorded::<&str, i32>();
        Cont::<(), &str, i32>::of(5)
            .decorate(move |inner, rt, obs| {
                seen.fetch_add(1, Ordering::SeqCst);
                inner.run_raw(&rt, obs);
            })
            .run((), callbacks);
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert_eq!(log.lock().unwrap().as_slice(), ["then:5"]);
    }

    #[test]
    fn decorate_can_rewrite_the_observer() {
        let (log, callbacks) = recorded::<&str, i32>();
        Cont::<(), &str, i32>::of(5)
            .decorate(|inner, rt, obs| {
                let target = obs.clone();
                inner.run_raw(&rt, obs.with_on_then(move |n: i32| target.on_then(n * 10)));
            })
            .run((), callbacks);
        assert_eq!(log.lock().unwrap().as_slice(), ["then:50"]);
    }

    // -- ff --------------------------------------------------------------------

    #[test]
    fn ff_runs_and_drops_outcomes() {
        let count = Arc::new(AtomicUsize::new(0));
        let effect = Arc::clone(&count);
        let cont = Cont::<(), &str, i32>::from_run(move |_rt, obs| {
            effect.fetch_add(1, Ordering::SeqCst);
            obs.on_then(1);
        });
        cont.ff(());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
