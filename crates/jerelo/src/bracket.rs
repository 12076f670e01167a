//! Acquire–use–release with guaranteed release.
//!
//! [`Bracket`] builds a computation that acquires a resource, runs a
//! dependent computation against it, and releases the resource regardless of
//! how that computation ended. Acquire and release have an uninhabited else
//! channel: they may only succeed or crash.
//!
//! Acquire and release run under a non-cancellable view of the runtime. A
//! cancellation that lands while acquire is in flight therefore cannot strand
//! the resource: acquire's emission still reaches the bracket, the
//! cancellation checkpoint between acquire and use skips the dependent
//! computation, and release runs anyway. Outcomes are combined per the
//! protocol table: a release crash replaces a success or typed error, a use
//! crash survives a clean release, and a double crash merges use-first.

use std::sync::Arc;

use crate::cont::Cont;
use crate::crash::{Crash, trap};
use crate::never::Never;
use crate::observer::Observer;
use crate::outcome::Outcome;
use crate::value::Value;

type UseFn<E, F, R, A> = Arc<dyn Fn(R) -> Cont<E, F, A> + Send + Sync>;
type ReleaseFn<E, R> = Arc<dyn Fn(R) -> Cont<E, Never, ()> + Send + Sync>;

/// Builder for the acquire–use–release protocol.
///
/// ```rust,ignore
/// let guarded = Bracket::new(
///     open_handle(),
///     |handle| read_all(handle),
///     |handle| close_handle(handle),
/// )
/// .on_release_crash(|crash| tracing::warn!(%crash, "close failed"))
/// .build();
/// ```
pub struct Bracket<E, F, R, A> {
    acquire: Cont<E, Never, R>,
    use_fn: UseFn<E, F, R, A>,
    release: ReleaseFn<E, R>,
    on_release_then: Arc<dyn Fn() + Send + Sync>,
    on_release_crash: Arc<dyn Fn(&Crash) + Send + Sync>,
    release_panic: Option<Arc<dyn Fn(Crash) + Send + Sync>>,
}

impl<E, F, R, A> Bracket<E, F, R, A>
where
    E: Value,
    F: Value,
    R: Value,
    A: Value,
{
    /// Bracket from the three protocol parts.
    pub fn new(
        acquire: Cont<E, Never, R>,
        use_fn: impl Fn(R) -> Cont<E, F, A> + Send + Sync + 'static,
        release: impl Fn(R) -> Cont<E, Never, ()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            acquire,
            use_fn: Arc::new(use_fn),
            release: Arc::new(release),
            on_release_then: Arc::new(|| {}),
            on_release_crash: Arc::new(|_| {}),
            release_panic: None,
        }
    }

    /// Observe a successful release out of band.
    #[must_use]
    pub fn on_release_then(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_release_then = Arc::new(f);
        self
    }

    /// Observe a crashing release out of band. The crash still participates
    /// in the combined outcome.
    #[must_use]
    pub fn on_release_crash(mut self, f: impl Fn(&Crash) + Send + Sync + 'static) -> Self {
        self.on_release_crash = Arc::new(f);
        self
    }

    /// Replace the panic sink used while release runs. Defaults to the
    /// parent runtime's sink, which re-raises.
    #[must_use]
    pub fn on_release_panic(mut self, f: impl Fn(Crash) + Send + Sync + 'static) -> Self {
        self.release_panic = Some(Arc::new(f));
        self
    }

    /// Build the bracketed computation.
    pub fn build(self) -> Cont<E, F, A> {
        let Self {
            acquire,
            use_fn,
            release,
            on_release_then,
            on_release_crash,
            release_panic,
        } = self;
        Cont::from_run(move |rt, obs: Observer<F, A>| {
            let outer_rt = rt.clone();
            let use_fn = Arc::clone(&use_fn);
            let release = Arc::clone(&release);
            let on_release_then = Arc::clone(&on_release_then);
            let on_release_crash = Arc::clone(&on_release_crash);
            let release_panic = release_panic.clone();
            let obs_crash = obs.clone();

            // The release step, shared by every exit path past acquire.
            let run_release: Arc<dyn Fn(R, Option<Outcome<F, A>>) + Send + Sync> = {
                let rt = rt.clone();
                let obs = obs.clone();
                Arc::new(move |resource: R, use_outcome: Option<Outcome<F, A>>| {
                    let release_rt = match &release_panic {
                        Some(sink) => rt.uncancellable().with_panic_sink(Arc::clone(sink)),
                        None => rt.uncancellable(),
                    };
                    let finish = {
                        let obs = obs.clone();
                        Arc::new(move |release_crash: Option<Crash>| {
                            settle(&obs, use_outcome.clone(), release_crash);
                        })
                    };
                    match trap(|| (*release)(resource)) {
                        Ok(releasing) => {
                            let finish_ok = Arc::clone(&finish);
                            let finish_err = Arc::clone(&finish);
                            let notify_then = Arc::clone(&on_release_then);
                            let notify_crash = Arc::clone(&on_release_crash);
                            let crash_rt = release_rt.clone();
                            let then_rt = release_rt.clone();
                            releasing.run_raw(
                                &release_rt,
                                Observer::new(
                                    move |crash: Crash| {
                                        if let Err(second) = trap(|| (*notify_crash)(&crash)) {
                                            crash_rt.panic(second);
                                        }
                                        (*finish_err)(Some(crash));
                                    },
                                    |never: Never| match never {},
                                    move |()| {
                                        if let Err(second) = trap(|| (*notify_then)()) {
                                            // Reported out of band; the release
                                            // itself still succeeded.
                                            then_rt.panic(second);
                                        }
                                        (*finish_ok)(None);
                                    },
                                ),
                            );
                        }
                        Err(crash) => {
                            if let Err(second) = trap(|| (*on_release_crash)(&crash)) {
                                release_rt.panic(second);
                            }
                            (*finish)(Some(crash));
                        }
                    }
                })
            };

            let acquire_rt = rt.uncancellable();
            let use_rt = rt.clone();
            let on_acquired = {
                let run_release = Arc::clone(&run_release);
                move |resource: R| {
                    // Cancellation checkpoint: a request that landed during
                    // acquire skips use but still releases.
                    if outer_rt.is_cancelled() {
                        (*run_release)(resource, None);
                        return;
                    }
                    let held = resource.clone();
                    match trap(|| (*use_fn)(resource)) {
                        Ok(using) => {
                            let r1 = Arc::clone(&run_release);
                            let r2 = Arc::clone(&run_release);
                            let r3 = Arc::clone(&run_release);
                            let h1 = held.clone();
                            let h2 = held.clone();
                            using.run_raw(
                                &use_rt,
                                Observer::new(
                                    move |crash: Crash| {
                                        (*r1)(h1.clone(), Some(Outcome::Crash(crash)));
                                    },
                                    move |error: F| (*r2)(h2.clone(), Some(Outcome::Else(error))),
                                    move |value: A| {
                                        (*r3)(held.clone(), Some(Outcome::Then(value)));
                                    },
                                ),
                            );
                        }
                        Err(crash) => (*run_release)(held, Some(Outcome::Crash(crash))),
                    }
                }
            };

            acquire.run_raw(
                &acquire_rt,
                Observer::new(
                    // Acquire crashed: no resource exists, nothing to release.
                    move |crash: Crash| obs_crash.on_crash(crash),
                    |never: Never| match never {},
                    on_acquired,
                ),
            );
        })
    }
}

/// Combine the use and release outcomes per the protocol table.
fn settle<F: Value, A: Value>(
    obs: &Observer<F, A>,
    use_outcome: Option<Outcome<F, A>>,
    release_crash: Option<Crash>,
) {
    match (use_outcome, release_crash) {
        // Use was skipped by the cancellation checkpoint: nothing to report.
        (None, _) => {}
        (Some(Outcome::Then(value)), None) => obs.on_then(value),
        (Some(Outcome::Else(error)), None) => obs.on_else(error),
        (Some(Outcome::Crash(crash)), None) => obs.on_crash(crash),
        // Release crash replaces a success or a typed error.
        (Some(Outcome::Then(_)), Some(crash)) => obs.on_crash(crash),
        (Some(Outcome::Else(_)), Some(crash)) => obs.on_crash(crash),
        // Double crash merges use-first.
        (Some(Outcome::Crash(use_crash)), Some(release_crash)) => {
            obs.on_crash(Crash::merged(use_crash, release_crash));
        }
    }
}

impl<E, F, A> Cont<E, F, A>
where
    E: Value,
    F: Value,
    A: Value,
{
    /// Entry point for the bracket protocol; finish with [`Bracket::build`].
    pub fn bracket<R>(
        acquire: Cont<E, Never, R>,
        use_fn: impl Fn(R) -> Cont<E, F, A> + Send + Sync + 'static,
        release: impl Fn(R) -> Cont<E, Never, ()> + Send + Sync + 'static,
    ) -> Bracket<E, F, R, A>
    where
        R: Value,
    {
        Bracket::new(acquire, use_fn, release)
    }
}

// =============================================================================
// Tests
// =============================================================================
