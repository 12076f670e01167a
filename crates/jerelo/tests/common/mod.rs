//! Shared helpers for the integration suites.
//!
//! `Recorder` captures every outcome a run delivers, and `deferred` builds a
//! computation that parks its observer so the test decides when (and on which
//! channel) it settles. Asynchrony is simulated deterministically: no sleeps,
//! no timers, no flakes.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, Once};

use jerelo::{Cont, Crash, Observer, RunCallbacks, Runtime, Value};

/// Install a log subscriber once; silent unless `RUST_LOG=jerelo=trace`.
fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

// =============================================================================
// Recorder
// =============================================================================

/// Captures delivered outcomes as readable strings, in delivery order.
#[derive(Clone, Default)]
pub struct Recorder {
    log: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn new() -> Self {
        init_tracing();
        Self::default()
    }

    /// Callbacks that append every channel delivery (including panics) here.
    pub fn callbacks<F, A>(&self) -> RunCallbacks<F, A>
    where
        F: std::fmt::Debug + Value,
        A: std::fmt::Debug + Value,
    {
        let l1 = Arc::clone(&self.log);
        let l2 = Arc::clone(&self.log);
        let l3 = Arc::clone(&self.log);
        let l4 = Arc::clone(&self.log);
        RunCallbacks::new()
            .on_then(move |a: A| l1.lock().unwrap().push(format!("then:{a:?}")))
            .on_else(move |f: F| l2.lock().unwrap().push(format!("else:{f:?}")))
            .on_crash(move |c| l3.lock().unwrap().push(format!("crash:{}", c.first_message())))
            .on_panic(move |c| l4.lock().unwrap().push(format!("panic:{}", c.first_message())))
    }

    pub fn entries(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.log.lock().unwrap().len()
    }
}

// =============================================================================
// Deferred computations
// =============================================================================

type Parked<E, F, A> = Arc<Mutex<Option<(Runtime<E>, Observer<F, A>)>>>;

/// Handle to a parked run of a [`deferred`] computation.
pub struct Trigger<E, F, A> {
    slot: Parked<E, F, A>,
}

impl<E, F, A> Trigger<E, F, A>
where
    E: Value,
    F: Value,
    A: Value,
{
    /// Whether the computation has been started (and not yet fired).
    pub fn was_started(&self) -> bool {
        self.slot.lock().unwrap().is_some()
    }

    /// Whether the parked run observes cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.slot
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|(rt, _)| rt.is_cancelled())
    }

    fn parked(&self) -> Option<(Runtime<E>, Observer<F, A>)> {
        self.slot
            .lock()
            .unwrap()
            .as_ref()
            .map(|(rt, obs)| (rt.clone(), obs.clone()))
    }

    /// Settle the parked run on the then channel. Returns false if the
    /// computation was never started.
    pub fn fire_then(&self, value: A) -> bool {
        match self.parked() {
            Some((_rt, obs)) => {
                obs.on_then(value);
                true
            }
            None => false,
        }
    }

    /// Settle the parked run on the else channel.
    pub fn fire_else(&self, error: F) -> bool {
        match self.parked() {
            Some((_rt, obs)) => {
                obs.on_else(error);
                true
            }
            None => false,
        }
    }

    /// Settle the parked run on the crash channel.
    pub fn fire_crash(&self, crash: Crash) -> bool {
        match self.parked() {
            Some((_rt, obs)) => {
                obs.on_crash(crash);
                true
            }
            None => false,
        }
    }
}

/// A computation that parks its observer for the test to settle later.
///
/// Each run overwrites the parked pair, so a `deferred` computation is meant
/// for one in-flight run at a time.
pub fn deferred<E, F, A>() -> (Cont<E, F, A>, Trigger<E, F, A>)
where
    E: Value,
    F: Value,
    A: Value,
{
    let slot: Parked<E, F, A> = Arc::new(Mutex::new(None));
    let capture = Arc::clone(&slot);
    let cont = Cont::from_run(move |rt, obs| {
        *capture.lock().unwrap() = Some((rt.clone(), obs));
    });
    (cont, Trigger { slot })
}
