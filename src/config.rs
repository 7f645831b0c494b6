//! Config persistence and the auto-sync scheduler (spec §4.F).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::CoreResult;
use crate::model::SyncConfig;
use crate::store::Store;

/// Thin wrapper over [`Store`]'s `metadata.sync_config` accessors. Exists
/// as its own module so callers don't need to reach into `store` for
/// config reads/writes, mirroring the facade split already used for
/// [`crate::queue::Queue`] over [`Store`].
pub struct ConfigStore<'s> {
    store: &'s mut Store,
}

impl<'s> ConfigStore<'s> {
    pub fn new(store: &'s mut Store) -> Self {
        ConfigStore { store }
    }

    pub fn get(&self) -> CoreResult<SyncConfig> {
        self.store.get_sync_config()
    }

    /// Persists `config` atomically (spec §4.F). Callers that also run a
    /// [`Scheduler`] are responsible for restarting it afterward if
    /// `auto_sync`/`auto_sync_interval_minutes` changed — the store layer
    /// has no handle to a running scheduler.
    pub fn set(&mut self, config: &SyncConfig) -> CoreResult<()> {
        self.store.set_sync_config(config)
    }
}

/// A single periodic timer that fires `callback()` every
/// `interval_minutes` while running, coalescing overlapping ticks
/// instead of queuing them (spec §4.F) — the synchronous analogue of a
/// `tokio::select!` between a sleep and a trigger channel, since this
/// crate carries no async runtime (spec §9 "Coroutine control flow").
pub struct Scheduler {
    handle: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl Scheduler {
    /// Spawns the timer thread immediately. `callback` must be cheap to
    /// clone (it's called from a background thread) and `Send + 'static`.
    pub fn start<F>(interval_minutes: u32, callback: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_thread = Arc::clone(&stop);
        let running = Arc::new(AtomicBool::new(false));
        let period = Duration::from_secs(u64::from(interval_minutes) * 60);
        // Poll for the stop flag in small slices so `stop()` doesn't have
        // to wait out a full interval to cancel the pending tick.
        let poll_slice = Duration::from_millis(50).min(period);

        let handle = thread::spawn(move || {
            let mut elapsed = Duration::ZERO;
            while !stop_for_thread.load(Ordering::SeqCst) {
                thread::sleep(poll_slice);
                if stop_for_thread.load(Ordering::SeqCst) {
                    break;
                }
                elapsed += poll_slice;
                if elapsed < period {
                    continue;
                }
                elapsed = Duration::ZERO;
                // Coalesce: skip this tick entirely if the previous one
                // hasn't finished yet, rather than queuing it.
                if running.swap(true, Ordering::SeqCst) {
                    continue;
                }
                callback();
                running.store(false, Ordering::SeqCst);
            }
        });

        Scheduler {
            handle: Some(handle),
            stop,
        }
    }

    /// Cancels the pending tick and joins the timer thread (spec §5
    /// "Scheduler shutdown cancels the pending tick").
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Guards re-entrant callback execution for callers that drive their own
/// timer loop instead of [`Scheduler`] (e.g. an outer shell with its own
/// event loop) but still need the coalesce-not-queue semantics.
#[derive(Default)]
pub struct TickGuard {
    running: Mutex<bool>,
}

impl TickGuard {
    pub fn new() -> Self {
        TickGuard::default()
    }

    /// Runs `f` unless a previous call is still in flight, in which case
    /// this tick is skipped and `false` is returned.
    pub fn try_run(&self, f: impl FnOnce()) -> bool {
        {
            let mut running = self.running.lock().unwrap();
            if *running {
                return false;
            }
            *running = true;
        }
        f();
        *self.running.lock().unwrap() = false;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn config_round_trips_through_store() {
        let mut store = Store::open_in_memory().unwrap();
        let mut cfg = SyncConfig::default();
        cfg.auto_sync = true;
        cfg.max_retries = 5;
        {
            let mut config = ConfigStore::new(&mut store);
            config.set(&cfg).unwrap();
        }
        let config = ConfigStore::new(&mut store);
        assert_eq!(config.get().unwrap(), cfg);
    }

    #[test]
    fn tick_guard_skips_overlapping_runs() {
        let guard = TickGuard::new();
        let count = Arc::new(AtomicUsize::new(0));

        // A tick that re-enters the same guard while "still running" must
        // be coalesced (skipped), not queued (spec §4.F).
        let first = guard.try_run(|| {
            count.fetch_add(1, Ordering::SeqCst);
            let reentered = guard.try_run(|| {
                count.fetch_add(1, Ordering::SeqCst);
            });
            assert!(!reentered, "overlapping tick must be coalesced, not run");
        });
        assert!(first);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn scheduler_stops_cleanly_without_panicking() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let scheduler = Scheduler::start(60, move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.stop();
    }
}
