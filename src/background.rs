//! Background workers: flush-every-5s, compaction-on-trigger, and a
//! disk-space probe every minute, modeled as three independent periodic
//! tasks joined at a single shutdown point.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const DISK_PROBE_INTERVAL: Duration = Duration::from_secs(60);

/// Handle to the three background worker threads. Dropping without calling
/// [`Background::stop`] leaks the threads (they hold a `Weak`/closure back
/// into the store and exit once it's gone, but an explicit `close()` is
/// the documented shutdown path).
pub struct Background {
    running: Arc<AtomicBool>,
    compact_trigger: Arc<(Mutex<bool>, Condvar)>,
    handles: Vec<JoinHandle<()>>,
}

impl Background {
    /// Spawns the three workers. `flush`/`compact`/`disk_probe` are run on
    /// their respective schedules until [`Background::stop`] is called.
    pub fn start<F1, F2, F3>(flush: F1, compact: F2, disk_probe: F3) -> Self
    where
        F1: Fn() + Send + 'static,
        F2: Fn() + Send + 'static,
        F3: Fn() + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let compact_trigger = Arc::new((Mutex::new(false), Condvar::new()));

        let mut handles = Vec::with_capacity(3);

        handles.push({
            let running = running.clone();
            spawn_named("node-store-flush", move || {
                run_periodic(&running, FLUSH_INTERVAL, &flush);
            })
        });

        handles.push({
            let running = running.clone();
            let trigger = compact_trigger.clone();
            spawn_named("node-store-compact", move || {
                run_on_trigger(&running, &trigger, &compact);
            })
        });

        handles.push({
            let running = running.clone();
            spawn_named("node-store-disk-probe", move || {
                run_periodic(&running, DISK_PROBE_INTERVAL, &disk_probe);
            })
        });

        Self {
            running,
            compact_trigger,
            handles,
        }
    }

    /// Wakes the compaction worker immediately instead of waiting for its
    /// next poll interval. This is what `Store::gc()` calls.
    pub fn trigger_compact(&self) {
        let (lock, cvar) = &*self.compact_trigger;
        *lock.lock().expect("compact trigger mutex poisoned") = true;
        cvar.notify_one();
    }

    /// Stops all three workers and joins them.
    pub fn stop(self) {
        self.running.store(false, Ordering::SeqCst);
        self.trigger_compact();
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn spawn_named(name: &'static str, body: impl FnOnce() + Send + 'static) -> JoinHandle<()> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .expect("failed to spawn node-store background thread")
}

/// Calls `body` once, then sleeps in short increments up to `interval` so
/// [`Background::stop`] doesn't have to wait out a full period.
fn run_periodic(running: &AtomicBool, interval: Duration, body: &(impl Fn() + Send)) {
    const STEP: Duration = Duration::from_millis(100);
    while running.load(Ordering::SeqCst) {
        body();
        let mut waited = Duration::ZERO;
        while waited < interval {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            thread::sleep(STEP);
            waited += STEP;
        }
    }
}

fn run_on_trigger(running: &AtomicBool, trigger: &(Mutex<bool>, Condvar), body: &(impl Fn() + Send)) {
    let (lock, cvar) = trigger;
    while running.load(Ordering::SeqCst) {
        let mut guard = lock.lock().expect("compact trigger mutex poisoned");
        if !*guard {
            let (g, _timeout) = cvar
                .wait_timeout(guard, Duration::from_secs(5))
                .expect("compact trigger mutex poisoned");
            guard = g;
        }
        if !running.load(Ordering::SeqCst) {
            return;
        }
        if *guard {
            *guard = false;
            drop(guard);
            body();
        }
    }
}
