//! Regular interval pacing for the adaptive scheduler

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Remembers when the last collection ran
#[derive(Debug)]
pub struct RegularIntervalPacer {
    interval: Duration,
    last_gc: Mutex<Instant>,
}

impl RegularIntervalPacer {
    /// Pacer with the given interval, counting from now
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_gc: Mutex::new(Instant::now()),
        }
    }

    /// A collection just ran
    pub fn on_perform_full_gc(&self) {
        *self.last_gc.lock() = Instant::now();
    }

    /// Has a full interval passed since the last collection
    pub fn needs_gc(&self) -> bool {
        self.needs_gc_at(Instant::now())
    }

    fn needs_gc_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(*self.last_gc.lock()) >= self.interval
    }
}

#[derive(Debug, Default)]
struct TimerState {
    stop: bool,
    generation: u64,
}

#[derive(Debug, Default)]
struct TimerShared {
    state: Mutex<TimerState>,
    cond: Condvar,
}

/// Background thread calling a callback every `interval`
#[derive(Debug)]
pub struct RepeatedTimer {
    shared: Arc<TimerShared>,
    handle: Option<JoinHandle<()>>,
}

impl RepeatedTimer {
    /// Start the timer thread
    pub fn new(
        name: &str,
        interval: Duration,
        callback: impl Fn() + Send + 'static,
    ) -> Self {
        let shared = Arc::new(TimerShared::default());
        let thread_shared = shared.clone();
        let spawned = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || timer_loop(&thread_shared, interval, callback));
        let handle = match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::error!(target: "otter::gc", "failed to start {name}: {e}");
                None
            }
        };
        Self { shared, handle }
    }

    /// Start the current interval over
    pub fn restart(&self) {
        self.shared.state.lock().generation += 1;
        self.shared.cond.notify_all();
    }
}

impl Drop for RepeatedTimer {
    fn drop(&mut self) {
        self.shared.state.lock().stop = true;
        self.shared.cond.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!(target: "otter::gc", "GC timer thread panicked");
            }
        }
    }
}

fn timer_loop(shared: &TimerShared, interval: Duration, callback: impl Fn()) {
    let mut state = shared.state.lock();
    loop {
        let generation = state.generation;
        let deadline = Instant::now() + interval;
        let result = shared.cond.wait_while_until(
            &mut state,
            |s| !s.stop && s.generation == generation,
            deadline,
        );
        if state.stop {
            return;
        }
        if result.timed_out() {
            drop(state);
            callback();
            state = shared.state.lock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_pacer() {
        let pacer = RegularIntervalPacer::new(Duration::from_secs(10));
        assert!(!pacer.needs_gc());
        assert!(pacer.needs_gc_at(Instant::now() + Duration::from_secs(11)));
        pacer.on_perform_full_gc();
        assert!(!pacer.needs_gc_at(Instant::now() + Duration::from_secs(5)));
    }

    #[test]
    fn test_timer_fires_repeatedly() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let timer = RepeatedTimer::new("test-timer", Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let deadline = Instant::now() + Duration::from_secs(10);
        while fired.load(Ordering::SeqCst) < 3 {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }
        drop(timer);
        let after_drop = fired.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(fired.load(Ordering::SeqCst), after_drop);
    }

    #[test]
    fn test_drop_survives_panicking_callback() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let timer = RepeatedTimer::new("test-timer", Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            panic!("callback failed");
        });
        let deadline = Instant::now() + Duration::from_secs(10);
        while fired.load(Ordering::SeqCst) == 0 {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }
        drop(timer);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_restart_postpones() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let timer = RepeatedTimer::new("test-timer", Duration::from_secs(3600), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        timer.restart();
        timer.restart();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
