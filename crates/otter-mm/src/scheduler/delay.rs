//! Collection start gate
//!
//! Mutators can briefly hold off the start of a collection with
//! [`GcDelay::disallow_gc`]. The collector waits for the gate with a bounded
//! timeout and starts anyway once it expires. A gated mutator that runs into
//! an assist request claims the epoch with [`GcDelay::try_gc_assist`]; the
//! claim fails while the collector is already waiting on that same epoch,
//! because parking the mutator then would leave both sides waiting on each
//! other.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::gc_state::Epoch;

#[derive(Debug, Default)]
struct State {
    disallow_counter: u64,
    last_assist_epoch: Epoch,
    last_gc_waiting_epoch: Epoch,
    last_gc_allowed_epoch: Epoch,
}

/// Reference-counted gate in front of collection start
#[derive(Debug, Default)]
pub struct GcDelay {
    state: Mutex<State>,
    cond: Condvar,
}

impl GcDelay {
    /// Gate collections until a matching `allow_gc`
    pub fn disallow_gc(&self) {
        self.state.lock().disallow_counter += 1;
    }

    /// Release one `disallow_gc`
    ///
    /// # Panics
    /// If the gate is not held.
    pub fn allow_gc(&self) {
        let mut state = self.state.lock();
        assert!(state.disallow_counter > 0, "allow_gc without disallow_gc");
        state.disallow_counter -= 1;
        if state.disallow_counter == 0 {
            self.cond.notify_all();
        }
    }

    /// Is the gate held
    pub fn is_gc_disallowed(&self) -> bool {
        self.state.lock().disallow_counter > 0
    }

    /// Collector side: wait up to `max_duration` for the gate to open.
    ///
    /// Returns immediately if the gate is open or a mutator already claimed
    /// `epoch` for assisting. Returns false if the wait timed out.
    pub fn wait_gc_allowed(&self, epoch: Epoch, max_duration: Duration) -> bool {
        let mut state = self.state.lock();
        if state.disallow_counter == 0 || state.last_assist_epoch >= epoch {
            state.last_gc_allowed_epoch = epoch;
            return true;
        }
        state.last_gc_waiting_epoch = epoch;
        let timed_out = self
            .cond
            .wait_while_for(
                &mut state,
                |s| s.disallow_counter > 0 && s.last_assist_epoch < epoch,
                max_duration,
            )
            .timed_out();
        state.last_gc_allowed_epoch = epoch;
        if timed_out {
            tracing::warn!(
                target: "otter::gc",
                epoch,
                max_delay_us = max_duration.as_micros() as u64,
                "GC delay timed out, starting the collection anyway"
            );
        }
        !timed_out
    }

    /// Mutator side: claim `epoch` for assisting. Fails while the collector
    /// is waiting on the gate for that same epoch.
    pub fn try_gc_assist(&self, epoch: Epoch) -> bool {
        let mut state = self.state.lock();
        if state.last_gc_waiting_epoch == epoch && state.last_gc_allowed_epoch != epoch {
            return false;
        }
        if epoch > state.last_assist_epoch {
            state.last_assist_epoch = epoch;
        }
        self.cond.notify_all();
        true
    }
}

/// Holds the gate closed until dropped
#[derive(Debug)]
#[must_use = "the gate opens again when the guard is dropped"]
pub struct GcDelayGuard<'a> {
    delay: &'a GcDelay,
}

impl<'a> GcDelayGuard<'a> {
    pub(crate) fn new(delay: &'a GcDelay) -> Self {
        delay.disallow_gc();
        Self { delay }
    }
}

impl Drop for GcDelayGuard<'_> {
    fn drop(&mut self) {
        self.delay.allow_gc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_open_gate_does_not_wait() {
        let delay = GcDelay::default();
        assert!(delay.wait_gc_allowed(1, Duration::from_secs(60)));
    }

    #[test]
    fn test_wait_times_out() {
        let delay = GcDelay::default();
        delay.disallow_gc();
        assert!(!delay.wait_gc_allowed(1, Duration::from_millis(10)));
        delay.allow_gc();
    }

    #[test]
    fn test_allow_wakes_collector() {
        let delay = Arc::new(GcDelay::default());
        delay.disallow_gc();
        let collector = {
            let delay = delay.clone();
            std::thread::spawn(move || delay.wait_gc_allowed(1, Duration::from_secs(60)))
        };
        std::thread::sleep(Duration::from_millis(10));
        delay.allow_gc();
        assert!(collector.join().unwrap());
    }

    #[test]
    fn test_assist_claim_releases_collector() {
        let delay = GcDelay::default();
        delay.disallow_gc();
        assert!(delay.try_gc_assist(2));
        // The epoch was claimed before the collector got there
        assert!(delay.wait_gc_allowed(2, Duration::from_secs(60)));
        delay.allow_gc();
    }

    #[test]
    fn test_assist_refused_while_collector_waits() {
        let delay = Arc::new(GcDelay::default());
        let guard = GcDelayGuard::new(&delay);
        assert!(!delay.wait_gc_allowed(3, Duration::from_millis(1)));
        drop(guard);

        // After the timed-out wait the epoch counts as allowed again
        assert!(delay.try_gc_assist(3));

        // Simulate the collector being mid-wait on epoch 4
        delay.state.lock().last_gc_waiting_epoch = 4;
        assert!(!delay.try_gc_assist(4));
        assert!(delay.try_gc_assist(5));
        assert!(!delay.is_gc_disallowed());
    }
}
