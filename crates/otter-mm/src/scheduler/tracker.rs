//! Safepoint site tracking for the aggressive scheduler

use std::panic::Location;

use rustc_hash::FxHashSet;

/// Default number of sites remembered before the tracker starts over
pub const DEFAULT_MAX_SITES: usize = 10_000;

/// Set of safepoint sites already seen
#[derive(Debug)]
pub struct SafePointTracker {
    seen: FxHashSet<&'static Location<'static>>,
    max_size: usize,
}

impl Default for SafePointTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SITES)
    }
}

impl SafePointTracker {
    /// Tracker remembering at most `max_size` sites
    pub fn new(max_size: usize) -> Self {
        Self {
            seen: FxHashSet::default(),
            max_size: max_size.max(1),
        }
    }

    /// Record `site`; true if it was not seen before
    pub fn register_safe_point(&mut self, site: &'static Location<'static>) -> bool {
        if self.seen.contains(site) {
            return false;
        }
        if self.seen.len() >= self.max_size {
            self.seen.clear();
        }
        self.seen.insert(site);
        true
    }

    /// Sites currently remembered
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Nothing remembered
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[track_caller]
    fn site() -> &'static Location<'static> {
        Location::caller()
    }

    #[test]
    fn test_new_sites_only() {
        let mut tracker = SafePointTracker::default();
        let mut sites = Vec::new();
        for _ in 0..3 {
            sites.push(site());
        }
        let other = site();

        assert!(tracker.register_safe_point(sites[0]));
        assert!(!tracker.register_safe_point(sites[1]));
        assert!(!tracker.register_safe_point(sites[2]));
        assert!(tracker.register_safe_point(other));
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn test_bounded() {
        let mut tracker = SafePointTracker::new(2);
        let a = site();
        let b = site();
        let c = site();
        assert!(tracker.register_safe_point(a));
        assert!(tracker.register_safe_point(b));
        assert!(tracker.register_safe_point(c));
        assert_eq!(tracker.len(), 1);
        assert!(tracker.register_safe_point(a));
    }
}
