//! Two-tier heap store.
//!
//! Allocations land in a [`ThreadQueue`] owned by the allocating thread and
//! are moved into the [`GlobalStore`] on publish. The collector only ever
//! iterates the global store, under its lock; publishing blocks while the
//! collector holds it. Nothing moves from the global store back to a thread.

use parking_lot::{Mutex, MutexGuard};

/// Thread-owned allocation queue
#[derive(Debug)]
pub(crate) struct ThreadQueue<T> {
    items: Vec<T>,
}

impl<T> Default for ThreadQueue<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T> ThreadQueue<T> {
    #[inline]
    pub(crate) fn push(&mut self, item: T) {
        self.items.push(item);
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    /// Move everything into `global`. Publishing an empty queue is a no-op.
    pub(crate) fn publish(&mut self, global: &GlobalStore<T>) {
        if self.items.is_empty() {
            return;
        }
        global.items.lock().append(&mut self.items);
    }

    /// Publish unless the collector is iterating the global store.
    /// Returns false if items were left behind.
    pub(crate) fn try_publish(&mut self, global: &GlobalStore<T>) -> bool {
        if self.items.is_empty() {
            return true;
        }
        match global.items.try_lock() {
            Some(mut items) => {
                items.append(&mut self.items);
                true
            }
            None => false,
        }
    }

    pub(crate) fn drain(&mut self) -> std::vec::Drain<'_, T> {
        self.items.drain(..)
    }
}

/// Globally iterable store
#[derive(Debug)]
pub(crate) struct GlobalStore<T> {
    items: Mutex<Vec<T>>,
}

impl<T> Default for GlobalStore<T> {
    fn default() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }
}

impl<T> GlobalStore<T> {
    /// Lock the store for iteration; publishing blocks until the guard drops
    pub(crate) fn lock_for_iter(&self) -> MutexGuard<'_, Vec<T>> {
        self.items.lock()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_moves_items() {
        let global = GlobalStore::default();
        let mut queue = ThreadQueue::default();
        queue.push(1);
        queue.push(2);
        assert_eq!(global.len(), 0);

        queue.publish(&global);
        assert_eq!(queue.len(), 0);
        assert_eq!(*global.lock_for_iter(), vec![1, 2]);

        // Idempotent
        queue.publish(&global);
        assert_eq!(global.len(), 2);
    }

    #[test]
    fn test_publish_appends_in_order() {
        let global = GlobalStore::default();
        let mut a = ThreadQueue::default();
        let mut b = ThreadQueue::default();
        a.push("a");
        b.push("b");
        b.publish(&global);
        a.publish(&global);
        assert_eq!(*global.lock_for_iter(), vec!["b", "a"]);
    }

    #[test]
    fn test_try_publish_while_iterating() {
        let global = GlobalStore::default();
        let mut queue = ThreadQueue::default();
        queue.push(1);
        {
            let _iter = global.lock_for_iter();
            assert!(!queue.try_publish(&global));
            assert_eq!(queue.len(), 1);
        }
        assert!(queue.try_publish(&global));
        assert_eq!(global.len(), 1);
    }
}
