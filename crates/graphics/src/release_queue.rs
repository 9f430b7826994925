use std::collections::VecDeque;

/// An object, or a closure, whose release waits on a fence value.
pub struct Deferred {
    fence_value: u64,
    release: Box<dyn FnOnce() + Send>,
}

impl Deferred {
    /// Defers dropping `object` until the fence reaches `fence_value`.
    pub fn new<T: Send + 'static>(object: T, fence_value: u64) -> Self {
        Self::with(move || drop(object), fence_value)
    }

    /// Defers calling `release` until the fence reaches `fence_value`.
    pub fn with(release: impl FnOnce() + Send + 'static, fence_value: u64) -> Self {
        Self {
            fence_value,
            release: Box::new(release),
        }
    }

    pub fn fence_value(&self) -> u64 {
        self.fence_value
    }

    pub fn release(self) {
        (self.release)();
    }
}

impl std::fmt::Debug for Deferred {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred")
            .field("fence_value", &self.fence_value)
            .finish_non_exhaustive()
    }
}

/// A FIFO of [`Deferred`] releases, ordered by fence value.
#[derive(Debug, Default)]
pub struct ReleaseQueue {
    entries: VecDeque<Deferred>,
}

impl ReleaseQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Adds an entry to the back of the queue.
    ///
    /// Fence values must not decrease from one entry to the next.
    pub fn push(&mut self, deferred: Deferred) {
        debug_assert!(
            self.entries
                .back()
                .map_or(true, |last| last.fence_value <= deferred.fence_value),
            "release queue entries must be pushed in fence order"
        );

        self.entries.push_back(deferred);
    }

    /// Releases every entry whose fence value is no later than
    /// `completed_value`, returning the number released.
    pub fn release_completed(&mut self, completed_value: u64) -> usize {
        let mut released = 0;

        while self
            .entries
            .front()
            .map_or(false, |entry| entry.fence_value <= completed_value)
        {
            if let Some(entry) = self.entries.pop_front() {
                entry.release();
                released += 1;
            }
        }

        released
    }

    /// Releases every entry regardless of fence value. The GPU must be idle.
    pub fn flush(&mut self) -> usize {
        let released = self.entries.len();

        for entry in self.entries.drain(..) {
            entry.release();
        }

        released
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    #[test]
    fn releases_in_fence_order() {
        let released = Arc::new(AtomicUsize::new(0));
        let mut queue = ReleaseQueue::new();

        for value in [1, 1, 2, 3] {
            let released = released.clone();
            queue.push(Deferred::with(
                move || {
                    released.fetch_add(1, Ordering::Relaxed);
                },
                value,
            ));
        }

        assert_eq!(queue.release_completed(0), 0);
        assert_eq!(queue.release_completed(1), 2);
        assert_eq!(released.load(Ordering::Relaxed), 2);

        assert_eq!(queue.release_completed(2), 1);
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.flush(), 1);
        assert!(queue.is_empty());
        assert_eq!(released.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn drops_deferred_objects() {
        let object = Arc::new(());
        let mut queue = ReleaseQueue::new();

        queue.push(Deferred::new(object.clone(), 5));
        assert_eq!(Arc::strong_count(&object), 2);

        queue.release_completed(4);
        assert_eq!(Arc::strong_count(&object), 2);

        queue.release_completed(5);
        assert_eq!(Arc::strong_count(&object), 1);
    }
}
