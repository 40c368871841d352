use std::sync::Mutex;

/// Values that can be cleared for reuse while keeping their allocations.
pub trait Reset {
    fn reset(&mut self);
}

/// Bounded free-list of reusable values. Reuse only saves allocations; callers get a
/// fresh `T::default()` whenever the pool is empty.
#[derive(Debug)]
pub struct Pool<T> {
    items: Mutex<Vec<T>>,
    capacity: usize,
}

impl<T: Reset + Default> Pool<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            capacity,
        }
    }

    pub fn get(&self) -> T {
        self.items
            .lock()
            .ok()
            .and_then(|mut items| items.pop())
            .unwrap_or_default()
    }

    /// Resets `item` and keeps it unless the pool is full.
    pub fn put(&self, mut item: T) {
        item.reset();
        if let Ok(mut items) = self.items.lock() {
            if items.len() < self.capacity {
                items.push(item);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
