use crossbeam_queue::ArrayQueue;

/// Lock-free pool of pre-built objects. When empty, callers fall back to
/// `create` and the overflow object is dropped if it cannot be returned.
pub struct ObjectPool<T: Send> {
    free: ArrayQueue<T>,
    factory: Box<dyn Fn() -> T + Send + Sync>,
}

impl<T: Send> ObjectPool<T> {
    pub fn with_capacity<F>(capacity: usize, prefill: usize, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let free = ArrayQueue::new(capacity.max(1));
        for _ in 0..prefill.min(capacity) {
            if free.push(factory()).is_err() {
                break;
            }
        }

        Self {
            free,
            factory: Box::new(factory),
        }
    }

    #[inline]
    pub fn acquire(&self) -> Option<T> {
        self.free.pop()
    }

    #[inline]
    pub fn acquire_or_create(&self) -> T {
        self.free.pop().unwrap_or_else(|| (self.factory)())
    }

    /// Hands the object back. Returns it if the pool is already full.
    #[inline]
    pub fn release(&self, obj: T) -> Result<(), T> {
        self.free.push(obj)
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.free.capacity()
    }
}

impl<T: Send> std::fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectPool")
            .field("available", &self.free.len())
            .field("capacity", &self.free.capacity())
            .finish()
    }
}
