//! Free-list object pool with RAII return.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Values that can be wiped clean before being handed out again.
pub trait Recycle {
    /// Clear every field reachable from `self`.
    fn recycle(&mut self);
}

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

/// A bounded free-list of reusable values.
pub struct Pool<T: Recycle> {
    free: Mutex<Vec<T>>,
    max_idle: usize,
    factory: Factory<T>,
}

impl<T: Recycle> Pool<T> {
    /// Create a pool keeping at most `max_idle` recycled values around.
    pub fn new(max_idle: usize, factory: impl Fn() -> T + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
            max_idle,
            factory: Box::new(factory),
        })
    }

    /// Take a value from the free-list, or build a fresh one.
    pub fn acquire(self: &Arc<Self>) -> Pooled<T> {
        let value = self.free.lock().pop().unwrap_or_else(|| (self.factory)());
        Pooled {
            value: Some(value),
            pool: Arc::downgrade(self),
        }
    }

    /// Number of values waiting for reuse.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    fn release(&self, mut value: T) {
        value.recycle();
        let mut free = self.free.lock();
        if free.len() < self.max_idle {
            free.push(value);
        }
    }
}

impl<T: Recycle> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("idle", &self.idle())
            .field("max_idle", &self.max_idle)
            .finish()
    }
}

/// A value on loan from a [`Pool`]; recycled and returned on drop.
pub struct Pooled<T: Recycle> {
    value: Option<T>,
    pool: Weak<Pool<T>>,
}

impl<T: Recycle> Pooled<T> {
    /// Wrap a value that does not belong to any pool.
    pub const fn unpooled(value: T) -> Self {
        Self {
            value: Some(value),
            pool: Weak::new(),
        }
    }

    /// Take ownership of the value; it will not go back to the pool.
    pub fn detach(mut self) -> T {
        match self.value.take() {
            Some(value) => value,
            None => unreachable!("pooled value is only taken on drop or detach"),
        }
    }
}

impl<T: Recycle> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.value {
            Some(value) => value,
            None => unreachable!("pooled value is only taken on drop or detach"),
        }
    }
}

impl<T: Recycle> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.value {
            Some(value) => value,
            None => unreachable!("pooled value is only taken on drop or detach"),
        }
    }
}

impl<T: Recycle> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let (Some(value), Some(pool)) = (self.value.take(), self.pool.upgrade()) {
            pool.release(value);
        }
    }
}

impl<T: Recycle + fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
