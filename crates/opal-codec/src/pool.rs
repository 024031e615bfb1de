//! Pooled decode scratch buffers.
//!
//! Each object load needs a shared-value decode-order list. Loads can nest
//! (decoding a field can fault in another object), so a session keeps a
//! small pool of these vectors instead of one per-session buffer.

use opal_core::value::SharedValue;
use parking_lot::Mutex;
use std::sync::Arc;

/// Pool of reusable shared-value scratch vectors.
pub struct ScratchPool {
    free: Mutex<Vec<Vec<SharedValue>>>,
    max: usize,
}

impl ScratchPool {
    /// Creates a pool that retains at most `max` idle buffers.
    pub fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::with_capacity(max)),
            max,
        })
    }

    /// Takes a buffer from the pool, allocating if none is idle. The
    /// buffer returns to the pool when the guard drops, on every exit
    /// path.
    pub fn acquire(self: &Arc<Self>) -> ScratchGuard {
        let buf = self.free.lock().pop().unwrap_or_default();
        ScratchGuard {
            pool: Arc::clone(self),
            buf: Some(buf),
        }
    }

    /// Number of idle buffers currently pooled.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

/// RAII handle to a pooled scratch buffer.
pub struct ScratchGuard {
    pool: Arc<ScratchPool>,
    buf: Option<Vec<SharedValue>>,
}

impl ScratchGuard {
    /// The scratch vector, for the duration of the guard.
    pub fn buf(&mut self) -> &mut Vec<SharedValue> {
        // Present from acquire() until drop.
        self.buf.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        if let Some(mut buf) = self.buf.take() {
            buf.clear();
            let mut free = self.pool.free.lock();
            if free.len() < self.pool.max {
                free.push(buf);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opal_core::value::shared;
    use opal_core::Value;

    #[test]
    fn test_buffer_returns_on_drop() {
        let pool = ScratchPool::new(2);
        assert_eq!(pool.idle(), 0);
        {
            let mut guard = pool.acquire();
            guard.buf().push(shared(Value::I32(1)));
        }
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_returned_buffer_is_cleared() {
        let pool = ScratchPool::new(2);
        {
            let mut guard = pool.acquire();
            guard.buf().push(shared(Value::I32(1)));
        }
        let mut guard = pool.acquire();
        assert!(guard.buf().is_empty());
    }

    #[test]
    fn test_pool_caps_idle_buffers() {
        let pool = ScratchPool::new(1);
        let a = pool.acquire();
        let b = pool.acquire();
        drop(a);
        drop(b);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_nested_acquires_get_distinct_buffers() {
        let pool = ScratchPool::new(4);
        let mut outer = pool.acquire();
        outer.buf().push(shared(Value::Null));
        let inner = pool.acquire();
        assert!(inner.buf.as_ref().unwrap().is_empty());
        assert_eq!(outer.buf().len(), 1);
    }

    #[test]
    fn test_buffer_returned_on_panic() {
        let pool = ScratchPool::new(2);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut guard = pool.acquire();
            guard.buf().push(shared(Value::Bool(true)));
            panic!("load failed");
        }));
        assert!(result.is_err());
        assert_eq!(pool.idle(), 1);
    }
}
