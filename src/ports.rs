//! Port Pool Allocator
//!
//! Hands out host ports for challenge instances from a bounded range.
//! First-available policy so allocations are deterministic and testable.
//! Reserve/release are short critical sections, independent of any
//! per-instance locking in the lifecycle controller.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeSet;

pub struct PortAllocator {
    base: u16,
    size: u16,
    reserved: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    pub fn new(base: u16, size: u16) -> Self {
        Self {
            base,
            size,
            reserved: Mutex::new(BTreeSet::new()),
        }
    }

    /// Rebuild an allocator with ports already held by live records
    /// (server restart path). Ports outside the pool range are ignored.
    pub fn with_reserved(base: u16, size: u16, in_use: impl IntoIterator<Item = u16>) -> Self {
        let end = base.saturating_add(size);
        let reserved: BTreeSet<u16> = in_use
            .into_iter()
            .filter(|p| (base..end).contains(p))
            .collect();
        Self {
            base,
            size,
            reserved: Mutex::new(reserved),
        }
    }

    /// Reserve the first free port, or `None` when the pool is exhausted.
    /// Two concurrent calls never return the same port.
    pub fn reserve(&self) -> Option<u16> {
        let mut reserved = self.reserved.lock();
        let end = self.base.saturating_add(self.size);
        for port in self.base..end {
            if !reserved.contains(&port) {
                reserved.insert(port);
                return Some(port);
            }
        }
        None
    }

    /// Return a port to the pool; releasing an unreserved port is a no-op
    pub fn release(&self, port: u16) -> bool {
        self.reserved.lock().remove(&port)
    }

    pub fn stats(&self) -> PoolStats {
        let reserved = self.reserved.lock().len() as u16;
        PoolStats {
            pool_size: self.size,
            reserved,
            available: self.size - reserved,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStats {
    pub pool_size: u16,
    pub reserved: u16,
    pub available: u16,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_first_available_order() {
        let pool = PortAllocator::new(30000, 5);
        assert_eq!(pool.reserve(), Some(30000));
        assert_eq!(pool.reserve(), Some(30001));
        pool.release(30000);
        // Freed port is handed out again before untouched ones
        assert_eq!(pool.reserve(), Some(30000));
    }

    #[test]
    fn test_pool_exhaustion() {
        let pool = PortAllocator::new(30000, 2);
        assert!(pool.reserve().is_some());
        assert!(pool.reserve().is_some());
        assert_eq!(pool.reserve(), None);

        pool.release(30001);
        assert_eq!(pool.reserve(), Some(30001));
    }

    #[test]
    fn test_release_unreserved_is_noop() {
        let pool = PortAllocator::new(30000, 2);
        assert!(!pool.release(30000));
        assert!(!pool.release(9999));
        assert_eq!(pool.stats().available, 2);
    }

    #[test]
    fn test_with_reserved_skips_held_ports() {
        let pool = PortAllocator::with_reserved(30000, 3, vec![30000, 30002, 40000]);
        assert_eq!(pool.reserve(), Some(30001));
        assert_eq!(pool.reserve(), None);
        assert_eq!(pool.stats().reserved, 3);
    }

    #[test]
    fn test_concurrent_reserves_are_unique() {
        let pool = Arc::new(PortAllocator::new(30000, 64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            handles.push(std::thread::spawn(move || {
                (0..8).filter_map(|_| pool.reserve()).collect::<Vec<_>>()
            }));
        }

        let mut all: Vec<u16> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        let before = all.len();
        all.dedup();
        assert_eq!(before, 64);
        assert_eq!(all.len(), 64);
    }
}
