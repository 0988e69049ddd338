//! Port allocation from the fixed session pool.
//!
//! [`PortAllocator`] keeps the set of assigned ports in memory so that a
//! first login does not re-scan every record. It is seeded from the
//! registry at startup and must be held under the orchestrator's
//! allocation lock while a new record is persisted.

use std::collections::BTreeSet;
use std::ops::Range;

use crate::{AppError, Result};

/// Pick the lowest port in `pool` that is not in `used`.
///
/// # Errors
///
/// Returns `AppError::AllocationExhausted` when `used` covers the whole pool.
pub fn allocate(pool: Range<u16>, used: &BTreeSet<u16>) -> Result<u16> {
    let (low, high) = (pool.start, pool.end);
    (low..high)
        .find(|port| !used.contains(port))
        .ok_or_else(|| AppError::AllocationExhausted(format!("no free port in {low}..{high}")))
}

/// In-memory view of which pool ports are taken.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    pool: Range<u16>,
    assigned: BTreeSet<u16>,
}

impl PortAllocator {
    /// Create an allocator with nothing assigned.
    #[must_use]
    pub fn new(pool: Range<u16>) -> Self {
        Self {
            pool,
            assigned: BTreeSet::new(),
        }
    }

    /// Replace the assigned set, typically with the registry's view.
    pub fn refresh(&mut self, assigned: BTreeSet<u16>) {
        self.assigned = assigned;
    }

    /// Claim the lowest free port.
    ///
    /// # Errors
    ///
    /// Returns `AppError::AllocationExhausted` when every pool port is taken.
    pub fn allocate(&mut self) -> Result<u16> {
        let port = allocate(self.pool.clone(), &self.assigned)?;
        self.assigned.insert(port);
        Ok(port)
    }

    /// Return a port to the pool.
    pub fn release(&mut self, port: u16) {
        self.assigned.remove(&port);
    }
}
