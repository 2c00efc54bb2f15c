// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/

/// A simple structure for allocating and freeing integer ids from a
/// bounded range.  Used for the per-switch OpenFlow group id pool:
/// freed ids are recycled before the monotonic frontier advances.
use std::collections::BTreeSet;

use slog::debug;

use crate::types::NhError;
use crate::types::NhResult;

pub struct FreeMap {
    // Where debug messages are logged
    log: slog::Logger,
    // The lowest id never handed out.
    next: u32,
    // One past the highest id we may hand out.
    limit: u32,
    // Ids below `next` that have been returned to the pool.
    freelist: BTreeSet<u32>,
}

impl FreeMap {
    /// Create a pool over `[first, limit)`.
    pub fn new(
        log: &slog::Logger,
        name: impl ToString,
        first: u32,
        limit: u32,
    ) -> Self {
        let unit = format!("freemap_{}", name.to_string());
        let log = log.new(slog::o!("unit" => unit));
        debug!(log, "created new freemap"; "first" => first, "limit" => limit);
        FreeMap {
            log,
            next: first,
            limit,
            freelist: BTreeSet::new(),
        }
    }

    /// Allocate one id, preferring a recycled id over fresh space.
    pub fn alloc(&mut self) -> NhResult<u32> {
        if let Some(id) = self.freelist.pop_first() {
            #[cfg(not(test))]
            slog::trace!(self.log, "allocated {id} from freelist");
            return Ok(id);
        }
        if self.next >= self.limit {
            return Err(NhError::GroupsExhausted);
        }
        let id = self.next;
        self.next += 1;
        #[cfg(not(test))]
        slog::trace!(self.log, "allocated fresh id {id}");
        Ok(id)
    }

    /// Return an id to the pool.  Freeing an id that was never
    /// allocated is a caller bug; it is logged and ignored.
    pub fn free(&mut self, id: u32) {
        if id >= self.next || !self.freelist.insert(id) {
            debug!(self.log, "freed unallocated id {id}");
        }
    }
}

#[cfg(test)]
fn new_freemap(limit: u32) -> FreeMap {
    let log = common::logging::test_logger();
    FreeMap::new(&log, "test", 1, limit)
}

// Test simple allocation.
#[test]
fn test_basic() -> anyhow::Result<()> {
    let mut map = new_freemap(128);

    // The monotonic frontier hands out ids in order.
    let a = map.alloc()?;
    assert_eq!(a, 1);
    let b = map.alloc()?;
    assert_eq!(b, 2);
    Ok(())
}

// Test freeing post-allocation
#[test]
fn test_free() -> anyhow::Result<()> {
    let mut map = new_freemap(128);

    let a = map.alloc()?;
    let b = map.alloc()?;
    map.free(a);

    // The next allocation should be satisfied from the freelist, giving
    // us back the one we just freed.
    let c = map.alloc()?;
    assert_eq!(c, a);
    assert_ne!(c, b);
    Ok(())
}

#[test]
fn test_exhaustion() -> anyhow::Result<()> {
    let mut map = new_freemap(8);

    let mut s = Vec::new();
    for _ in 1..8 {
        let id = map.alloc().expect("exhausted pool prematurely");
        s.push(id);
    }
    assert!(map.alloc().is_err());
    map.free(s.pop().unwrap());
    let z = map.alloc()?;
    assert_eq!(z, 7);

    Ok(())
}

#[test]
fn test_double_free_ignored() -> anyhow::Result<()> {
    let mut map = new_freemap(8);

    let a = map.alloc()?;
    map.free(a);
    map.free(a);
    assert_eq!(map.alloc()?, a);
    // The duplicate free must not have left a second copy behind.
    assert_ne!(map.alloc()?, a);
    Ok(())
}
