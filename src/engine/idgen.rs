//! Change-id allocator.
//!
//! Ids embed the local member id in the high 16 bits and a wall-clock-seeded
//! counter in the low 48, so ids from different members never collide and ids
//! from successive runs of the same member are distinct.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const SUFFIX_BITS: u64 = 48;
const COUNT_BITS: u64 = 8;

pub(crate) struct IdGen {
    prefix: u64,
    suffix: AtomicU64,
}

impl IdGen {
    pub(crate) fn new(member: u64) -> IdGen {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let suffix = (now_ms & ((1u64 << (SUFFIX_BITS - COUNT_BITS)) - 1)) << COUNT_BITS;
        IdGen {
            prefix: (member & 0xffff) << SUFFIX_BITS,
            suffix: AtomicU64::new(suffix),
        }
    }

    pub(crate) fn next(&self) -> u64 {
        let suffix = self.suffix.fetch_add(1, Ordering::Relaxed) + 1;
        self.prefix | (suffix & ((1u64 << SUFFIX_BITS) - 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_unique_within_process() {
        let gen = IdGen::new(3);
        let ids: HashSet<u64> = (0..10_000).map(|_| gen.next()).collect();
        assert_eq!(ids.len(), 10_000);
    }

    #[test]
    fn test_ids_carry_member_prefix() {
        let a = IdGen::new(1);
        let b = IdGen::new(2);
        assert_ne!(a.next() >> SUFFIX_BITS, b.next() >> SUFFIX_BITS);
    }
}
