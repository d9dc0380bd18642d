//! Maps a client's [`PortIdentity`] to one of the server's send workers.
//!
//! The mapping must be stable for the lifetime of a worker pool: the same
//! client always lands on the same worker, so a renewed SIGNALING grant
//! finds the subscription the earlier grant created.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::identity::PortIdentity;

/// Stable, process-lifetime hash of a client identity.
pub fn hash64(port_identity: PortIdentity) -> u64 {
    let mut hasher = DefaultHasher::new();
    port_identity.clock_identity.as_u64().hash(&mut hasher);
    port_identity.port_number.hash(&mut hasher);
    hasher.finish()
}

/// Index of the worker that owns `port_identity`, out of `worker_count` total.
///
/// Panics if `worker_count` is zero; the caller is expected to validate
/// configuration before this is ever reached.
pub fn find_worker(port_identity: PortIdentity, worker_count: usize) -> usize {
    assert!(worker_count > 0, "worker_count must be non-zero");
    (hash64(port_identity) % worker_count as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ClockIdentity;

    #[test]
    fn same_identity_always_maps_to_same_worker() {
        let pi = PortIdentity::new(ClockIdentity(0x1122334455667788), 1);
        let first = find_worker(pi, 8);
        for _ in 0..100 {
            assert_eq!(find_worker(pi, 8), first);
        }
    }

    #[test]
    fn distribution_is_roughly_even_across_workers() {
        const WORKERS: usize = 10;
        const CLIENTS: usize = 1000;
        let mut counts = [0usize; WORKERS];
        for i in 0..CLIENTS {
            let pi = PortIdentity::new(ClockIdentity(i as u64), (i % 4) as u16);
            counts[find_worker(pi, WORKERS)] += 1;
        }
        let expected = CLIENTS / WORKERS;
        for count in counts {
            let deviation = (count as f64 - expected as f64).abs() / expected as f64;
            assert!(deviation < 0.35, "worker got {count}, expected ~{expected}");
        }
    }
}
