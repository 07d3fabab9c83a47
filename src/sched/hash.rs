//! Destination Hashing and Source Hashing.
//!
//! Both policies map an IPv4 address to a worker through a small
//! multiplicative hash, so the same address always lands on the same worker
//! as long as the pool does not change. They only differ in which address
//! the balancer feeds them: DH hashes the request's destination, SH hashes
//! the client's source. When the hashed worker has no spare capacity the
//! scan falls back to Round Robin starting at that offset.

use std::net::Ipv4Addr;

use super::{SchedState, Scheduler, Selection};

pub const HASH_TAB_BITS: u32 = 12;
pub const HASH_TAB_SIZE: u32 = 1 << HASH_TAB_BITS;
pub const HASH_TAB_MASK: u32 = HASH_TAB_SIZE - 1;

/// 2654435761 / 2^32 is the closest integer ratio to the golden ratio
/// 0.618033989, which spreads consecutive addresses well across the table.
const GOLDEN_RATIO_PRIME: u32 = 2654435761;

/// Hashes an IPv4 address (as an integer) into the table.
pub fn hashkey(ip: u32) -> u32 {
    ip.wrapping_mul(GOLDEN_RATIO_PRIME) & HASH_TAB_MASK
}

/// Destination Hashing (DH). Useful in front of cache workers: requests for
/// the same destination keep hitting the same worker and its warm cache.
#[derive(Debug, Default)]
pub struct DestinationHashing;

/// Source Hashing (SH). Same mapping as DH over the client's source address.
#[derive(Debug, Default)]
pub struct SourceHashing;

impl Scheduler for DestinationHashing {
    fn select(&mut self, state: &SchedState) -> Selection {
        select_by_ip(state)
    }
}

impl Scheduler for SourceHashing {
    fn select(&mut self, state: &SchedState) -> Selection {
        select_by_ip(state)
    }
}

fn select_by_ip(state: &SchedState) -> Selection {
    let Some(ip) = state.handle_ip.as_deref() else {
        return Selection::Malformed;
    };

    let Ok(addr) = ip.parse::<Ipv4Addr>() else {
        return Selection::Malformed;
    };

    let ids: Vec<_> = state.pool.keys().copied().collect();

    if ids.is_empty() {
        return Selection::NoCapacity;
    }

    let start = hashkey(u32::from(addr)) as usize % ids.len();

    for i in 0..ids.len() {
        let id = ids[(start + i) % ids.len()];
        if state.pool[&id].has_capacity() {
            return Selection::Server(id);
        }
    }

    Selection::NoCapacity
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{state, with_ip};
    use super::*;

    #[test]
    fn same_address_and_pool_always_pick_the_same_worker() {
        let mut sh = SourceHashing;
        let state = with_ip(state(&[(1, 0, 5), (2, 0, 5), (3, 0, 5)]), "192.168.1.40");

        let first = sh.select(&state);
        for _ in 0..10 {
            assert_eq!(sh.select(&state), first);
        }
    }

    #[test]
    fn different_addresses_can_pick_different_workers() {
        let mut dh = DestinationHashing;
        let servers = [(1, 0, 5), (2, 0, 5), (3, 0, 5), (4, 0, 5)];

        let picks: std::collections::BTreeSet<_> = (0..32)
            .map(|i| {
                let state = with_ip(state(&servers), &format!("10.0.0.{i}"));
                match dh.select(&state) {
                    Selection::Server(id) => id,
                    other => panic!("unexpected selection {other:?}"),
                }
            })
            .collect();

        assert!(picks.len() > 1, "hash mapped 32 addresses to one worker");
    }

    #[test]
    fn falls_back_to_the_next_worker_when_the_hashed_one_is_full() {
        let mut sh = SourceHashing;
        let addr = "192.168.1.40";

        let open = with_ip(state(&[(1, 0, 5), (2, 0, 5)]), addr);
        let Selection::Server(hashed) = sh.select(&open) else {
            panic!("open pool must yield a worker");
        };

        // Saturate the hashed worker; the other one must take over.
        let other = if hashed == 1 { 2 } else { 1 };
        let full = with_ip(
            state(&[(hashed, 4, 5), (other, 0, 5)]),
            addr,
        );

        assert_eq!(sh.select(&full), Selection::Server(other));
    }

    #[test]
    fn malformed_addresses_are_reported() {
        let mut dh = DestinationHashing;
        let pool = state(&[(1, 0, 5)]);

        assert_eq!(dh.select(&with_ip(pool.clone(), "not-an-ip")), Selection::Malformed);
        assert_eq!(dh.select(&pool), Selection::Malformed);
    }

    #[test]
    fn hashkey_is_bounded_by_the_table_mask() {
        for ip in [0u32, 1, u32::MAX, u32::from(Ipv4Addr::new(127, 0, 0, 1))] {
            assert!(hashkey(ip) < HASH_TAB_SIZE);
        }
    }
}
