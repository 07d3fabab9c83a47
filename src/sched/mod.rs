//! Load balancing and scheduler implementations.
//!
//! A scheduler picks which worker should process the next request, based on
//! a snapshot of every registered worker's load figures. The balancer
//! rebinds the snapshot before every pick, so schedulers never hold stale
//! state about the pool; the only state they may keep across picks is their
//! own (the Round Robin cursor, for example).

use std::collections::BTreeMap;

mod hash;
mod lc;
mod rr;
mod wlc;
mod wrr;

pub use hash::{hashkey, DestinationHashing, SourceHashing};
pub use lc::LeastConnection;
pub use rr::RoundRobin;
pub use wlc::WeightedLeastConnection;
pub use wrr::WeightedRoundRobin;

use crate::config::Algorithm;

/// Identifier the balancer assigns to a worker when it registers.
pub type WorkerId = usize;

/// Load a worker never gives away: a worker only counts as available while
/// `cur_load < max_load - RESERVED_CAPACITY`.
pub const RESERVED_CAPACITY: u32 = 1;

/// Load figures for one registered worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerLoad {
    /// Capacity learned from the worker's SERVERCHECK response.
    pub max_load: u32,

    /// Requests dispatched to the worker and not yet answered.
    pub cur_load: u32,
}

impl ServerLoad {
    pub fn has_capacity(&self) -> bool {
        self.cur_load + RESERVED_CAPACITY < self.max_load
    }

    /// Spare capacity, used as the dynamic weight by WRR.
    pub fn weight(&self) -> u32 {
        self.max_load.saturating_sub(self.cur_load)
    }
}

/// Snapshot a scheduler operates on. Iteration order over the pool is the
/// worker id order, which makes every policy's tie-breaking deterministic.
#[derive(Debug, Clone, Default)]
pub struct SchedState {
    pub pool: BTreeMap<WorkerId, ServerLoad>,

    /// Address hashed by the hashing policies: the client's source address
    /// for SH, the request's destination address for DH. Irrelevant to the
    /// other policies.
    pub handle_ip: Option<String>,
}

/// Outcome of a pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Send the request to this worker.
    Server(WorkerId),

    /// No worker has spare capacity; the balancer answers 503.
    NoCapacity,

    /// The address a hashing policy was asked to hash is missing or not a
    /// valid IPv4 address; the balancer answers 500.
    Malformed,
}

/// A scheduler provides an algorithm for load balancing between multiple
/// workers.
pub trait Scheduler: Send {
    /// Picks the worker that should process the next request.
    fn select(&mut self, state: &SchedState) -> Selection;
}

/// Instantiates the scheduler for the configured algorithm.
pub fn make(algorithm: Algorithm) -> Box<dyn Scheduler> {
    match algorithm {
        Algorithm::Rr => Box::new(RoundRobin::new()),
        Algorithm::Wrr => Box::new(WeightedRoundRobin),
        Algorithm::Lc => Box::new(LeastConnection),
        Algorithm::Wlc => Box::new(WeightedLeastConnection),
        Algorithm::Dh => Box::new(DestinationHashing),
        Algorithm::Sh => Box::new(SourceHashing),
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Builds a snapshot from `(id, cur_load, max_load)` triples.
    pub fn state(servers: &[(WorkerId, u32, u32)]) -> SchedState {
        let pool = servers
            .iter()
            .map(|&(id, cur_load, max_load)| (id, ServerLoad { max_load, cur_load }))
            .collect();

        SchedState {
            pool,
            handle_ip: None,
        }
    }

    pub fn with_ip(mut state: SchedState, ip: &str) -> SchedState {
        state.handle_ip = Some(ip.to_string());
        state
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::{testutil::*, *};

    fn all_algorithms() -> Vec<Algorithm> {
        vec![
            Algorithm::Rr,
            Algorithm::Wrr,
            Algorithm::Lc,
            Algorithm::Wlc,
            Algorithm::Dh,
            Algorithm::Sh,
        ]
    }

    /// Every policy returns a worker with spare capacity whenever one
    /// exists, and `NoCapacity` otherwise, over randomly generated pools.
    #[test]
    fn capacity_contract_over_random_pools() {
        let mut rng = rand::thread_rng();

        for algorithm in all_algorithms() {
            let mut scheduler = make(algorithm);

            for _ in 0..200 {
                let servers: Vec<(WorkerId, u32, u32)> = (0..rng.gen_range(1..6))
                    .map(|id| {
                        let max_load = rng.gen_range(1..8);
                        let cur_load = rng.gen_range(0..=max_load);
                        (id, cur_load, max_load)
                    })
                    .collect();

                let state = with_ip(state(&servers), "10.1.2.3");
                let any_capacity = state.pool.values().any(ServerLoad::has_capacity);

                match scheduler.select(&state) {
                    Selection::Server(id) => {
                        assert!(any_capacity, "{algorithm:?} picked from a saturated pool");
                        assert!(
                            state.pool[&id].has_capacity(),
                            "{algorithm:?} picked a saturated worker"
                        );
                    }
                    Selection::NoCapacity => {
                        assert!(!any_capacity, "{algorithm:?} gave up on an available pool")
                    }
                    Selection::Malformed => panic!("{algorithm:?} rejected a well-formed address"),
                }
            }
        }
    }

    #[test]
    fn empty_pools_never_panic() {
        for algorithm in all_algorithms() {
            let state = with_ip(SchedState::default(), "10.1.2.3");
            assert_eq!(make(algorithm).select(&state), Selection::NoCapacity);
        }
    }
}
