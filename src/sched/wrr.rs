//! Weighted Round Robin.

use super::{SchedState, Scheduler, Selection};

/// Weighted Round Robin (WRR) algorithm. Where plain RR treats all workers
/// as equals, WRR prefers the worker with the most spare capacity, which is
/// its dynamic weight: `max_load - cur_load`. A worker that advertises a
/// capacity of 8 while handling 2 requests outweighs one that advertises 4
/// and handles 1. Ties go to the lowest worker id.
#[derive(Debug, Default)]
pub struct WeightedRoundRobin;

impl Scheduler for WeightedRoundRobin {
    fn select(&mut self, state: &SchedState) -> Selection {
        let mut best = None;

        for (&id, load) in &state.pool {
            if !load.has_capacity() {
                continue;
            }

            match best {
                Some((_, weight)) if load.weight() <= weight => {}
                _ => best = Some((id, load.weight())),
            }
        }

        match best {
            Some((id, _)) => Selection::Server(id),
            None => Selection::NoCapacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::state;
    use super::*;

    #[test]
    fn prefers_the_largest_spare_capacity() {
        let mut wrr = WeightedRoundRobin;
        let state = state(&[(1, 0, 3), (2, 1, 8), (3, 0, 5)]);

        // Spare capacities are 3, 7 and 5.
        assert_eq!(wrr.select(&state), Selection::Server(2));
    }

    #[test]
    fn ties_go_to_the_first_worker() {
        let mut wrr = WeightedRoundRobin;
        let state = state(&[(1, 2, 5), (2, 2, 5), (3, 2, 5)]);

        assert_eq!(wrr.select(&state), Selection::Server(1));
    }

    #[test]
    fn saturated_workers_cannot_win() {
        let mut wrr = WeightedRoundRobin;

        // Worker 1 has the largest max_load but no spare capacity.
        let state = state(&[(1, 9, 10), (2, 0, 4)]);

        assert_eq!(wrr.select(&state), Selection::Server(2));
    }
}
