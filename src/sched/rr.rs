//! Round Robin.

use super::{SchedState, Scheduler, Selection};

/// Classical Round Robin (RR) algorithm. A monotonic counter chooses the
/// starting offset for each pick, so consecutive requests land on
/// consecutive workers. A worker without spare capacity is skipped; if the
/// scan comes back around to where it started, nobody can take the request.
#[derive(Debug, Default)]
pub struct RoundRobin {
    /// Picks made so far; `count % pool size` is the next starting offset.
    count: usize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Scheduler for RoundRobin {
    fn select(&mut self, state: &SchedState) -> Selection {
        let ids: Vec<_> = state.pool.keys().copied().collect();

        if ids.is_empty() {
            return Selection::NoCapacity;
        }

        let start = self.count % ids.len();
        self.count = self.count.wrapping_add(1);

        for i in 0..ids.len() {
            let id = ids[(start + i) % ids.len()];
            if state.pool[&id].has_capacity() {
                return Selection::Server(id);
            }
        }

        Selection::NoCapacity
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::state;
    use super::*;

    #[test]
    fn visits_every_worker_once_per_cycle() {
        let mut rr = RoundRobin::new();
        let state = state(&[(1, 0, 5), (2, 0, 5), (3, 0, 5)]);

        let picks: Vec<_> = (0..6).map(|_| rr.select(&state)).collect();

        assert_eq!(
            picks,
            vec![
                Selection::Server(1),
                Selection::Server(2),
                Selection::Server(3),
                Selection::Server(1),
                Selection::Server(2),
                Selection::Server(3),
            ]
        );
    }

    #[test]
    fn skips_workers_without_capacity() {
        let mut rr = RoundRobin::new();

        // Worker 1 is saturated (4 + RESERVED_CAPACITY >= 5).
        let state = state(&[(1, 4, 5), (2, 0, 5)]);

        assert_eq!(rr.select(&state), Selection::Server(2));
        assert_eq!(rr.select(&state), Selection::Server(2));
    }

    #[test]
    fn saturated_pool_yields_no_capacity() {
        let mut rr = RoundRobin::new();
        let state = state(&[(1, 4, 5), (2, 5, 5)]);

        assert_eq!(rr.select(&state), Selection::NoCapacity);
    }
}
