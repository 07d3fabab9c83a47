//! Least Connection.

use super::{SchedState, Scheduler, Selection};

/// Least Connection (LC) algorithm. Each request goes to the worker that
/// currently has the fewest outstanding requests, regardless of advertised
/// capacity (which only matters as the availability cutoff). Ties go to the
/// lowest worker id.
#[derive(Debug, Default)]
pub struct LeastConnection;

impl Scheduler for LeastConnection {
    fn select(&mut self, state: &SchedState) -> Selection {
        let mut best = None;

        for (&id, load) in &state.pool {
            if !load.has_capacity() {
                continue;
            }

            match best {
                Some((_, cur_load)) if load.cur_load >= cur_load => {}
                _ => best = Some((id, load.cur_load)),
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
    fn prefers_the_fewest_outstanding_requests() {
        let mut lc = LeastConnection;
        let state = state(&[(1, 3, 10), (2, 1, 4), (3, 2, 10)]);

        assert_eq!(lc.select(&state), Selection::Server(2));
    }

    #[test]
    fn ties_go_to_the_first_worker() {
        let mut lc = LeastConnection;
        let state = state(&[(1, 1, 5), (2, 1, 5)]);

        assert_eq!(lc.select(&state), Selection::Server(1));
    }

    #[test]
    fn a_less_loaded_but_saturated_worker_is_ignored() {
        let mut lc = LeastConnection;

        // Worker 2 has fewer outstanding requests but a capacity of 1, which
        // the reserve rule makes permanently unavailable.
        let state = state(&[(1, 2, 10), (2, 0, 1)]);

        assert_eq!(lc.select(&state), Selection::Server(1));
    }
}
