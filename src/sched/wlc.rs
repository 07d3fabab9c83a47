//! Weighted Least Connection.

use super::{SchedState, Scheduler, Selection};

/// Weighted Least Connection (WLC) algorithm. The pick minimizes the load
/// ratio `cur_load / max_load`, so a worker twice as big is expected to
/// carry twice the connections. The comparison cross-multiplies instead of
/// dividing, keeping everything in integers: `a` beats `b` when
/// `a.cur * b.max < b.cur * a.max`. Ties go to the lowest worker id.
#[derive(Debug, Default)]
pub struct WeightedLeastConnection;

impl Scheduler for WeightedLeastConnection {
    fn select(&mut self, state: &SchedState) -> Selection {
        let mut best: Option<(usize, u64, u64)> = None;

        for (&id, load) in &state.pool {
            if !load.has_capacity() {
                continue;
            }

            let (cur, max) = (u64::from(load.cur_load), u64::from(load.max_load));

            match best {
                Some((_, best_cur, best_max)) if cur * best_max >= best_cur * max => {}
                _ => best = Some((id, cur, max)),
            }
        }

        match best {
            Some((id, ..)) => Selection::Server(id),
            None => Selection::NoCapacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::state;
    use super::*;

    #[test]
    fn prefers_the_lowest_load_ratio() {
        let mut wlc = WeightedLeastConnection;

        // Ratios are 2/4, 1/8 and 3/10.
        let state = state(&[(1, 2, 4), (2, 1, 8), (3, 3, 10)]);

        assert_eq!(wlc.select(&state), Selection::Server(2));
    }

    #[test]
    fn ties_go_to_the_first_worker() {
        let mut wlc = WeightedLeastConnection;

        // 1/4 == 2/8.
        let state = state(&[(1, 1, 4), (2, 2, 8)]);

        assert_eq!(wlc.select(&state), Selection::Server(1));
    }

    #[test]
    fn requests_spread_proportionally_to_capacity() {
        let mut wlc = WeightedLeastConnection;
        let mut loads = [(1usize, 0u32, 4u32), (2, 0, 8), (3, 0, 12)];

        // Dispatch 9 requests, incrementing the winner's load each time, the
        // same way the balancer does for requests in flight.
        for _ in 0..9 {
            let Selection::Server(id) = wlc.select(&state(&loads)) else {
                panic!("pool saturated too early");
            };
            loads.iter_mut().find(|l| l.0 == id).unwrap().1 += 1;
        }

        // 9 in-flight requests over capacities 4, 8 and 12 should settle
        // close to ratios of 3/8 each: 1/4 (or 2/4), 3/8, 4/12 (or 5/12).
        let by_id: std::collections::BTreeMap<_, _> =
            loads.iter().map(|&(id, cur, max)| (id, (cur, max))).collect();

        for (cur, max) in by_id.values() {
            let ratio = f64::from(*cur) / f64::from(*max);
            assert!(
                (ratio - 3.0 / 8.0).abs() <= 1.0 / f64::from(*max),
                "ratio {ratio} too far from equal share"
            );
        }
    }
}
