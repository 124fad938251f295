//! Partial-affinity peer selection (§4.4): a deterministic mapping from
//! (sorted relays, sorted workers, this relay) to the contiguous window of
//! workers this relay should hold connections to.

use crate::identifiers::HostPort;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialRange {
    pub relay_index: usize,
    pub ratio: usize,
    pub length: usize,
    pub start: usize,
    pub stop: usize,
    pub affine_workers: Vec<HostPort>,
}

impl PartialRange {
    /// Compute the affine worker window for `relay_host_port`. Returns
    /// `None` if `relay_host_port` is not present in `relays` — the caller
    /// should log at warn and expect the next ring reconciliation to fix
    /// this, per §4.4 step 1.
    pub fn compute(
        relays: &[HostPort],
        workers: &[HostPort],
        relay_host_port: &HostPort,
        min_peers_per_worker: usize,
        min_peers_per_relay: usize,
    ) -> Option<PartialRange> {
        if workers.is_empty() || relays.is_empty() {
            return Some(PartialRange {
                relay_index: 0,
                ratio: 0,
                length: 0,
                start: 0,
                stop: 0,
                affine_workers: Vec::new(),
            });
        }

        let relay_index = relays.iter().position(|r| r == relay_host_port)?;
        let ratio = (workers.len() / relays.len()).max(1);

        let length = ((ratio * min_peers_per_worker) as f64).ceil() as usize;
        let length = length.max(min_peers_per_relay).min(workers.len());

        let start = (relay_index * ratio) % workers.len();
        let stop = start + length;

        let affine_workers = if stop <= workers.len() {
            workers[start..stop].to_vec()
        } else {
            let mut v = workers[start..].to_vec();
            v.extend_from_slice(&workers[..stop - workers.len()]);
            v
        };

        Some(PartialRange {
            relay_index,
            ratio,
            length,
            start,
            stop,
            affine_workers,
        })
    }
}

#[cfg(test)]
mod tests {
    use quickcheck::TestResult;
    use quickcheck_macros::quickcheck;

    use super::*;

    fn hosts(n: usize) -> Vec<HostPort> {
        (0..n)
            .map(|i| HostPort::new(format!("10.0.0.{}:{}", i, 1000 + i)).unwrap())
            .collect()
    }

    #[test]
    fn relay_not_in_ring_returns_none() {
        let relays = hosts(3);
        let workers = hosts(9);
        let outsider = HostPort::new("10.0.0.99:1").unwrap();
        assert!(PartialRange::compute(&relays, &workers, &outsider, 3, 3).is_none());
    }

    #[test]
    fn every_worker_covered_by_min_peers_per_worker_relays() {
        let relays = hosts(3);
        let workers = hosts(9);

        let mut coverage = vec![0usize; workers.len()];
        for relay in &relays {
            let range = PartialRange::compute(&relays, &workers, relay, 3, 3).unwrap();
            for w in &range.affine_workers {
                let idx = workers.iter().position(|x| x == w).unwrap();
                coverage[idx] += 1;
            }
        }
        for c in coverage {
            assert!(c >= 3, "expected each worker covered by >= 3 relays, got {}", c);
        }
    }

    #[test]
    fn respects_min_peers_per_relay_floor() {
        let relays = hosts(10);
        let workers = hosts(2);
        let range = PartialRange::compute(&relays, &workers, &relays[0], 1, 1).unwrap();
        assert!(range.length <= workers.len());
        assert!(!range.affine_workers.is_empty());
    }

    #[test]
    fn wraps_around_when_stop_exceeds_worker_count() {
        let relays = hosts(3);
        let workers = hosts(4);
        let last_relay = &relays[2];
        let range = PartialRange::compute(&relays, &workers, last_relay, 2, 2).unwrap();
        assert_eq!(range.affine_workers.len(), range.length);
    }

    #[test]
    fn empty_workers_yields_empty_range() {
        let relays = hosts(3);
        let workers: Vec<HostPort> = Vec::new();
        let range = PartialRange::compute(&relays, &workers, &relays[0], 3, 3).unwrap();
        assert!(range.affine_workers.is_empty());
    }

    /// §4.4's coverage invariant ("every worker held by at least
    /// `min_peers_per_worker` relays") generalized across randomized relay
    /// and worker counts, rather than the one fixed 3-relays/9-workers shape
    /// covered above.
    #[quickcheck]
    fn every_worker_covered_across_random_topologies(
        n_relays: u8,
        n_workers: u8,
        min_peers_per_worker: u8,
    ) -> TestResult {
        let n_relays = (n_relays % 8 + 1) as usize;
        let n_workers = (n_workers % 20 + 1) as usize;
        let min_peers_per_worker = (min_peers_per_worker % 4 + 1) as usize;

        let relays = hosts(n_relays);
        let workers = hosts(n_workers);

        let mut coverage = vec![0usize; workers.len()];
        for relay in &relays {
            let range = PartialRange::compute(&relays, &workers, relay, min_peers_per_worker, 1).unwrap();
            for w in &range.affine_workers {
                let idx = workers.iter().position(|x| x == w).unwrap();
                coverage[idx] += 1;
            }
        }

        // Can't be covered by more relays than exist.
        let expected_min = min_peers_per_worker.min(n_relays);
        TestResult::from_bool(coverage.iter().all(|&c| c >= expected_min))
    }
}
