//! Placement of new instances onto nodes.

use cachefleet_agent_api::ResourceSnapshot;

/// Whether a node can take an instance reserving `max_memory_mb`.
pub fn admits(snapshot: &ResourceSnapshot, max_memory_mb: u64) -> bool {
    snapshot.has_free_slot()
        && snapshot.free_memory_fraction().is_some()
        && snapshot.memory.free >= max_memory_mb
}

/// Pick the admitting node with the highest free-memory fraction.
///
/// Candidates are considered in iteration order and ties keep the earlier
/// one, so callers pass nodes in configuration order.
pub fn select_target<'a, I>(candidates: I, max_memory_mb: u64) -> Option<&'a str>
where
    I: IntoIterator<Item = (&'a str, &'a ResourceSnapshot)>,
{
    let mut best: Option<(&'a str, f64)> = None;

    for (host, snapshot) in candidates {
        if !admits(snapshot, max_memory_mb) {
            continue;
        }
        let Some(fraction) = snapshot.free_memory_fraction() else {
            continue;
        };
        match best {
            Some((_, best_fraction)) if fraction <= best_fraction => {}
            _ => best = Some((host, fraction)),
        }
    }

    best.map(|(host, _)| host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachefleet_agent_api::ResourceStatus;

    fn snapshot(memory_all: u64, memory_used: u64, slots_free: u64) -> ResourceSnapshot {
        ResourceSnapshot {
            memory: ResourceStatus::from_usage(memory_all, memory_used),
            instances: ResourceStatus::from_usage(10, 10 - slots_free),
        }
    }

    #[test]
    fn test_picks_highest_free_fraction() {
        let a = snapshot(1000, 200, 5); // 80% free
        let b = snapshot(1000, 600, 5); // 40% free
        let c = snapshot(1000, 990, 5); // too little memory

        let target = select_target([("a", &a), ("b", &b), ("c", &c)], 100);
        assert_eq!(target, Some("a"));

        let target = select_target([("c", &c), ("b", &b), ("a", &a)], 100);
        assert_eq!(target, Some("a"));
    }

    #[test]
    fn test_fraction_beats_absolute_free() {
        let big = snapshot(10_000, 6_000, 5); // 40% free, 4000 MB
        let small = snapshot(2_000, 400, 5); // 80% free, 1600 MB

        assert_eq!(select_target([("big", &big), ("small", &small)], 512), Some("small"));
    }

    #[test]
    fn test_skips_full_nodes() {
        let full = snapshot(1000, 0, 0);
        let roomy = snapshot(1000, 900, 1);

        assert_eq!(select_target([("full", &full), ("roomy", &roomy)], 50), Some("roomy"));
    }

    #[test]
    fn test_skips_zero_memory_nodes() {
        let empty = ResourceSnapshot {
            memory: ResourceStatus::default(),
            instances: ResourceStatus::from_usage(4, 0),
        };
        assert!(!admits(&empty, 0));
        assert_eq!(select_target([("empty", &empty)], 0), None);
    }

    #[test]
    fn test_exact_fit_admitted() {
        let node = snapshot(1000, 744, 1);
        assert!(admits(&node, 256));
        assert!(!admits(&node, 257));
    }

    #[test]
    fn test_tie_keeps_first() {
        let a = snapshot(1000, 500, 1);
        let b = snapshot(2000, 1000, 1);
        assert_eq!(select_target([("a", &a), ("b", &b)], 10), Some("a"));
    }

    #[test]
    fn test_no_candidates() {
        let a = snapshot(1000, 950, 3);
        assert_eq!(select_target([("a", &a)], 100), None);
        assert_eq!(select_target(std::iter::empty(), 100), None);
    }
}
