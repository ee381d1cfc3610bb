//! Rendezvous (highest-random-weight) partition ordering.
//!
//! Removing one partition from the alive set only removes its positions;
//! every other relative order is preserved, so a single failure reshuffles
//! nothing but its own assignments.

use xxhash_rust::xxh3::Xxh3;

use crate::cluster::partitions::PartitionId;

/// Orders the alive partitions for a given file name.
pub trait ServerSelector: Send + Sync {
    /// Reorder `ids` in place, best candidate first. `ids` is the current
    /// alive set; the result must be deterministic per `(name, ids)`.
    fn select(&self, name: &str, ids: &mut Vec<PartitionId>);
}

/// Default selector: sort descending by a stable mixed hash of
/// `(id, name)`, ties broken by the id's natural order.
pub struct RendezvousSelector;

fn weight(id: &str, name: &str) -> u64 {
    let mut hasher = Xxh3::new();
    hasher.update(id.as_bytes());
    hasher.update(&[0]);
    hasher.update(name.as_bytes());
    hasher.digest()
}

impl ServerSelector for RendezvousSelector {
    fn select(&self, name: &str, ids: &mut Vec<PartitionId>) {
        ids.sort_by(|a, b| {
            weight(b, name)
                .cmp(&weight(a, name))
                .then_with(|| a.cmp(b))
        });
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn order(name: &str, ids: &[&str]) -> Vec<PartitionId> {
        let mut ids: Vec<PartitionId> = ids.iter().map(|s| s.to_string()).collect();
        RendezvousSelector.select(name, &mut ids);
        ids
    }

    #[test]
    fn test_deterministic_per_name_and_set() {
        let ids = ["p1", "p2", "p3", "p4", "p5"];
        let first = order("some/file.txt", &ids);
        for _ in 0..10 {
            assert_eq!(order("some/file.txt", &ids), first);
        }
    }

    #[test]
    fn test_different_names_spread() {
        let ids = ["p1", "p2", "p3", "p4", "p5"];
        let heads: std::collections::HashSet<PartitionId> = (0..256)
            .map(|i| order(&format!("file-{i}"), &ids)[0].clone())
            .collect();
        // With 256 names over 5 partitions every head gets picked.
        assert_eq!(heads.len(), ids.len());
    }

    #[test]
    fn test_removal_preserves_relative_order() {
        let ids = ["p1", "p2", "p3", "p4", "p5"];
        let full = order("report.csv", &ids);
        for removed in &ids {
            let rest: Vec<&str> = ids.iter().copied().filter(|id| id != removed).collect();
            let reduced = order("report.csv", &rest);
            let expected: Vec<PartitionId> = full
                .iter()
                .filter(|id| id.as_str() != *removed)
                .cloned()
                .collect();
            assert_eq!(reduced, expected);
        }
    }

    proptest! {
        #[test]
        fn prop_removal_only_removes(
            ids in proptest::collection::hash_set("[a-z]{1,8}", 2..10),
            name in "[a-z/]{1,20}",
            pick in any::<prop::sample::Index>(),
        ) {
            let mut ids: Vec<PartitionId> = ids.into_iter().collect();
            ids.sort();
            let removed = ids[pick.index(ids.len())].clone();

            let mut full = ids.clone();
            RendezvousSelector.select(&name, &mut full);

            let mut reduced: Vec<PartitionId> =
                ids.iter().filter(|id| **id != removed).cloned().collect();
            RendezvousSelector.select(&name, &mut reduced);

            let expected: Vec<PartitionId> =
                full.into_iter().filter(|id| *id != removed).collect();
            prop_assert_eq!(reduced, expected);
        }
    }
}
