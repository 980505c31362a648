//! Inclusion search: which storage tree holds a given payload

use super::gateway::RecordCursor;
use super::storage_tree::{StorageTree, StorageTreeKey};
use super::trail::{datetime_to_nanos, AuditTrail};
use crate::error::AuditResult;
use crate::merkle::{data_in_storage_tree, Digest, MerkleProof};
use chrono::{DateTime, Utc};

/// Storage tree holding a payload, with the proof tying it to the root
#[derive(Debug, Clone)]
pub struct Inclusion {
    pub key: StorageTreeKey,
    pub root: Digest,
    pub proof: MerkleProof,
}

impl AuditTrail {
    /// Build time of the storage tree of `topic` containing `payload`
    ///
    /// `Ok(None)` when no candidate tree holds it.
    pub fn locate_containing_tree(
        &self,
        payload: &[u8],
        approx: DateTime<Utc>,
        topic: &str,
    ) -> AuditResult<Option<i64>> {
        Ok(self
            .prove_inclusion(payload, approx, topic)?
            .map(|inclusion| inclusion.key.build_time))
    }

    /// Like `locate_containing_tree`, keeping the membership proof
    ///
    /// Candidates are the storage trees built after `approx`, oldest first,
    /// with trees sharing a build time taken in insertion order. At most
    /// `max_search_probes` of them are checked.
    pub fn prove_inclusion(
        &self,
        payload: &[u8],
        approx: DateTime<Utc>,
        topic: &str,
    ) -> AuditResult<Option<Inclusion>> {
        let mut cursor = RecordCursor::after_time(datetime_to_nanos(approx));

        for attempt in 0..self.options.max_search_probes.max(1) {
            let Some((candidate, position)) = self.storage_tree_page(topic, cursor)? else {
                log::debug!("No storage tree of {} after {}", topic, approx);
                return Ok(None);
            };

            if let Some(inclusion) = check_candidate(payload, &candidate) {
                return Ok(Some(inclusion));
            }

            log::debug!(
                "Candidate {}: payload not in storage tree {} of {}",
                attempt + 1,
                candidate.key(),
                topic
            );
            cursor = position;
        }

        Ok(None)
    }
}

fn check_candidate(payload: &[u8], candidate: &StorageTree) -> Option<Inclusion> {
    match data_in_storage_tree(payload, &candidate.tree) {
        (true, Some(proof)) => Some(Inclusion {
            key: candidate.key(),
            root: candidate.tree.root(),
            proof,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit_core::gateway::{AuditPoint, PointSink, Table};
    use crate::audit_core::pool_index::MemoryPoolIndex;
    use crate::audit_core::sqlite_gateway::SqliteGateway;
    use crate::audit_core::storage_tree::RawLeaf;
    use crate::audit_core::trail::{nanos_to_datetime, TrailOptions};
    use crate::merkle::{MerkleTree, StorageBucket};
    use chrono::Duration;
    use std::sync::Arc;

    fn trail_with_probes(max_search_probes: usize) -> AuditTrail {
        AuditTrail::new(
            Arc::new(SqliteGateway::in_memory().unwrap()),
            Arc::new(MemoryPoolIndex::new()),
            TrailOptions {
                max_search_probes,
                ..TrailOptions::default()
            },
        )
    }

    #[test]
    fn test_locates_tree_built_after_approx_time() {
        let trail = trail_with_probes(1);
        let now = Utc::now();
        let t1 = trail
            .seal_batch(
                "prices",
                vec![RawLeaf::new("x", now), RawLeaf::new("y", now)],
            )
            .unwrap();

        let approx = nanos_to_datetime(t1) - Duration::seconds(1);
        assert_eq!(
            trail.locate_containing_tree(b"x", approx, "prices").unwrap(),
            Some(t1)
        );
        assert_eq!(trail.locate_containing_tree(b"z", approx, "prices").unwrap(), None);
    }

    #[test]
    fn test_proof_verifies_against_root() {
        let trail = trail_with_probes(1);
        let t1 = trail
            .seal_batch(
                "prices",
                vec![RawLeaf::new("a", Utc::now()), RawLeaf::new("b", Utc::now())],
            )
            .unwrap();

        let inclusion = trail
            .prove_inclusion(b"b", nanos_to_datetime(t1 - 1), "prices")
            .unwrap()
            .unwrap();
        assert_eq!(inclusion.key.build_time, t1);
        assert_eq!(inclusion.proof.leaf_index, 1);
        assert!(inclusion.proof.verify(&inclusion.root));
    }

    #[test]
    fn test_empty_store_is_not_found() {
        let trail = trail_with_probes(3);
        assert_eq!(
            trail
                .locate_containing_tree(b"x", Utc::now() - Duration::days(1), "prices")
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_single_probe_misses_later_tree() {
        let trail = trail_with_probes(1);
        let t1 = trail
            .seal_batch("prices", vec![RawLeaf::new("first", Utc::now())])
            .unwrap();
        trail
            .seal_batch("prices", vec![RawLeaf::new("second", Utc::now())])
            .unwrap();

        let approx = nanos_to_datetime(t1 - 1);
        assert_eq!(
            trail.locate_containing_tree(b"second", approx, "prices").unwrap(),
            None
        );
    }

    #[test]
    fn test_more_candidates_advance_the_cursor() {
        let trail = trail_with_probes(3);
        let t1 = trail
            .seal_batch("prices", vec![RawLeaf::new("first", Utc::now())])
            .unwrap();
        let t2 = trail
            .seal_batch("prices", vec![RawLeaf::new("second", Utc::now())])
            .unwrap();

        let approx = nanos_to_datetime(t1 - 1);
        assert_eq!(
            trail.locate_containing_tree(b"second", approx, "prices").unwrap(),
            Some(t2)
        );
    }

    #[test]
    fn test_search_scoped_by_topic() {
        let trail = trail_with_probes(2);
        let t1 = trail
            .seal_batch("volumes", vec![RawLeaf::new("x", Utc::now())])
            .unwrap();

        assert_eq!(
            trail
                .locate_containing_tree(b"x", nanos_to_datetime(t1 - 1), "prices")
                .unwrap(),
            None
        );
    }

    /// Storage record written by another process at `build_time`
    fn foreign_storage_point(build_time: i64, payload: &str, leaf_time: i64) -> AuditPoint {
        let mut bucket = StorageBucket::new(payload.as_bytes().to_vec(), nanos_to_datetime(leaf_time));
        bucket.id = format!("{}.0", build_time);
        let tree = MerkleTree::build(vec![bucket]).unwrap();

        AuditPoint::new(Table::Storage, build_time)
            .with_tag("topic", "prices")
            .with_tag("firstDate", leaf_time.to_string())
            .with_tag("lastDate", leaf_time.to_string())
            .with_field("value", serde_json::to_string(&tree).unwrap())
    }

    #[test]
    fn test_trees_sharing_a_build_time_are_both_searched() {
        let store = Arc::new(SqliteGateway::in_memory().unwrap());
        let build_time = 1_700_000_000_000_000_000;
        store
            .write_points(&[
                foreign_storage_point(build_time, "writer-a", build_time - 20),
                foreign_storage_point(build_time, "writer-b", build_time - 10),
            ])
            .unwrap();

        let trail = AuditTrail::new(
            store,
            Arc::new(MemoryPoolIndex::new()),
            TrailOptions {
                max_search_probes: 2,
                ..TrailOptions::default()
            },
        );

        let inclusion = trail
            .prove_inclusion(b"writer-b", nanos_to_datetime(build_time - 1), "prices")
            .unwrap()
            .unwrap();
        assert_eq!(inclusion.key.build_time, build_time);
        assert_eq!(inclusion.key.first_date, build_time - 10);
        assert!(inclusion.proof.verify(&inclusion.root));
    }
}
