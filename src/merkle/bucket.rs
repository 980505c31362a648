//! Leaf content types: storage buckets and pooled identifiers

use super::{Content, MerkleProof, MerkleTree};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Smallest content-addressed unit of audited data
///
/// `id` has the form `<buildTimeNanos>.<leafIndex>` once the bucket is part of
/// a sealed storage tree; it is empty before sealing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageBucket {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(with = "hex_payload")]
    pub payload: Vec<u8>,
}

impl StorageBucket {
    pub fn new(payload: Vec<u8>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: String::new(),
            timestamp,
            payload,
        }
    }

    /// Raw content held by the bucket
    pub fn read_content(&self) -> &[u8] {
        &self.payload
    }
}

impl Content for StorageBucket {
    fn content_bytes(&self) -> &[u8] {
        &self.payload
    }
}

/// Child identifier pooled into a daily tree
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoolId(String);

impl PoolId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Content for PoolId {
    fn content_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

/// Check whether `data` is the payload of a bucket in `tree`
pub fn data_in_storage_tree(
    data: &[u8],
    tree: &MerkleTree<StorageBucket>,
) -> (bool, Option<MerkleProof>) {
    tree.membership(|bucket| bucket.payload == data)
}

mod hex_payload {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bucket(payload: &str, secs: i64) -> StorageBucket {
        StorageBucket::new(
            payload.as_bytes().to_vec(),
            Utc.timestamp_opt(secs, 0).unwrap(),
        )
    }

    #[test]
    fn test_data_in_storage_tree() {
        let tree = MerkleTree::build(vec![
            bucket("btc:64000", 1_700_000_000),
            bucket("eth:3100", 1_700_000_001),
        ])
        .unwrap();

        let (found, proof) = data_in_storage_tree(b"eth:3100", &tree);
        assert!(found);
        assert!(proof.unwrap().verify(&tree.root()));

        let (found, _) = data_in_storage_tree(b"sol:150", &tree);
        assert!(!found);
    }

    #[test]
    fn test_payload_serialized_as_hex() {
        let b = bucket("abc", 1_700_000_000);
        let json = serde_json::to_value(&b).unwrap();
        assert_eq!(json["payload"], "616263");

        let restored: StorageBucket = serde_json::from_value(json).unwrap();
        assert_eq!(restored, b);
    }

    #[test]
    fn test_content_hash_ignores_id() {
        let mut a = bucket("same", 1);
        let b = bucket("same", 1);
        a.id = "123.0".to_string();
        assert_eq!(a.content_hash(), b.content_hash());
    }
}
