//! Consistent-hash ring assigning consumers to broker instances.
//!
//! Ring points are the first 8 bytes (big endian) of SHA-256 over
//! `"<instance>#<vnode>"`, a hash that is stable across releases. Lookup
//! walks clockwise to the first point at or after the consumer's hash,
//! wrapping at the end. Point collisions tie-break lexicographically on
//! instance id, so two instances always build identical rings from the same
//! membership.

use sha2::{Digest, Sha256};

/// Virtual nodes carried by each instance on the ring.
pub const VIRTUAL_NODES_PER_INSTANCE: u32 = 100;

/// An immutable consistent-hash ring snapshot.
///
/// Built in full, then shared; never mutated in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HashRing {
    /// Ring points sorted by `(hash, instance)`.
    points: Vec<(u64, String)>,
    /// Sorted, deduplicated member ids; the ring's membership identity.
    instances: Vec<String>,
}

impl HashRing {
    /// Builds a ring over the given instance ids.
    #[must_use]
    pub fn build(instances: impl IntoIterator<Item = String>) -> Self {
        let mut ids: Vec<String> = instances.into_iter().collect();
        ids.sort();
        ids.dedup();

        let mut points =
            Vec::with_capacity(ids.len() * VIRTUAL_NODES_PER_INSTANCE as usize);
        for id in &ids {
            for vnode in 0..VIRTUAL_NODES_PER_INSTANCE {
                points.push((hash_point(&format!("{id}#{vnode}")), id.clone()));
            }
        }
        points.sort();

        Self {
            points,
            instances: ids,
        }
    }

    /// True when the ring has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// The ring's members, sorted.
    #[must_use]
    pub fn instances(&self) -> &[String] {
        &self.instances
    }

    /// Returns the instance owning `key`, or `None` on an empty ring.
    ///
    /// Binary search over the point list: O(log(N·V)).
    #[must_use]
    pub fn owner(&self, key: &str) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }
        let hash = hash_point(key);
        let idx = self.points.partition_point(|(point, _)| *point < hash);
        let (_, instance) = self.points.get(idx).unwrap_or(&self.points[0]);
        Some(instance)
    }
}

fn hash_point(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0_u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}
