//! In-memory repository implementations for tests and development.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: no durability, no cross-process
//!   coordination
//! - **Single-process only**: state is not shared across process boundaries

use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{InstanceRepository, ResourceRepository, ServerInstance};
use crate::error::{Error, Result};
use crate::resource::Resource;

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

/// In-memory resource repository.
///
/// Thread-safe via `RwLock`; every operation takes a full snapshot or a
/// short exclusive section, mirroring the row-level behavior of a relational
/// store closely enough for broker tests.
#[derive(Debug, Default)]
pub struct InMemoryResourceRepository {
    resources: RwLock<HashMap<String, Resource>>,
}

impl InMemoryResourceRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of resources currently stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn resource_count(&self) -> Result<usize> {
        let count = {
            let resources = self.resources.read().map_err(poison_err)?;
            resources.len()
        };
        Ok(count)
    }

    /// Replaces the stored status of a resource.
    ///
    /// Test hook: agent status ingest lands through a separate surface in a
    /// real deployment, but broker tests need statuses in the store.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the id is absent.
    pub fn set_status(&self, id: &str, status: Value) -> Result<()> {
        let mut resources = self.resources.write().map_err(poison_err)?;
        let resource = resources
            .get_mut(id)
            .ok_or_else(|| Error::not_found("resource", id))?;
        resource.status = status;
        resource.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl ResourceRepository for InMemoryResourceRepository {
    async fn get(&self, id: &str) -> Result<Resource> {
        let resources = self.resources.read().map_err(poison_err)?;
        resources
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("resource", id))
    }

    async fn create(&self, resource: Resource) -> Result<Resource> {
        let mut resource = resource;
        if resource.id.is_empty() {
            resource.id = pylon_core::new_id();
        }

        let now = Utc::now();
        resource.created_at = now;
        resource.updated_at = now;

        let mut resources = self.resources.write().map_err(poison_err)?;
        if resources.contains_key(&resource.id) {
            return Err(Error::conflict("resource", resource.id));
        }
        resources.insert(resource.id.clone(), resource.clone());
        Ok(resource)
    }

    async fn update(&self, resource: Resource) -> Result<Resource> {
        let mut resources = self.resources.write().map_err(poison_err)?;
        let stored = resources
            .get_mut(&resource.id)
            .ok_or_else(|| Error::not_found("resource", resource.id.clone()))?;

        // Merge spec fields; status, identity, and timestamps of record stay.
        stored.version = resource.version;
        stored.manifest = resource.manifest;
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    async fn mark_as_deleting(&self, id: &str) -> Result<()> {
        let mut resources = self.resources.write().map_err(poison_err)?;
        let stored = resources
            .get_mut(id)
            .ok_or_else(|| Error::not_found("resource", id))?;

        if stored.deleted_at.is_none() {
            let now = Utc::now();
            stored.deleted_at = Some(now);
            stored.updated_at = now;
        }
        Ok(())
    }

    async fn find_by_source(&self, source: &str) -> Result<Vec<Resource>> {
        let resources = self.resources.read().map_err(poison_err)?;
        let mut found: Vec<Resource> = resources
            .values()
            .filter(|r| r.source == source)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    async fn find_by_consumer(&self, consumer_id: &str) -> Result<Vec<Resource>> {
        let resources = self.resources.read().map_err(poison_err)?;
        let mut found: Vec<Resource> = resources
            .values()
            .filter(|r| r.consumer_id == consumer_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    async fn list_consumers(&self) -> Result<Vec<String>> {
        let resources = self.resources.read().map_err(poison_err)?;
        let consumers: BTreeSet<String> = resources
            .values()
            .map(|r| r.consumer_id.clone())
            .collect();
        Ok(consumers.into_iter().collect())
    }
}

/// In-memory server-instance repository.
#[derive(Debug, Default)]
pub struct InMemoryInstanceRepository {
    instances: RwLock<HashMap<String, ServerInstance>>,
}

impl InMemoryInstanceRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceRepository for InMemoryInstanceRepository {
    async fn heartbeat(&self, instance_id: &str, now: DateTime<Utc>) -> Result<()> {
        let mut instances = self.instances.write().map_err(poison_err)?;
        instances.insert(
            instance_id.to_string(),
            ServerInstance {
                id: instance_id.to_string(),
                last_heartbeat: now,
                ready: true,
            },
        );
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ServerInstance>> {
        let instances = self.instances.read().map_err(poison_err)?;
        let mut listed: Vec<ServerInstance> = instances.values().cloned().collect();
        listed.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(listed)
    }

    async fn mark_unready_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut instances = self.instances.write().map_err(poison_err)?;
        let mut flipped = 0;
        for instance in instances.values_mut() {
            if instance.ready && instance.last_heartbeat < cutoff {
                instance.ready = false;
                flipped += 1;
            }
        }
        Ok(flipped)
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut instances = self.instances.write().map_err(poison_err)?;
        let before = instances.len();
        instances.retain(|_, instance| instance.last_heartbeat >= cutoff);
        Ok(before - instances.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceType;
    use chrono::Duration;
    use serde_json::json;

    fn resource(id: &str, source: &str, consumer: &str) -> Resource {
        let now = Utc::now();
        Resource {
            id: id.to_string(),
            source: source.to_string(),
            consumer_id: consumer.to_string(),
            version: 1,
            resource_type: ResourceType::Single,
            manifest: json!({"kind": "ConfigMap"}),
            status: Value::Null,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn create_assigns_id_when_empty() {
        let repo = InMemoryResourceRepository::new();
        let created = repo
            .create(resource("", "ctrl-a", "edge-1"))
            .await
            .expect("create");
        assert_eq!(created.id.len(), 26);
        assert!(repo.get(&created.id).await.is_ok());
    }

    #[tokio::test]
    async fn create_existing_id_conflicts() {
        let repo = InMemoryResourceRepository::new();
        repo.create(resource("r1", "ctrl-a", "edge-1"))
            .await
            .expect("create");

        let err = repo
            .create(resource("r1", "ctrl-a", "edge-1"))
            .await
            .expect_err("should conflict");
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn create_over_soft_deleted_id_conflicts() {
        let repo = InMemoryResourceRepository::new();
        repo.create(resource("r1", "ctrl-a", "edge-1"))
            .await
            .expect("create");
        repo.mark_as_deleting("r1").await.expect("mark deleting");

        // The row is authoritative until external reconciliation removes it.
        let err = repo
            .create(resource("r1", "ctrl-a", "edge-1"))
            .await
            .expect_err("should conflict");
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn update_merges_spec_and_preserves_status() {
        let repo = InMemoryResourceRepository::new();
        let created = repo
            .create(resource("r1", "ctrl-a", "edge-1"))
            .await
            .expect("create");
        repo.set_status("r1", json!({"ContentStatus": {"phase": "Ready"}}))
            .expect("set status");

        let mut incoming = created;
        incoming.version = 2;
        incoming.manifest = json!({"kind": "ConfigMap", "data": {"k": "v2"}});
        let updated = repo.update(incoming).await.expect("update");

        assert_eq!(updated.version, 2);
        assert_eq!(updated.manifest["data"]["k"], "v2");
        assert_eq!(updated.status["ContentStatus"]["phase"], "Ready");
    }

    #[tokio::test]
    async fn update_unknown_id_is_not_found() {
        let repo = InMemoryResourceRepository::new();
        let err = repo
            .update(resource("ghost", "ctrl-a", "edge-1"))
            .await
            .expect_err("should fail");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn mark_as_deleting_is_idempotent() {
        let repo = InMemoryResourceRepository::new();
        repo.create(resource("r1", "ctrl-a", "edge-1"))
            .await
            .expect("create");

        repo.mark_as_deleting("r1").await.expect("first mark");
        let first = repo.get("r1").await.expect("get").deleted_at;
        assert!(first.is_some());

        repo.mark_as_deleting("r1").await.expect("second mark");
        let second = repo.get("r1").await.expect("get").deleted_at;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn mark_as_deleting_unknown_id_is_not_found() {
        let repo = InMemoryResourceRepository::new();
        let err = repo.mark_as_deleting("ghost").await.expect_err("should fail");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn finds_by_source_and_consumer() {
        let repo = InMemoryResourceRepository::new();
        repo.create(resource("r1", "ctrl-a", "edge-1"))
            .await
            .expect("create");
        repo.create(resource("r2", "ctrl-a", "edge-2"))
            .await
            .expect("create");
        repo.create(resource("r3", "ctrl-b", "edge-1"))
            .await
            .expect("create");

        let by_source = repo.find_by_source("ctrl-a").await.expect("find");
        assert_eq!(
            by_source.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["r1", "r2"]
        );

        let by_consumer = repo.find_by_consumer("edge-1").await.expect("find");
        assert_eq!(
            by_consumer.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["r1", "r3"]
        );
    }

    #[tokio::test]
    async fn lists_distinct_consumers() {
        let repo = InMemoryResourceRepository::new();
        repo.create(resource("r1", "ctrl-a", "edge-1"))
            .await
            .expect("create");
        repo.create(resource("r2", "ctrl-a", "edge-1"))
            .await
            .expect("create");
        repo.create(resource("r3", "ctrl-b", "edge-2"))
            .await
            .expect("create");

        let consumers = repo.list_consumers().await.expect("list");
        assert_eq!(consumers, vec!["edge-1", "edge-2"]);
    }

    #[tokio::test]
    async fn heartbeat_upserts_and_marks_ready() {
        let repo = InMemoryInstanceRepository::new();
        let now = Utc::now();

        repo.heartbeat("i1", now).await.expect("heartbeat");
        let listed = repo.list().await.expect("list");
        assert_eq!(listed.len(), 1);
        assert!(listed[0].ready);
        assert_eq!(listed[0].last_heartbeat, now);

        // A fresh heartbeat revives an unready instance.
        repo.mark_unready_older_than(now + Duration::seconds(1))
            .await
            .expect("mark unready");
        repo.heartbeat("i1", now + Duration::seconds(2))
            .await
            .expect("heartbeat");
        assert!(repo.list().await.expect("list")[0].ready);
    }

    #[tokio::test]
    async fn stale_instances_are_flipped_and_purged() {
        let repo = InMemoryInstanceRepository::new();
        let now = Utc::now();

        repo.heartbeat("fresh", now).await.expect("heartbeat");
        repo.heartbeat("stale", now - Duration::seconds(120))
            .await
            .expect("heartbeat");

        let flipped = repo
            .mark_unready_older_than(now - Duration::seconds(60))
            .await
            .expect("mark unready");
        assert_eq!(flipped, 1);

        let listed = repo.list().await.expect("list");
        assert!(listed.iter().any(|i| i.id == "stale" && !i.ready));
        assert!(listed.iter().any(|i| i.id == "fresh" && i.ready));

        let purged = repo
            .purge_older_than(now - Duration::seconds(60))
            .await
            .expect("purge");
        assert_eq!(purged, 1);
        assert_eq!(repo.list().await.expect("list").len(), 1);
    }
}
