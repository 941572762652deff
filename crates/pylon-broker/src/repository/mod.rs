//! Persistence contracts consumed by the broker core.
//!
//! The broker addresses the store exclusively through these traits; schema,
//! migrations, and transactionality belong to the implementation behind
//! them.
//!
//! ## Design Principles
//!
//! - **Contract only**: the core never sees tables or connections
//! - **Testability**: in-memory implementations for tests and development
//! - **Thread safety**: all methods are `Send + Sync` for concurrent access
//!   from gRPC handlers and background runners

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::resource::Resource;

/// A broker process registered in the store for membership discovery.
///
/// Used only by the status dispatcher to compute the consistent-hash ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInstance {
    /// Unique instance identifier.
    pub id: String,
    /// Last time the instance renewed itself.
    pub last_heartbeat: DateTime<Utc>,
    /// False once the heartbeat ages out.
    pub ready: bool,
}

/// Persistence contract for resources.
#[async_trait]
pub trait ResourceRepository: Send + Sync {
    /// Snapshot read by id.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the id is absent.
    async fn get(&self, id: &str) -> Result<Resource>;

    /// Stores a new resource, assigning an id when the given one is empty.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` when the id already exists, including ids still in
    /// deletion; `deleted_at` is cleared only by external reconciliation.
    async fn create(&self, resource: Resource) -> Result<Resource>;

    /// Merges the spec fields of an existing resource. The stored status is
    /// preserved.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the id is absent.
    async fn update(&self, resource: Resource) -> Result<Resource>;

    /// Sets the deletion timestamp. Idempotent: a second call is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the id is absent; the broker boundary
    /// tolerates that as success.
    async fn mark_as_deleting(&self, id: &str) -> Result<()>;

    /// All resources authored by `source`.
    async fn find_by_source(&self, source: &str) -> Result<Vec<Resource>>;

    /// All resources targeted at `consumer_id`.
    async fn find_by_consumer(&self, consumer_id: &str) -> Result<Vec<Resource>>;

    /// Distinct consumer ids present in the store.
    async fn list_consumers(&self) -> Result<Vec<String>>;
}

/// Persistence contract for server-instance membership rows.
#[async_trait]
pub trait InstanceRepository: Send + Sync {
    /// Upserts the instance row with a fresh heartbeat and `ready = true`.
    async fn heartbeat(&self, instance_id: &str, now: DateTime<Utc>) -> Result<()>;

    /// All registered instances.
    async fn list(&self) -> Result<Vec<ServerInstance>>;

    /// Marks instances whose heartbeat is older than `cutoff` as unready.
    /// Returns the number of instances flipped.
    async fn mark_unready_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    /// Deletes instances whose heartbeat is older than `cutoff`. Returns the
    /// number removed.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}
