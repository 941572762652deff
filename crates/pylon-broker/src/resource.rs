//! The resource record brokered between sources and consumers.
//!
//! A resource carries an opaque desired-state `manifest` authored by a
//! source and an opaque `status` reported back by the consumer's agent. The
//! broker never interprets either beyond the shapes the wire codec needs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Payload shape of a resource, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceType {
    /// A single declarative object.
    Single,
    /// An ordered set of manifests treated as one atomic unit.
    Bundle,
}

/// A declarative resource record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    /// Opaque identifier, unique process-wide and immutable after creation.
    pub id: String,
    /// Identity of the source controller that authored the resource.
    pub source: String,
    /// Identity of the agent the resource targets.
    pub consumer_id: String,
    /// Source-assigned version, non-decreasing in normal operation.
    pub version: i32,
    /// Payload shape; never changes after creation.
    pub resource_type: ResourceType,
    /// Opaque desired-state document.
    pub manifest: Value,
    /// Last reconciled status reported by the agent; see [`ResourceStatus`].
    pub status: Value,
    /// Set when the resource enters deletion; cleared only by external
    /// reconciliation.
    pub deleted_at: Option<DateTime<Utc>>,
    /// Maintained by the repository.
    pub created_at: DateTime<Utc>,
    /// Maintained by the repository.
    pub updated_at: DateTime<Utc>,
}

impl Resource {
    /// Returns true for bundle-shaped resources.
    #[must_use]
    pub fn is_bundle(&self) -> bool {
        self.resource_type == ResourceType::Bundle
    }

    /// Parses the stored status document.
    ///
    /// A null status (nothing reported yet) parses as the default.
    ///
    /// # Errors
    ///
    /// Returns `StatusShapeMismatch` when the stored document does not carry
    /// the expected shape.
    pub fn resource_status(&self) -> Result<ResourceStatus> {
        if self.status.is_null() {
            return Ok(ResourceStatus::default());
        }
        serde_json::from_value(self.status.clone()).map_err(|err| Error::StatusShapeMismatch {
            message: format!("failed to parse stored status of resource {}: {err}", self.id),
        })
    }
}

/// The stored status document: opaque agent content plus reconcile
/// bookkeeping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceStatus {
    /// Opaque status content reported by the agent.
    #[serde(rename = "ContentStatus", default)]
    pub content_status: Value,
    /// Reconcile bookkeeping; absent until the agent reports for the first
    /// time.
    #[serde(rename = "ReconcileStatus", default)]
    pub reconcile_status: Option<ReconcileStatus>,
}

/// Ordering metadata attached to a reported status.
///
/// Status updates are independent of `version` ordering; consumers order
/// them by `observed_version` and the per-source `sequence_id`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileStatus {
    /// The manifest version the agent had applied when it reported.
    #[serde(rename = "ObservedVersion", default)]
    pub observed_version: i32,
    /// Per-source sequence id letting consumers detect reordering.
    #[serde(rename = "SequenceID", default)]
    pub sequence_id: String,
    /// Reconcile conditions in the agent's native shape.
    #[serde(rename = "Conditions", default)]
    pub conditions: Vec<Value>,
}
