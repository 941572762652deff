//! Translation between wire CloudEvents and the internal resource record.
//!
//! Pure and stateless. Decoding maps a spec event onto a [`Resource`];
//! encoding maps a stored status back onto the wire. Two payload shapes
//! exist: a single manifest and a manifest bundle. Bundles are stored as a
//! `ManifestWork`-shaped JSON envelope so the agent side receives the same
//! document regardless of which broker instance serves it.
//!
//! The codec never logs; failures are typed errors surfaced by the gRPC
//! front-end.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::event::{
    CloudEvent, EventAction, EventDataType, EventType, ExtensionValue, SubResource,
    EXTENSION_CLUSTER_NAME, EXTENSION_DELETION_TIMESTAMP, EXTENSION_ORIGINAL_SOURCE,
    EXTENSION_RESOURCE_ID, EXTENSION_RESOURCE_VERSION, EXTENSION_SEQUENCE_ID,
};
use crate::resource::{Resource, ResourceType};

/// Single-manifest payload: one declarative object plus delivery options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ManifestPayload {
    /// The declarative object itself.
    pub manifest: Value,
    /// How the applied object is deleted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete_option: Option<Value>,
    /// Feedback and update-strategy options.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_option: Option<Value>,
}

/// Manifest-bundle payload: an ordered set of manifests sharing policies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ManifestBundlePayload {
    /// The manifests, applied as one atomic unit.
    pub manifests: Vec<Value>,
    /// How the applied objects are deleted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete_option: Option<Value>,
    /// Per-manifest feedback and update-strategy configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_configs: Option<Value>,
}

/// Status payload for a single-manifest resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ManifestStatusPayload {
    /// Reconcile conditions.
    pub conditions: Vec<Value>,
    /// Per-manifest condition and feedback detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ManifestCondition>,
}

/// Condition and feedback detail of one applied manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ManifestCondition {
    /// Conditions of the applied manifest.
    pub conditions: Vec<Value>,
    /// Feedback values collected from the applied manifest.
    pub status_feedbacks: StatusFeedbackResult,
}

/// Collected feedback values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatusFeedbackResult {
    /// The values, in collection order.
    pub values: Vec<FeedbackValue>,
}

/// One named feedback value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackValue {
    /// Feedback rule name.
    pub name: String,
    /// The collected value.
    pub value: FieldValue,
}

/// A typed feedback field value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldValue {
    /// Value type discriminator.
    #[serde(rename = "type")]
    pub value_type: String,
    /// Raw JSON payload for `JsonRaw`-typed values.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_raw: Option<String>,
}

/// Field value type for raw JSON feedback.
pub const FIELD_VALUE_JSON_RAW: &str = "JsonRaw";

/// Status payload for a manifest-bundle resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ManifestBundleStatusPayload {
    /// Reconcile conditions.
    pub conditions: Vec<Value>,
    /// Opaque per-manifest status reported by the agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_status: Option<Value>,
}

/// Decodes a spec CloudEvent into a resource record.
///
/// # Errors
///
/// Returns `MalformedEvent` when a required extension is missing or the
/// payload does not parse; the caller has already resolved the data type, so
/// unknown types never reach here.
pub fn decode(data_type: EventDataType, event: &CloudEvent) -> Result<Resource> {
    let consumer_id = event.require_string_extension(EXTENSION_CLUSTER_NAME)?;
    let id = event.require_string_extension(EXTENSION_RESOURCE_ID)?;
    let version = event.require_integer_extension(EXTENSION_RESOURCE_VERSION)?;
    let deleted_at = event.optional_timestamp_extension(EXTENSION_DELETION_TIMESTAMP)?;

    let data = event.json_data()?;
    let (resource_type, manifest) = match data_type {
        EventDataType::Manifests => {
            let payload: ManifestPayload = serde_json::from_value(data.clone()).map_err(|err| {
                Error::malformed_event(format!("failed to decode manifest payload: {err}"))
            })?;
            (ResourceType::Single, payload.manifest)
        }
        EventDataType::ManifestBundles => {
            let payload: ManifestBundlePayload = serde_json::from_value(data.clone())
                .map_err(|err| {
                    Error::malformed_event(format!(
                        "failed to decode manifest bundle payload: {err}"
                    ))
                })?;
            (ResourceType::Bundle, manifest_work_envelope(&id, payload))
        }
    };

    // created_at/updated_at are placeholders here; the repository owns them.
    let now = Utc::now();
    Ok(Resource {
        id,
        source: event.source.clone(),
        consumer_id,
        version,
        resource_type,
        manifest,
        status: Value::Null,
        deleted_at,
        created_at: now,
        updated_at: now,
    })
}

/// Builds the `ManifestWork`-shaped envelope stored for bundle resources.
fn manifest_work_envelope(id: &str, bundle: ManifestBundlePayload) -> Value {
    json!({
        "kind": "ManifestWork",
        "apiVersion": "work.open-cluster-management.io/v1",
        "metadata": {
            "name": id,
            "uid": id,
        },
        "spec": {
            "workload": {
                "manifests": bundle.manifests,
            },
            "deleteOption": bundle.delete_option,
            "manifestConfigs": bundle.manifest_configs,
        }
    })
}

/// Encodes a resource's stored status as an outbound status CloudEvent.
///
/// # Errors
///
/// Returns `StatusShapeMismatch` when a bundle's content status lacks the
/// `ManifestStatus` field, and `Serialization` when the payload cannot be
/// built.
pub fn encode(resource: &Resource) -> Result<CloudEvent> {
    let event_type = EventType {
        data_type: if resource.is_bundle() {
            EventDataType::ManifestBundles
        } else {
            EventDataType::Manifests
        },
        sub_resource: SubResource::Status,
        action: EventAction::UpdateRequest,
    };

    let status = resource.resource_status()?;

    let mut event = CloudEvent::new(resource.source.clone(), &event_type)
        .with_extension(
            EXTENSION_RESOURCE_ID,
            ExtensionValue::String(resource.id.clone()),
        )
        .with_extension(
            EXTENSION_RESOURCE_VERSION,
            ExtensionValue::Integer(resource.version),
        )
        .with_extension(
            EXTENSION_CLUSTER_NAME,
            ExtensionValue::String(resource.consumer_id.clone()),
        )
        .with_extension(
            EXTENSION_ORIGINAL_SOURCE,
            ExtensionValue::String(resource.source.clone()),
        );

    let conditions = status
        .reconcile_status
        .as_ref()
        .map(|reconcile| reconcile.conditions.clone())
        .unwrap_or_default();

    if let Some(reconcile) = &status.reconcile_status {
        if !reconcile.sequence_id.is_empty() {
            event = event.with_extension(
                EXTENSION_SEQUENCE_ID,
                ExtensionValue::String(reconcile.sequence_id.clone()),
            );
        }
    }

    let payload = if resource.is_bundle() {
        let manifest_status = status
            .content_status
            .get("ManifestStatus")
            .cloned()
            .ok_or_else(|| Error::StatusShapeMismatch {
                message: format!(
                    "ManifestStatus not found in content status of resource {}",
                    resource.id
                ),
            })?;
        serde_json::to_value(ManifestBundleStatusPayload {
            conditions,
            resource_status: Some(manifest_status),
        })?
    } else {
        let content_status_json = serde_json::to_string(&status.content_status)?;
        serde_json::to_value(ManifestStatusPayload {
            conditions: conditions.clone(),
            status: Some(ManifestCondition {
                conditions,
                status_feedbacks: StatusFeedbackResult {
                    values: vec![FeedbackValue {
                        name: "status".to_string(),
                        value: FieldValue {
                            value_type: FIELD_VALUE_JSON_RAW.to_string(),
                            json_raw: Some(content_status_json),
                        },
                    }],
                },
            }),
        })?
    };

    Ok(event.with_json_data(payload))
}

/// Applies the stored-version precedence rule to a bundle update.
///
/// A bundle update carrying a version ahead of the stored row keeps the
/// stored version; the store is authoritative about ordering when a source
/// replays a newer spec version after the broker already assigned a lower
/// effective one. Single-manifest updates are never rewritten.
pub fn reconcile_update_version(stored: &Resource, incoming: &mut Resource) {
    if incoming.resource_type == ResourceType::Bundle && stored.version < incoming.version {
        incoming.version = stored.version;
    }
}
