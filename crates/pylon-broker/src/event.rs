//! CloudEvents envelope and event-type grammar for broker events.
//!
//! The broker speaks CloudEvents 1.0 over a protobuf transport. This module
//! provides the typed envelope, the extension attributes the broker
//! requires, and the dotted event-type grammar
//! `<data_type>.<sub_resource>.<action>`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::error::{Error, Result};

/// CloudEvents specification version emitted by the broker.
pub const SPEC_VERSION: &str = "1.0";

/// Content type of JSON event payloads.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Extension attribute carrying the target consumer (cluster) name.
pub const EXTENSION_CLUSTER_NAME: &str = "clustername";
/// Extension attribute carrying the resource id.
pub const EXTENSION_RESOURCE_ID: &str = "resourceid";
/// Extension attribute carrying the resource version.
pub const EXTENSION_RESOURCE_VERSION: &str = "resourceversion";
/// Extension attribute carrying the deletion timestamp.
pub const EXTENSION_DELETION_TIMESTAMP: &str = "deletiontimestamp";
/// Extension attribute carrying the original source on status events.
pub const EXTENSION_ORIGINAL_SOURCE: &str = "originalsource";
/// Extension attribute carrying the status update sequence id.
pub const EXTENSION_SEQUENCE_ID: &str = "statusupdatesequenceid";

/// Standard attribute names carried in the protobuf attribute map.
const ATTRIBUTE_CONTENT_TYPE: &str = "datacontenttype";
const ATTRIBUTE_TIME: &str = "time";

/// Typed value of a CloudEvents extension attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtensionValue {
    /// A string attribute.
    String(String),
    /// An integer attribute.
    Integer(i32),
    /// A boolean attribute.
    Boolean(bool),
    /// A timestamp attribute.
    Timestamp(DateTime<Utc>),
}

impl ExtensionValue {
    /// Returns the value as a string, converting scalars.
    #[must_use]
    pub fn as_string(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Integer(i) => i.to_string(),
            Self::Boolean(b) => b.to_string(),
            Self::Timestamp(t) => t.to_rfc3339(),
        }
    }

    /// Returns the value as an integer.
    ///
    /// String-encoded integers are accepted because extensions degrade to
    /// strings when events round-trip a JSON encoding.
    #[must_use]
    pub fn as_integer(&self) -> Option<i32> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Returns the value as a timestamp; RFC3339 strings are accepted.
    #[must_use]
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(t) => Some(*t),
            Self::String(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|t| t.with_timezone(&Utc)),
            _ => None,
        }
    }
}

/// A CloudEvents 1.0 event as the broker sees it.
#[derive(Debug, Clone)]
pub struct CloudEvent {
    /// Unique event identifier.
    pub id: String,
    /// URI-reference identifying the producer; the broker reads it as the
    /// source controller identity.
    pub source: String,
    /// CloudEvents specification version.
    pub spec_version: String,
    /// Dotted event type; see [`EventType`].
    pub event_type: String,
    /// Content type of `data`.
    pub data_content_type: Option<String>,
    /// Event production time.
    pub time: Option<DateTime<Utc>>,
    /// Extension attributes.
    pub extensions: BTreeMap<String, ExtensionValue>,
    /// JSON payload.
    pub data: Option<Value>,
}

impl CloudEvent {
    /// Creates a new event authored by `source` with a generated id and the
    /// current time.
    #[must_use]
    pub fn new(source: impl Into<String>, event_type: &EventType) -> Self {
        Self {
            id: pylon_core::new_id(),
            source: source.into(),
            spec_version: SPEC_VERSION.to_string(),
            event_type: event_type.to_string(),
            data_content_type: None,
            time: Some(Utc::now()),
            extensions: BTreeMap::new(),
            data: None,
        }
    }

    /// Adds an extension attribute.
    #[must_use]
    pub fn with_extension(mut self, name: impl Into<String>, value: ExtensionValue) -> Self {
        self.extensions.insert(name.into(), value);
        self
    }

    /// Sets a JSON payload and the matching content type.
    #[must_use]
    pub fn with_json_data(mut self, data: Value) -> Self {
        self.data_content_type = Some(CONTENT_TYPE_JSON.to_string());
        self.data = Some(data);
        self
    }

    /// Looks up an extension attribute.
    #[must_use]
    pub fn extension(&self, name: &str) -> Option<&ExtensionValue> {
        self.extensions.get(name)
    }

    /// Returns a required string extension.
    ///
    /// # Errors
    ///
    /// Returns `MalformedEvent` when the extension is absent.
    pub fn require_string_extension(&self, name: &str) -> Result<String> {
        self.extension(name)
            .map(ExtensionValue::as_string)
            .ok_or_else(|| Error::malformed_event(format!("missing {name} extension")))
    }

    /// Returns a required integer extension.
    ///
    /// # Errors
    ///
    /// Returns `MalformedEvent` when the extension is absent or not an
    /// integer.
    pub fn require_integer_extension(&self, name: &str) -> Result<i32> {
        self.extension(name)
            .ok_or_else(|| Error::malformed_event(format!("missing {name} extension")))?
            .as_integer()
            .ok_or_else(|| Error::malformed_event(format!("{name} extension is not an integer")))
    }

    /// Returns an optional timestamp extension.
    ///
    /// # Errors
    ///
    /// Returns `MalformedEvent` when the extension is present but not a
    /// timestamp.
    pub fn optional_timestamp_extension(&self, name: &str) -> Result<Option<DateTime<Utc>>> {
        match self.extension(name) {
            None => Ok(None),
            Some(value) => value.as_timestamp().map(Some).ok_or_else(|| {
                Error::malformed_event(format!("{name} extension is not a timestamp"))
            }),
        }
    }

    /// Returns the JSON payload.
    ///
    /// # Errors
    ///
    /// Returns `MalformedEvent` when the event carries no data.
    pub fn json_data(&self) -> Result<&Value> {
        self.data
            .as_ref()
            .ok_or_else(|| Error::malformed_event("event carries no data"))
    }

    /// Converts a protobuf event into the typed envelope.
    ///
    /// # Errors
    ///
    /// Returns `MalformedEvent` for payloads that are not valid JSON and for
    /// attribute values the broker cannot represent.
    pub fn from_proto(pb: pylon_proto::CloudEvent) -> Result<Self> {
        use pylon_proto::cloud_event::Data;
        use pylon_proto::cloud_event_attribute_value::Attr;

        let mut data_content_type = None;
        let mut time = None;
        let mut extensions = BTreeMap::new();

        for (name, attribute) in pb.attributes {
            let Some(attr) = attribute.attr else {
                continue;
            };
            let value = match attr {
                Attr::CeBoolean(b) => ExtensionValue::Boolean(b),
                Attr::CeInteger(i) => ExtensionValue::Integer(i),
                Attr::CeString(s) | Attr::CeUri(s) | Attr::CeUriRef(s) => {
                    ExtensionValue::String(s)
                }
                Attr::CeTimestamp(ts) => ExtensionValue::Timestamp(timestamp_from_proto(&ts)?),
                Attr::CeBytes(_) => {
                    return Err(Error::malformed_event(format!(
                        "bytes attribute {name} is not supported"
                    )));
                }
            };

            match name.as_str() {
                ATTRIBUTE_CONTENT_TYPE => data_content_type = Some(value.as_string()),
                ATTRIBUTE_TIME => time = value.as_timestamp(),
                _ => {
                    extensions.insert(name, value);
                }
            }
        }

        let data = match pb.data {
            None => None,
            Some(Data::BinaryData(bytes)) => Some(serde_json::from_slice(&bytes).map_err(
                |err| Error::malformed_event(format!("event data is not valid JSON: {err}")),
            )?),
            Some(Data::TextData(text)) => Some(serde_json::from_str(&text).map_err(|err| {
                Error::malformed_event(format!("event data is not valid JSON: {err}"))
            })?),
            Some(Data::ProtoData(_)) => {
                return Err(Error::malformed_event("protobuf event data is not supported"));
            }
        };

        Ok(Self {
            id: pb.id,
            source: pb.source,
            spec_version: pb.spec_version,
            event_type: pb.r#type,
            data_content_type,
            time,
            extensions,
            data,
        })
    }

    /// Converts the envelope into its protobuf representation.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` when the JSON payload cannot be encoded.
    pub fn into_proto(self) -> Result<pylon_proto::CloudEvent> {
        use pylon_proto::cloud_event::Data;
        use pylon_proto::cloud_event_attribute_value::Attr;
        use pylon_proto::CloudEventAttributeValue;

        let mut attributes = BTreeMap::new();

        if let Some(content_type) = self.data_content_type {
            attributes.insert(
                ATTRIBUTE_CONTENT_TYPE.to_string(),
                CloudEventAttributeValue {
                    attr: Some(Attr::CeString(content_type)),
                },
            );
        }
        if let Some(time) = self.time {
            attributes.insert(
                ATTRIBUTE_TIME.to_string(),
                CloudEventAttributeValue {
                    attr: Some(Attr::CeTimestamp(timestamp_to_proto(time))),
                },
            );
        }
        for (name, value) in self.extensions {
            let attr = match value {
                ExtensionValue::String(s) => Attr::CeString(s),
                ExtensionValue::Integer(i) => Attr::CeInteger(i),
                ExtensionValue::Boolean(b) => Attr::CeBoolean(b),
                ExtensionValue::Timestamp(t) => Attr::CeTimestamp(timestamp_to_proto(t)),
            };
            attributes.insert(name, CloudEventAttributeValue { attr: Some(attr) });
        }

        let data = match self.data {
            None => None,
            Some(value) => Some(Data::BinaryData(serde_json::to_vec(&value)?)),
        };

        Ok(pylon_proto::CloudEvent {
            id: self.id,
            source: self.source,
            spec_version: self.spec_version,
            r#type: self.event_type,
            attributes,
            data,
        })
    }
}

fn timestamp_to_proto(t: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: t.timestamp(),
        nanos: i32::try_from(t.timestamp_subsec_nanos()).unwrap_or(0),
    }
}

fn timestamp_from_proto(ts: &prost_types::Timestamp) -> Result<DateTime<Utc>> {
    let nanos = u32::try_from(ts.nanos)
        .map_err(|_| Error::malformed_event("timestamp attribute has negative nanos"))?;
    Utc.timestamp_opt(ts.seconds, nanos)
        .single()
        .ok_or_else(|| Error::malformed_event("timestamp attribute is out of range"))
}

/// Payload family of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDataType {
    /// Single-manifest payloads.
    Manifests,
    /// Manifest-bundle payloads.
    ManifestBundles,
}

impl EventDataType {
    /// The dotted wire name of the data type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Manifests => "io.open-cluster-management.works.v1alpha1.manifests",
            Self::ManifestBundles => "io.open-cluster-management.works.v1alpha1.manifestbundles",
        }
    }
}

impl fmt::Display for EventDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventDataType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "io.open-cluster-management.works.v1alpha1.manifests" => Ok(Self::Manifests),
            "io.open-cluster-management.works.v1alpha1.manifestbundles" => {
                Ok(Self::ManifestBundles)
            }
            other => Err(Error::UnsupportedDataType {
                data_type: other.to_string(),
            }),
        }
    }
}

/// The event's target sub-resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubResource {
    /// Desired-state events.
    Spec,
    /// Status events.
    Status,
}

impl SubResource {
    /// The wire name of the sub-resource.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Spec => "spec",
            Self::Status => "status",
        }
    }
}

impl FromStr for SubResource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "spec" => Ok(Self::Spec),
            "status" => Ok(Self::Status),
            other => Err(Error::malformed_event(format!(
                "unknown sub-resource {other}"
            ))),
        }
    }
}

/// The action an event requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    /// Create a resource.
    CreateRequest,
    /// Update a resource.
    UpdateRequest,
    /// Mark a resource as deleting.
    DeleteRequest,
    /// Resync statuses against a hash manifest.
    ResyncRequest,
}

impl EventAction {
    /// The wire name of the action.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CreateRequest => "create_request",
            Self::UpdateRequest => "update_request",
            Self::DeleteRequest => "delete_request",
            Self::ResyncRequest => "resync_request",
        }
    }
}

impl FromStr for EventAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create_request" => Ok(Self::CreateRequest),
            "update_request" => Ok(Self::UpdateRequest),
            "delete_request" => Ok(Self::DeleteRequest),
            "resync_request" => Ok(Self::ResyncRequest),
            other => Err(Error::UnsupportedAction {
                action: other.to_string(),
            }),
        }
    }
}

/// A parsed `(data_type, sub_resource, action)` triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventType {
    /// Payload family.
    pub data_type: EventDataType,
    /// Target sub-resource.
    pub sub_resource: SubResource,
    /// Requested action.
    pub action: EventAction,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}",
            self.data_type.as_str(),
            self.sub_resource.as_str(),
            self.action.as_str()
        )
    }
}

impl FromStr for EventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        // The data type itself is dotted; the last two segments are the
        // sub-resource and the action.
        let mut segments = s.rsplitn(3, '.');
        let (Some(action), Some(sub_resource), Some(data_type)) =
            (segments.next(), segments.next(), segments.next())
        else {
            return Err(Error::malformed_event(format!(
                "event type {s:?} does not match <data_type>.<sub_resource>.<action>"
            )));
        };

        Ok(Self {
            data_type: data_type.parse()?,
            sub_resource: sub_resource.parse()?,
            action: action.parse()?,
        })
    }
}
