//! # pylon-core
//!
//! Core primitives for the Pylon resource broker.
//!
//! This crate provides the foundational pieces shared by the broker
//! components:
//!
//! - **Identifiers**: coordination-free id generation for resources,
//!   subscriber registrations, and broker instances
//! - **Canonical JSON**: deterministic serialization feeding status hashing
//! - **Status Hashing**: the stable hash the resync protocol compares
//! - **Observability**: telemetry bootstrap, the broker's metric-name
//!   contract, and per-operation span constructors
//!
//! ## Crate Boundary
//!
//! `pylon-core` holds only primitives with no broker semantics. The resource
//! model, wire codec, and persistence contracts live in `pylon-broker`.
//!
//! ## Example
//!
//! ```rust
//! use pylon_core::{new_id, status_hash};
//!
//! let id = new_id();
//! assert_eq!(id.len(), 26);
//!
//! let hash = status_hash(&serde_json::json!({"phase": "Ready"}));
//! assert!(hash.is_ok());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod canonical_json;
pub mod id;
pub mod observability;
pub mod status_hash;

pub use canonical_json::{to_canonical_bytes, to_canonical_string, CanonicalJsonError};
pub use id::new_id;
pub use observability::{init_telemetry, TelemetryConfig};
pub use status_hash::status_hash;
