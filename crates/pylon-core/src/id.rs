//! Identifier generation for broker entities.
//!
//! Resource ids are opaque strings at every API boundary because sources may
//! supply their own; generation only happens when the repository stores a
//! resource created without one, and for subscriber registrations and broker
//! instances. Generated ids are ULIDs:
//!
//! - **Lexicographically sortable**: encode creation time and sort naturally
//! - **Globally unique**: no coordination required for generation
//! - **URL-safe**: 26 characters of Crockford base32

use ulid::Ulid;

/// Generates a new opaque identifier.
///
/// # Example
///
/// ```rust
/// let id = pylon_core::new_id();
/// assert_eq!(id.len(), 26);
/// ```
#[must_use]
pub fn new_id() -> String {
    Ulid::new().to_string()
}
