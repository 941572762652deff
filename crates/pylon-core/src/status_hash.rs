//! Status hashing for the resync protocol.
//!
//! A status hash is SHA-256 over the canonical JSON bytes of a status
//! document, hex-encoded. Sources remember the hash of the last status they
//! observed per resource; on reconnect they send the hashes back and the
//! broker rebroadcasts only the resources whose stored status hashes differ.
//!
//! Equal documents hash equal regardless of object key order; see
//! [`crate::canonical_json`] for the canonical form.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::canonical_json::{to_canonical_bytes, CanonicalJsonError};

/// Computes the canonical hash of a status document.
///
/// # Errors
///
/// Returns `CanonicalJsonError::Serde` if the document does not convert to a
/// JSON tree.
#[must_use = "status hashes should be compared or stored"]
pub fn status_hash<T: Serialize>(status: &T) -> Result<String, CanonicalJsonError> {
    let bytes = to_canonical_bytes(status)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}
