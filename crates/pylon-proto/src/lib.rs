//! Generated protobuf and gRPC types for Pylon.
//!
//! This crate provides Rust types generated from the proto/ definitions.
//! The wire contract is the CloudEvents protobuf format plus the
//! `CloudEventService` publish/subscribe endpoint; the typed envelope the
//! broker works with lives in `pylon-broker`.

#![forbid(unsafe_code)]
#![allow(missing_docs)] // Generated code doesn't have docs

#[allow(clippy::all, clippy::cargo, clippy::nursery, clippy::pedantic)]
mod generated {
    // Include generated code; all types are re-exported at crate root.
    include!(concat!(env!("OUT_DIR"), "/pylon.v1.rs"));
}

pub use generated::*;
