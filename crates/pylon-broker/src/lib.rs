//! # pylon-broker
//!
//! A CloudEvents-typed broker for declarative resource desired-state.
//!
//! Sources publish create/update/delete intents for resources over gRPC;
//! agents subscribe to per-consumer topics and receive the status updates of
//! the resources targeted at them. The broker persists resource state behind
//! a repository contract, mediates version conflicts, and answers status
//! resync requests with hash-diffed deltas.
//!
//! ## Components
//!
//! - [`codec`]: pure translation between wire CloudEvents and the internal
//!   [`resource::Resource`] record
//! - [`repository`]: persistence contracts plus in-memory implementations
//! - [`broadcaster`]: in-process fan-out hub with per-subscriber ordering
//! - [`dispatcher`]: consistent-hash assignment of consumers to broker
//!   instances, driven by heartbeat membership
//! - [`heartbeat`]: instance heartbeating and the stale-instance janitor
//! - [`resync`]: hash-diffed status replay for reconnecting sources and
//!   ownership transfers
//! - [`grpc`]: the `Publish`/`Subscribe` front-end
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use pylon_broker::broadcaster::EventBroadcaster;
//! use pylon_broker::grpc::{serve, GrpcBroker, GrpcServerConfig};
//! use pylon_broker::repository::memory::InMemoryResourceRepository;
//! use pylon_broker::resync::ResyncCoordinator;
//!
//! # async fn run() -> pylon_broker::error::Result<()> {
//! let repository = Arc::new(InMemoryResourceRepository::new());
//! let broadcaster = Arc::new(EventBroadcaster::new());
//! let resync = Arc::new(ResyncCoordinator::new(
//!     repository.clone(),
//!     broadcaster.clone(),
//! ));
//!
//! let broker = GrpcBroker::new(repository, broadcaster, resync);
//! let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! serve(broker, GrpcServerConfig::default(), shutdown_rx).await
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod broadcaster;
pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod grpc;
pub mod heartbeat;
pub mod repository;
pub mod resource;
pub mod resync;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::broadcaster::{EventBroadcaster, SubscriberCallback, CONSUMER_WILDCARD};
    pub use crate::dispatcher::{Dispatcher, DispatcherConfig, HashDispatcher};
    pub use crate::error::{Error, Result};
    pub use crate::event::{CloudEvent, EventAction, EventDataType, EventType, ExtensionValue};
    pub use crate::grpc::{serve, GrpcBroker, GrpcServerConfig};
    pub use crate::heartbeat::{HeartbeatConfig, HeartbeatRunner};
    pub use crate::repository::{InstanceRepository, ResourceRepository, ServerInstance};
    pub use crate::resource::{Resource, ResourceStatus, ResourceType};
    pub use crate::resync::ResyncCoordinator;
}
