//! gRPC front-end for the broker.
//!
//! [`GrpcBroker`] implements the generated `CloudEventService`; [`serve`]
//! binds it with the options in [`GrpcServerConfig`].

pub mod config;
pub mod server;
pub mod service;

pub use config::GrpcServerConfig;
pub use server::serve;
pub use service::{GrpcBroker, SubscriptionStream, SUBSCRIPTION_TOPIC_PATTERN};
