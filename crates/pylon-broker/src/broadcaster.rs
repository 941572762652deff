//! In-process fan-out hub routing resource updates to subscribers.
//!
//! Producers call [`EventBroadcaster::broadcast`]; every registration whose
//! source and consumer filters match receives the resource exactly once, in
//! broadcast order. Delivery is concurrent across subscribers and serialized
//! within one: each registration owns a forwarding task fed by an unbounded
//! FIFO queue, so a stalled subscriber never blocks producers or its peers.
//!
//! Callback failures (including panics, which are caught) are pushed once
//! to the registration's error channel and delivery stops; the owner of the
//! registration decides to unregister. Errors from one subscriber never
//! affect another.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;

use crate::error::Error;
use crate::resource::Resource;

/// Consumer filter value matching every consumer.
pub const CONSUMER_WILDCARD: &str = "+";

/// Callback invoked for each matched broadcast.
///
/// The future completes when the resource has been handed to the subscriber
/// (for gRPC subscribers, when `stream.Send` returns); delivery to the next
/// queued resource waits for it.
pub type SubscriberCallback =
    Arc<dyn Fn(Resource) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

struct Registration {
    source: String,
    consumer: String,
    queue: mpsc::UnboundedSender<Resource>,
    closed: Arc<AtomicBool>,
}

impl Registration {
    fn matches(&self, resource: &Resource) -> bool {
        self.source == resource.source
            && (self.consumer == CONSUMER_WILDCARD || self.consumer == resource.consumer_id)
    }
}

/// In-process fan-out hub.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
#[derive(Default)]
pub struct EventBroadcaster {
    subscribers: RwLock<HashMap<String, Registration>>,
}

impl EventBroadcaster {
    /// Creates a broadcaster with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber for `source` and `consumer` (`"+"` matches
    /// every consumer).
    ///
    /// Returns the registration's client id and its error channel. The
    /// channel yields at most one error and closes when the registration is
    /// torn down.
    ///
    /// Must be called within a Tokio runtime: the forwarding task is spawned
    /// here.
    #[must_use]
    pub fn register(
        &self,
        source: &str,
        consumer: &str,
        callback: SubscriberCallback,
    ) -> (String, mpsc::UnboundedReceiver<Error>) {
        let client_id = pylon_core::new_id();
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(forward(queue_rx, callback, error_tx, Arc::clone(&closed)));

        let registration = Registration {
            source: source.to_string(),
            consumer: consumer.to_string(),
            queue: queue_tx,
            closed,
        };

        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.insert(client_id.clone(), registration);

        (client_id, error_rx)
    }

    /// Dispatches `resource` to every matching subscriber.
    ///
    /// Never blocks on subscribers: matching registrations are collected
    /// under the lock, then the resource is pushed onto their queues.
    pub fn broadcast(&self, resource: &Resource) {
        let targets: Vec<mpsc::UnboundedSender<Resource>> = {
            let subscribers = self
                .subscribers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            subscribers
                .values()
                .filter(|registration| registration.matches(resource))
                .map(|registration| registration.queue.clone())
                .collect()
        };

        for queue in targets {
            // A send failure means the forwarding task already stopped;
            // the registration is being torn down.
            let _ = queue.send(resource.clone());
        }
    }

    /// Removes a registration. Idempotent.
    ///
    /// After return no further callbacks start for this id; an in-flight
    /// callback drains on its own task. The error channel closes once the
    /// forwarding task exits.
    pub fn unregister(&self, client_id: &str) {
        let removed = {
            let mut subscribers = self
                .subscribers
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            subscribers.remove(client_id)
        };
        if let Some(registration) = removed {
            registration.closed.store(true, Ordering::Release);
        }
    }

    /// Returns the number of live registrations.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Per-registration forwarding loop: FIFO, one callback at a time.
async fn forward(
    mut queue: mpsc::UnboundedReceiver<Resource>,
    callback: SubscriberCallback,
    error_tx: mpsc::UnboundedSender<Error>,
    closed: Arc<AtomicBool>,
) {
    while let Some(resource) = queue.recv().await {
        if closed.load(Ordering::Acquire) {
            break;
        }

        match AssertUnwindSafe((callback)(resource)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = error_tx.send(err);
                break;
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "subscriber callback panicked".to_string());
                let _ = error_tx.send(Error::internal(format!(
                    "subscriber callback panicked: {message}"
                )));
                break;
            }
        }
    }
}
