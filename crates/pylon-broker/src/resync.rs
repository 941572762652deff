//! Status resync: hash-diffed status replay.
//!
//! Ingress: a reconnecting source sends a `resync_request` carrying the
//! status hashes it last observed; the broker rebroadcasts only the
//! resources whose stored status hashes differ. An empty hash list means
//! "send me everything you have for my source".
//!
//! Egress: when ring membership hands this instance a consumer, every
//! resource of that consumer is rebroadcast so its subscribers converge on
//! the new owner.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn, Instrument};

use pylon_core::observability::resync_span;
use pylon_core::status_hash;

use crate::broadcaster::EventBroadcaster;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::event::CloudEvent;
use crate::repository::ResourceRepository;
use crate::resource::Resource;

/// One entry of a resync request: the status hash a source last observed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceStatusHash {
    /// The resource the hash belongs to.
    #[serde(rename = "resourceID")]
    pub resource_id: String,
    /// Hash of the last observed status.
    #[serde(rename = "statusHash")]
    pub status_hash: String,
}

/// Payload of a `resync_request` event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResyncStatusRequest {
    /// Per-resource hashes; empty means "send everything".
    #[serde(default)]
    pub hashes: Vec<ResourceStatusHash>,
}

/// Coordinates ingress and egress status resync.
pub struct ResyncCoordinator {
    repository: Arc<dyn ResourceRepository>,
    broadcaster: Arc<EventBroadcaster>,
}

impl ResyncCoordinator {
    /// Creates a coordinator over the given repository and broadcaster.
    #[must_use]
    pub fn new(repository: Arc<dyn ResourceRepository>, broadcaster: Arc<EventBroadcaster>) -> Self {
        Self {
            repository,
            broadcaster,
        }
    }

    /// Responds to a source's `resync_request`.
    ///
    /// Resources the source does not mention are skipped: the broker waits
    /// for the source to delete them rather than advertising them back. A
    /// resource whose stored status cannot be hashed is skipped as well.
    ///
    /// # Errors
    ///
    /// Returns `MalformedEvent` when the payload does not parse and
    /// propagates repository failures.
    pub async fn respond_resync_request(&self, event: &CloudEvent) -> Result<()> {
        let resources = self.repository.find_by_source(&event.source).await?;

        let request: ResyncStatusRequest = match &event.data {
            Some(data) => serde_json::from_value(data.clone()).map_err(|err| {
                Error::malformed_event(format!("failed to decode status resync request: {err}"))
            })?,
            None => ResyncStatusRequest::default(),
        };

        if request.hashes.is_empty() {
            for resource in resources {
                self.broadcaster.broadcast(&resource);
            }
            return Ok(());
        }

        let last_hashes: HashMap<&str, &str> = request
            .hashes
            .iter()
            .map(|entry| (entry.resource_id.as_str(), entry.status_hash.as_str()))
            .collect();

        for resource in resources {
            let Some(last_hash) = last_hashes.get(resource.id.as_str()) else {
                debug!(resource = %resource.id, "resource unknown to the source, skipping");
                continue;
            };

            let current_hash = match current_status_hash(&resource) {
                Ok(hash) => hash,
                Err(err) => {
                    warn!(resource = %resource.id, error = %err, "failed to hash stored status");
                    continue;
                }
            };

            if current_hash != *last_hash {
                self.broadcaster.broadcast(&resource);
            }
        }
        Ok(())
    }

    /// Rebroadcasts every resource of `consumer_id` this instance owns.
    ///
    /// # Errors
    ///
    /// Propagates repository failures.
    pub async fn resync_consumer(
        &self,
        dispatcher: &dyn Dispatcher,
        consumer_id: &str,
    ) -> Result<()> {
        if !dispatcher.dispatch(consumer_id) {
            return Ok(());
        }
        for resource in self.repository.find_by_consumer(consumer_id).await? {
            // Re-check per resource: ownership may move while we iterate.
            if dispatcher.dispatch(&resource.consumer_id) {
                self.broadcaster.broadcast(&resource);
            }
        }
        Ok(())
    }

    /// Drains ownership-transfer signals until the channel closes.
    pub async fn run_egress(
        self: Arc<Self>,
        dispatcher: Arc<dyn Dispatcher>,
        mut signals: mpsc::UnboundedReceiver<String>,
    ) {
        while let Some(consumer_id) = signals.recv().await {
            let span = resync_span(&consumer_id);
            if let Err(err) = self
                .resync_consumer(dispatcher.as_ref(), &consumer_id)
                .instrument(span)
                .await
            {
                warn!(consumer = %consumer_id, error = %err, "status resync failed");
            }
        }
    }
}

/// Canonical hash of a resource's stored content status.
///
/// # Errors
///
/// Returns `StatusShapeMismatch` when the stored status does not parse.
pub fn current_status_hash(resource: &Resource) -> Result<String> {
    let status = resource.resource_status()?;
    Ok(status_hash(&status.content_status)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::SubscriberCallback;
    use crate::event::{EventAction, EventDataType, EventType, SubResource};
    use crate::resource::ResourceType;
    use chrono::Utc;
    use futures::FutureExt;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::time::timeout;

    fn resource(id: &str, source: &str, consumer: &str, status: Value) -> Resource {
        let now = Utc::now();
        Resource {
            id: id.to_string(),
            source: source.to_string(),
            consumer_id: consumer.to_string(),
            version: 1,
            resource_type: ResourceType::Single,
            manifest: json!({}),
            status,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn resync_event(source: &str, data: Option<Value>) -> CloudEvent {
        let event_type = EventType {
            data_type: EventDataType::Manifests,
            sub_resource: SubResource::Status,
            action: EventAction::ResyncRequest,
        };
        let event = CloudEvent::new(source, &event_type);
        match data {
            Some(data) => event.with_json_data(data),
            None => event,
        }
    }

    fn recording_callback(
        tx: tokio::sync::mpsc::UnboundedSender<String>,
    ) -> SubscriberCallback {
        Arc::new(move |resource: Resource| {
            let tx = tx.clone();
            async move {
                tx.send(resource.id)
                    .map_err(|_| Error::transport("receiver gone"))
            }
            .boxed()
        })
    }

    struct Setup {
        repository: Arc<crate::repository::memory::InMemoryResourceRepository>,
        coordinator: ResyncCoordinator,
        received: tokio::sync::mpsc::UnboundedReceiver<String>,
    }

    fn setup(source_filter: &str, consumer_filter: &str) -> Setup {
        let repository = Arc::new(crate::repository::memory::InMemoryResourceRepository::new());
        let broadcaster = Arc::new(EventBroadcaster::new());
        let (tx, received) = tokio::sync::mpsc::unbounded_channel();
        let (_id, _errors) =
            broadcaster.register(source_filter, consumer_filter, recording_callback(tx));
        let coordinator = ResyncCoordinator::new(repository.clone(), broadcaster);
        Setup {
            repository,
            coordinator,
            received,
        }
    }

    async fn recv(rx: &mut tokio::sync::mpsc::UnboundedReceiver<String>) -> Option<String> {
        timeout(Duration::from_secs(1), rx.recv()).await.ok().flatten()
    }

    async fn assert_quiet(rx: &mut tokio::sync::mpsc::UnboundedReceiver<String>) {
        assert!(
            timeout(Duration::from_millis(50), rx.recv()).await.is_err(),
            "expected no broadcast"
        );
    }

    #[tokio::test]
    async fn empty_hash_list_broadcasts_everything() {
        let mut setup = setup("ctrl-a", "+");
        setup
            .repository
            .create(resource("r1", "ctrl-a", "edge-1", Value::Null))
            .await
            .expect("create");
        setup
            .repository
            .create(resource("r2", "ctrl-a", "edge-2", Value::Null))
            .await
            .expect("create");

        setup
            .coordinator
            .respond_resync_request(&resync_event("ctrl-a", Some(json!({"hashes": []}))))
            .await
            .expect("resync");

        let mut ids = vec![
            recv(&mut setup.received).await.expect("first"),
            recv(&mut setup.received).await.expect("second"),
        ];
        ids.sort();
        assert_eq!(ids, ["r1", "r2"]);
    }

    #[tokio::test]
    async fn differing_hash_is_rebroadcast_equal_hash_is_not() {
        let mut setup = setup("ctrl-a", "+");
        let ready = json!({"ContentStatus": {"phase": "Ready"}});
        setup
            .repository
            .create(resource("r3", "ctrl-a", "edge-1", ready.clone()))
            .await
            .expect("create");
        setup
            .repository
            .create(resource("r4", "ctrl-a", "edge-1", ready))
            .await
            .expect("create");

        let current = current_status_hash(
            &setup.repository.get("r3").await.expect("get"),
        )
        .expect("hash");

        setup
            .coordinator
            .respond_resync_request(&resync_event(
                "ctrl-a",
                Some(json!({"hashes": [
                    {"resourceID": "r3", "statusHash": current},
                    {"resourceID": "r4", "statusHash": "stale-hash"},
                ]})),
            ))
            .await
            .expect("resync");

        assert_eq!(recv(&mut setup.received).await.as_deref(), Some("r4"));
        assert_quiet(&mut setup.received).await;
    }

    #[tokio::test]
    async fn unknown_resource_id_is_ignored() {
        let mut setup = setup("ctrl-a", "+");
        setup
            .repository
            .create(resource("r5", "ctrl-a", "edge-1", Value::Null))
            .await
            .expect("create");

        // The request only mentions an id the broker has; r5 is absent from
        // the source's list and must not be advertised back.
        setup
            .coordinator
            .respond_resync_request(&resync_event(
                "ctrl-a",
                Some(json!({"hashes": [
                    {"resourceID": "ghost", "statusHash": "whatever"},
                ]})),
            ))
            .await
            .expect("resync");

        assert_quiet(&mut setup.received).await;
    }

    #[tokio::test]
    async fn missing_payload_means_send_everything() {
        let mut setup = setup("ctrl-a", "+");
        setup
            .repository
            .create(resource("r6", "ctrl-a", "edge-1", Value::Null))
            .await
            .expect("create");

        setup
            .coordinator
            .respond_resync_request(&resync_event("ctrl-a", None))
            .await
            .expect("resync");

        assert_eq!(recv(&mut setup.received).await.as_deref(), Some("r6"));
    }

    #[tokio::test]
    async fn egress_resync_respects_the_dispatcher() {
        use crate::dispatcher::AlwaysDispatcher;

        let mut setup = setup("ctrl-a", "+");
        setup
            .repository
            .create(resource("r7", "ctrl-a", "edge-1", Value::Null))
            .await
            .expect("create");
        setup
            .repository
            .create(resource("r8", "ctrl-a", "edge-2", Value::Null))
            .await
            .expect("create");

        setup
            .coordinator
            .resync_consumer(&AlwaysDispatcher, "edge-1")
            .await
            .expect("resync");

        assert_eq!(recv(&mut setup.received).await.as_deref(), Some("r7"));
        assert_quiet(&mut setup.received).await;

        struct NeverDispatcher;
        impl Dispatcher for NeverDispatcher {
            fn dispatch(&self, _consumer_id: &str) -> bool {
                false
            }
        }

        setup
            .coordinator
            .resync_consumer(&NeverDispatcher, "edge-2")
            .await
            .expect("resync");
        assert_quiet(&mut setup.received).await;
    }
}
