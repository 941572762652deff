//! Membership-transfer scenarios across dispatchers sharing one store.
//!
//! Two broker instances heartbeat into the same instance repository; when
//! one stops renewing, the survivor's ring absorbs its consumers and the
//! resync coordinator replays their statuses. Time is passed explicitly so
//! the tests never sleep through real heartbeat periods.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

use pylon_broker::broadcaster::{EventBroadcaster, SubscriberCallback};
use pylon_broker::dispatcher::{Dispatcher, DispatcherConfig, HashDispatcher};
use pylon_broker::error::Error;
use pylon_broker::heartbeat::{HeartbeatConfig, HeartbeatRunner};
use pylon_broker::repository::memory::{InMemoryInstanceRepository, InMemoryResourceRepository};
use pylon_broker::repository::{InstanceRepository, ResourceRepository};
use pylon_broker::resource::{Resource, ResourceType};
use pylon_broker::resync::ResyncCoordinator;

const HEARTBEAT_PERIOD: Duration = Duration::from_secs(10);

fn test_config() -> DispatcherConfig {
    DispatcherConfig {
        heartbeat_period: HEARTBEAT_PERIOD,
        check_interval: Duration::from_secs(5),
    }
}

fn resource(id: &str, consumer: &str) -> Resource {
    let now = Utc::now();
    Resource {
        id: id.to_string(),
        source: "src-a".to_string(),
        consumer_id: consumer.to_string(),
        version: 1,
        resource_type: ResourceType::Single,
        manifest: json!({"kind": "ConfigMap"}),
        status: Value::Null,
        deleted_at: None,
        created_at: now,
        updated_at: now,
    }
}

fn recording_callback(tx: mpsc::UnboundedSender<String>) -> SubscriberCallback {
    Arc::new(move |resource: Resource| {
        let tx = tx.clone();
        async move {
            tx.send(resource.id)
                .map_err(|_| Error::transport("receiver gone"))
        }
        .boxed()
    })
}

#[tokio::test]
async fn surviving_instance_absorbs_consumers_and_replays_status() {
    let instances: Arc<InMemoryInstanceRepository> = Arc::new(InMemoryInstanceRepository::new());
    let resources: Arc<InMemoryResourceRepository> = Arc::new(InMemoryResourceRepository::new());
    let start = Utc::now();

    // Two live instances sharing the store.
    let (d1, _signals1) = HashDispatcher::new(
        "i1",
        instances.clone(),
        resources.clone(),
        test_config(),
    );
    let (d2, signals2) = HashDispatcher::new(
        "i2",
        instances.clone(),
        resources.clone(),
        test_config(),
    );

    let runner1 = HeartbeatRunner::new(
        "i1",
        instances.clone(),
        HeartbeatConfig {
            heartbeat_period: HEARTBEAT_PERIOD,
            janitor_grace: Duration::from_secs(600),
        },
    );
    let runner2 = HeartbeatRunner::new(
        "i2",
        instances.clone(),
        HeartbeatConfig {
            heartbeat_period: HEARTBEAT_PERIOD,
            janitor_grace: Duration::from_secs(600),
        },
    );

    runner1.beat(start).await.expect("beat i1");
    runner2.beat(start).await.expect("beat i2");
    d1.refresh_membership(start).await.expect("refresh d1");
    d2.refresh_membership(start).await.expect("refresh d2");

    // Every consumer has exactly one owner across the two rings.
    let consumer = (0..200)
        .map(|i| format!("c-{i}"))
        .find(|c| d1.dispatch(c) && !d2.dispatch(c))
        .expect("a consumer owned by i1");

    for id in ["m1", "m2"] {
        resources
            .create(resource(id, &consumer))
            .await
            .expect("create");
        resources
            .set_status(id, json!({"ContentStatus": {"phase": "Ready"}}))
            .expect("set status");
    }

    // Wire the egress coordinator to a subscriber watching the consumer.
    let broadcaster = Arc::new(EventBroadcaster::new());
    let (tx, mut received) = mpsc::unbounded_channel();
    let (_client, _errors) = broadcaster.register("src-a", &consumer, recording_callback(tx));
    let coordinator = Arc::new(ResyncCoordinator::new(resources.clone(), broadcaster));
    let egress = tokio::spawn(
        coordinator
            .clone()
            .run_egress(d2.clone() as Arc<dyn Dispatcher>, signals2),
    );

    // i1 stops heartbeating. Within 3 × heartbeat_period the survivor's
    // sweep flips it unready and the ring refresh hands its consumers over.
    let later = start + chrono::Duration::seconds(31);
    runner2.beat(later).await.expect("beat i2");
    d2.refresh_membership(later).await.expect("refresh d2");

    assert!(d2.dispatch(&consumer), "i2 must own the consumer now");

    // The ownership transfer replays every resource of the consumer.
    let mut replayed = Vec::new();
    for _ in 0..2 {
        let id = timeout(Duration::from_secs(1), received.recv())
            .await
            .expect("replay in time")
            .expect("replay event");
        replayed.push(id);
    }
    replayed.sort();
    assert_eq!(replayed, ["m1", "m2"]);

    egress.abort();
}

#[tokio::test]
async fn ownership_returns_when_the_instance_recovers() {
    let instances: Arc<InMemoryInstanceRepository> = Arc::new(InMemoryInstanceRepository::new());
    let resources: Arc<InMemoryResourceRepository> = Arc::new(InMemoryResourceRepository::new());
    let start = Utc::now();

    let (d2, _signals) = HashDispatcher::new(
        "i2",
        instances.clone(),
        resources.clone(),
        test_config(),
    );

    instances.heartbeat("i1", start).await.expect("heartbeat i1");
    instances.heartbeat("i2", start).await.expect("heartbeat i2");
    d2.refresh_membership(start).await.expect("refresh");

    let consumer = (0..200)
        .map(|i| format!("c-{i}"))
        .find(|c| !d2.dispatch(c))
        .expect("a consumer owned by i1");

    // i1 goes silent and is flipped unready.
    let failover = start + chrono::Duration::seconds(31);
    instances.heartbeat("i2", failover).await.expect("heartbeat i2");
    instances
        .mark_unready_older_than(failover - chrono::Duration::seconds(30))
        .await
        .expect("mark unready");
    d2.refresh_membership(failover).await.expect("refresh");
    assert!(d2.dispatch(&consumer));

    // i1 comes back: a fresh heartbeat re-adds it and ownership returns.
    let recovery = failover + chrono::Duration::seconds(5);
    instances.heartbeat("i1", recovery).await.expect("heartbeat i1");
    instances.heartbeat("i2", recovery).await.expect("heartbeat i2");
    d2.refresh_membership(recovery).await.expect("refresh");
    assert!(!d2.dispatch(&consumer));
}
