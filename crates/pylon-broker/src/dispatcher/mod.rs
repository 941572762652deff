//! Status dispatch: which broker instance emits a consumer's status updates.
//!
//! Every broker instance heartbeats a server-instance row; the dispatcher
//! hashes the live membership onto a consistent-hash ring and answers
//! [`Dispatcher::dispatch`] for the consumers this instance owns. Membership
//! is refreshed on a fixed interval; when ownership of a consumer transfers
//! to this instance, a resync signal is emitted so the resync coordinator
//! replays that consumer's statuses.
//!
//! ## Ring atomicity
//!
//! The ring is rebuilt into a new immutable snapshot and swapped under a
//! short write lock; `dispatch` clones the current snapshot and reads it
//! without holding the lock. Readers never observe a partially built ring.

pub mod ring;

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use pylon_core::observability::METRIC_STATUS_RESYNCS;

use crate::error::Result;
use crate::repository::{InstanceRepository, ResourceRepository};
use ring::HashRing;

/// Decides whether this instance emits status updates for a consumer.
pub trait Dispatcher: Send + Sync {
    /// True iff the local instance currently owns `consumer_id`.
    fn dispatch(&self, consumer_id: &str) -> bool;
}

/// A dispatcher that owns every consumer.
///
/// For single-instance deployments and tests; sharding only matters once
/// several brokers share a store.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysDispatcher;

impl Dispatcher for AlwaysDispatcher {
    fn dispatch(&self, _consumer_id: &str) -> bool {
        true
    }
}

/// Configuration for the hash dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How often every instance renews its heartbeat. An instance is live
    /// while its heartbeat is younger than three periods.
    pub heartbeat_period: Duration,
    /// How often membership is re-read from the store.
    pub check_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            heartbeat_period: Duration::from_secs(10),
            check_interval: Duration::from_secs(5),
        }
    }
}

impl DispatcherConfig {
    /// The liveness window: `3 × heartbeat_period`.
    #[must_use]
    pub fn liveness_window(&self) -> chrono::Duration {
        let millis = i64::try_from(self.heartbeat_period.as_millis()).unwrap_or(i64::MAX / 4);
        chrono::Duration::milliseconds(millis.saturating_mul(3))
    }
}

/// Consistent-hash status dispatcher.
pub struct HashDispatcher {
    instance_id: String,
    instance_repository: Arc<dyn InstanceRepository>,
    resource_repository: Arc<dyn ResourceRepository>,
    config: DispatcherConfig,
    ring: RwLock<Arc<HashRing>>,
    resync_tx: mpsc::UnboundedSender<String>,
}

impl HashDispatcher {
    /// Creates a dispatcher whose initial ring holds only the local
    /// instance.
    ///
    /// Returns the dispatcher and the receiver of ownership-transfer resync
    /// signals, consumed by the resync coordinator.
    #[must_use]
    pub fn new(
        instance_id: impl Into<String>,
        instance_repository: Arc<dyn InstanceRepository>,
        resource_repository: Arc<dyn ResourceRepository>,
        config: DispatcherConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let instance_id = instance_id.into();
        let (resync_tx, resync_rx) = mpsc::unbounded_channel();
        let initial = HashRing::build([instance_id.clone()]);

        let dispatcher = Arc::new(Self {
            instance_id,
            instance_repository,
            resource_repository,
            config,
            ring: RwLock::new(Arc::new(initial)),
            resync_tx,
        });
        (dispatcher, resync_rx)
    }

    /// The current ring snapshot.
    fn snapshot(&self) -> Arc<HashRing> {
        self.ring
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Re-reads membership and rebuilds the ring when it changed.
    ///
    /// Live means `ready` with a heartbeat inside the liveness window; the
    /// local instance is always a member while it is alive. For every
    /// consumer whose ownership transferred to this instance, one resync
    /// signal is emitted.
    ///
    /// # Errors
    ///
    /// Propagates repository failures; the ring keeps its previous snapshot.
    pub async fn refresh_membership(&self, now: DateTime<Utc>) -> Result<()> {
        let cutoff = now - self.config.liveness_window();
        let mut live: Vec<String> = self
            .instance_repository
            .list()
            .await?
            .into_iter()
            .filter(|instance| instance.ready && instance.last_heartbeat >= cutoff)
            .map(|instance| instance.id)
            .collect();
        live.push(self.instance_id.clone());

        let next = Arc::new(HashRing::build(live));
        let previous = self.snapshot();
        if next.instances() == previous.instances() {
            return Ok(());
        }

        info!(
            instance = %self.instance_id,
            members = ?next.instances(),
            "hash ring membership changed"
        );

        // Swap before signaling so egress resyncs observe the new ring.
        {
            let mut ring = self.ring.write().unwrap_or_else(PoisonError::into_inner);
            *ring = Arc::clone(&next);
        }

        let local = self.instance_id.as_str();
        for consumer in self.resource_repository.list_consumers().await? {
            let owned_before = previous.owner(&consumer) == Some(local);
            let owned_now = next.owner(&consumer) == Some(local);
            if owned_now && !owned_before {
                counter!(METRIC_STATUS_RESYNCS, "consumer" => consumer.clone()).increment(1);
                let _ = self.resync_tx.send(consumer);
            }
        }
        Ok(())
    }

    /// Runs the periodic membership refresh until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.check_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.refresh_membership(Utc::now()).await {
                        warn!(error = %err, "membership refresh failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

impl Dispatcher for HashDispatcher {
    fn dispatch(&self, consumer_id: &str) -> bool {
        self.snapshot().owner(consumer_id) == Some(self.instance_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::{InMemoryInstanceRepository, InMemoryResourceRepository};
    use crate::resource::{Resource, ResourceType};
    use serde_json::{json, Value};

    fn test_config() -> DispatcherConfig {
        DispatcherConfig {
            heartbeat_period: Duration::from_secs(10),
            check_interval: Duration::from_secs(5),
        }
    }

    fn resource(id: &str, consumer: &str) -> Resource {
        let now = Utc::now();
        Resource {
            id: id.to_string(),
            source: "ctrl-a".to_string(),
            consumer_id: consumer.to_string(),
            version: 1,
            resource_type: ResourceType::Single,
            manifest: json!({}),
            status: Value::Null,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn single_instance_dispatches_every_consumer() {
        let instances = Arc::new(InMemoryInstanceRepository::new());
        let resources = Arc::new(InMemoryResourceRepository::new());
        let (dispatcher, _signals) =
            HashDispatcher::new("i1", instances, resources, test_config());

        assert!(dispatcher.dispatch("edge-1"));
        assert!(dispatcher.dispatch("edge-2"));
    }

    #[tokio::test]
    async fn membership_is_shared_across_dispatchers() {
        let instances: Arc<InMemoryInstanceRepository> =
            Arc::new(InMemoryInstanceRepository::new());
        let resources = Arc::new(InMemoryResourceRepository::new());
        let now = Utc::now();

        let (d1, _s1) = HashDispatcher::new(
            "i1",
            instances.clone(),
            resources.clone(),
            test_config(),
        );
        let (d2, _s2) = HashDispatcher::new("i2", instances.clone(), resources, test_config());

        instances.heartbeat("i1", now).await.expect("heartbeat");
        instances.heartbeat("i2", now).await.expect("heartbeat");
        d1.refresh_membership(now).await.expect("refresh");
        d2.refresh_membership(now).await.expect("refresh");

        // Exactly one instance owns each consumer.
        for i in 0..50 {
            let consumer = format!("edge-{i}");
            let owners =
                usize::from(d1.dispatch(&consumer)) + usize::from(d2.dispatch(&consumer));
            assert_eq!(owners, 1, "consumer {consumer} must have exactly one owner");
        }
    }

    #[tokio::test]
    async fn gaining_ownership_emits_resync_signal() {
        let instances: Arc<InMemoryInstanceRepository> =
            Arc::new(InMemoryInstanceRepository::new());
        let resources: Arc<InMemoryResourceRepository> =
            Arc::new(InMemoryResourceRepository::new());
        let now = Utc::now();

        // Two live instances; i2's dispatcher sees both.
        let (d2, mut signals) = HashDispatcher::new(
            "i2",
            instances.clone(),
            resources.clone(),
            test_config(),
        );
        instances.heartbeat("i1", now).await.expect("heartbeat");
        instances.heartbeat("i2", now).await.expect("heartbeat");
        d2.refresh_membership(now).await.expect("refresh");

        // Find a consumer owned by i1 and give it a resource.
        let consumer = (0..200)
            .map(|i| format!("edge-{i}"))
            .find(|c| !d2.dispatch(c))
            .expect("some consumer owned by i1");
        resources
            .create(resource("r1", &consumer))
            .await
            .expect("create");

        // i1 dies: its heartbeat ages out and the row flips unready.
        let later = now + chrono::Duration::seconds(60);
        instances.heartbeat("i2", later).await.expect("heartbeat");
        instances
            .mark_unready_older_than(later - chrono::Duration::seconds(30))
            .await
            .expect("mark unready");

        d2.refresh_membership(later).await.expect("refresh");
        assert!(d2.dispatch(&consumer));

        let signaled = signals.try_recv().expect("one resync signal");
        assert_eq!(signaled, consumer);
    }

    #[tokio::test]
    async fn run_loop_picks_up_peers_and_stops_on_shutdown() {
        let instances: Arc<InMemoryInstanceRepository> =
            Arc::new(InMemoryInstanceRepository::new());
        let resources = Arc::new(InMemoryResourceRepository::new());
        instances
            .heartbeat("i2", Utc::now())
            .await
            .expect("heartbeat");

        let (d1, _signals) = HashDispatcher::new(
            "i1",
            instances,
            resources,
            DispatcherConfig {
                heartbeat_period: Duration::from_secs(10),
                check_interval: Duration::from_millis(10),
            },
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&d1).run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(50)).await;

        // Once i2 is on the ring some consumers belong to it.
        let shared = (0..200).map(|i| format!("edge-{i}")).any(|c| !d1.dispatch(&c));
        assert!(shared, "refresh loop should have added i2 to the ring");

        shutdown_tx.send(true).expect("signal shutdown");
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop stops")
            .expect("join");
    }

    #[tokio::test]
    async fn unchanged_membership_emits_nothing() {
        let instances: Arc<InMemoryInstanceRepository> =
            Arc::new(InMemoryInstanceRepository::new());
        let resources: Arc<InMemoryResourceRepository> =
            Arc::new(InMemoryResourceRepository::new());
        resources
            .create(resource("r1", "edge-1"))
            .await
            .expect("create");

        let (dispatcher, mut signals) =
            HashDispatcher::new("i1", instances.clone(), resources, test_config());
        let now = Utc::now();
        instances.heartbeat("i1", now).await.expect("heartbeat");

        dispatcher.refresh_membership(now).await.expect("refresh");
        dispatcher
            .refresh_membership(now + chrono::Duration::seconds(1))
            .await
            .expect("refresh");

        assert!(signals.try_recv().is_err());
    }
}
