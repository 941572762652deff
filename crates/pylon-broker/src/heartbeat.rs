//! Instance heartbeating and the stale-instance janitor.
//!
//! Every broker process owns one server-instance row. The runner renews it
//! each period with `ready = true`, flips peers that stopped renewing to
//! unready once their heartbeat is older than three periods, and deletes
//! rows older than the janitor grace window. The status dispatcher reads
//! the resulting membership to build its ring.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::repository::InstanceRepository;

/// Configuration for the heartbeat runner.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// How often the local instance renews itself. Must match the
    /// dispatcher's period so both agree on liveness.
    pub heartbeat_period: Duration,
    /// Instances silent for longer than this are deleted entirely.
    pub janitor_grace: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            heartbeat_period: Duration::from_secs(10),
            janitor_grace: Duration::from_secs(600),
        }
    }
}

impl HeartbeatConfig {
    fn unready_window(&self) -> chrono::Duration {
        let millis = i64::try_from(self.heartbeat_period.as_millis()).unwrap_or(i64::MAX / 4);
        chrono::Duration::milliseconds(millis.saturating_mul(3))
    }

    fn janitor_window(&self) -> chrono::Duration {
        let millis = i64::try_from(self.janitor_grace.as_millis()).unwrap_or(i64::MAX / 4);
        chrono::Duration::milliseconds(millis)
    }
}

/// Renews the local instance row and sweeps stale peers.
pub struct HeartbeatRunner {
    instance_id: String,
    repository: Arc<dyn InstanceRepository>,
    config: HeartbeatConfig,
}

impl HeartbeatRunner {
    /// Creates a runner for the given instance.
    #[must_use]
    pub fn new(
        instance_id: impl Into<String>,
        repository: Arc<dyn InstanceRepository>,
        config: HeartbeatConfig,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            repository,
            config,
        }
    }

    /// One renewal-and-sweep cycle at the given time.
    ///
    /// # Errors
    ///
    /// Propagates repository failures; the next cycle retries.
    pub async fn beat(&self, now: DateTime<Utc>) -> Result<()> {
        self.repository.heartbeat(&self.instance_id, now).await?;

        let flipped = self
            .repository
            .mark_unready_older_than(now - self.config.unready_window())
            .await?;
        if flipped > 0 {
            debug!(flipped, "marked silent instances unready");
        }

        let purged = self
            .repository
            .purge_older_than(now - self.config.janitor_window())
            .await?;
        if purged > 0 {
            info!(purged, "removed stale server instances");
        }
        Ok(())
    }

    /// Runs the heartbeat loop until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.beat(Utc::now()).await {
                        warn!(instance = %self.instance_id, error = %err, "heartbeat failed");
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
