use crate::config::GatewayConfig;
use crate::dispatcher::Dispatcher;
use crate::error::Error;
use crate::metrics::Metrics;
use crate::protocol::{EventEnvelope, GatewayFrame};
use crate::rest::RestClient;
use crate::session::ConnectionState;
use crate::shard::{plan_batches, Shard, ShardFailure};
use futures_util::future::join_all;
use parking_lot::{Mutex as SyncMutex, RwLock};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Creates the shards, paces their identifies, and merges their events.
///
/// # Thread Safety
///
/// `ShardCoordinator` is `Send + Sync`; `start` and `shutdown` are serialized
/// by a lifecycle lock, everything else can be called concurrently.
pub struct ShardCoordinator {
    config: Arc<GatewayConfig>,
    rest: Arc<RestClient>,
    metrics: Arc<Metrics>,
    shards: RwLock<Vec<Arc<Shard>>>,
    /// Dropped on shutdown so the merged stream ends once every shard is gone
    events_tx: RwLock<Option<mpsc::Sender<EventEnvelope>>>,
    events_rx: SyncMutex<Option<mpsc::Receiver<EventEnvelope>>>,
    failures_tx: mpsc::UnboundedSender<ShardFailure>,
    failures_rx: SyncMutex<Option<mpsc::UnboundedReceiver<ShardFailure>>>,
    /// This is a tokio::Mutex so it can be held across await points.
    lifecycle_lock: Mutex<()>,
    /// Cancelled by `shutdown`; interrupts a `start` that is still waiting
    closing: CancellationToken,
}

impl ShardCoordinator {
    /// Create a coordinator with its own metrics
    pub fn new(config: GatewayConfig, rest: Arc<RestClient>) -> Self {
        Self::with_metrics(config, rest, Arc::new(Metrics::new()))
    }

    /// Create a coordinator that records into `metrics`
    pub fn with_metrics(config: GatewayConfig, rest: Arc<RestClient>, metrics: Arc<Metrics>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.connection.event_buffer);
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        Self {
            config: Arc::new(config),
            rest,
            metrics,
            shards: RwLock::new(Vec::new()),
            events_tx: RwLock::new(Some(events_tx)),
            events_rx: SyncMutex::new(Some(events_rx)),
            failures_tx,
            failures_rx: SyncMutex::new(Some(failures_rx)),
            lifecycle_lock: Mutex::new(()),
            closing: CancellationToken::new(),
        }
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Take the merged event stream. Returns `None` after the first call.
    pub fn events(&self) -> Option<Dispatcher> {
        self.events_rx.lock().take().map(Dispatcher::new)
    }

    /// Take the stream of shards that stopped on their own (fatal close,
    /// exhausted reconnects, panics). Returns `None` after the first call.
    pub fn failures(&self) -> Option<mpsc::UnboundedReceiver<ShardFailure>> {
        self.failures_rx.lock().take()
    }

    /// Fetch gateway metadata, create the shards and connect them in
    /// identify batches.
    ///
    /// # Errors
    ///
    /// Fails if already started or shut down, if the metadata request fails,
    /// or if a shard stops before becoming ready. Shards started before the
    /// failure keep running until `shutdown`.
    pub async fn start(&self) -> Result<(), Error> {
        let _lifecycle_guard = self.lifecycle_lock.lock().await;

        if self.closing.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        if !self.shards.read().is_empty() {
            return Err(Error::AlreadyRunning);
        }

        let info = tokio::select! {
            _ = self.closing.cancelled() => return Err(Error::ShuttingDown),
            info = self.rest.gateway_bot() => info?,
        };
        let endpoint = self
            .config
            .gateway_url
            .clone()
            .unwrap_or_else(|| info.url.clone());
        let shard_count = self.config.sharding.shard_count.unwrap_or(info.shards).max(1);
        let burst = self
            .config
            .sharding
            .max_concurrency
            .unwrap_or(info.session_start_limit.max_concurrency)
            .max(1);

        let limit = info.session_start_limit;
        if limit.remaining == 0 {
            let wait = Duration::from_millis(limit.reset_after);
            warn!(
                "Session start limit exhausted ({} total), waiting {:?}",
                limit.total, wait
            );
            self.pause(wait).await?;
        } else if limit.remaining < shard_count {
            warn!(
                "Only {} session starts remaining for {} shards",
                limit.remaining, shard_count
            );
        }

        let events_tx = self.events_tx.read().clone().ok_or(Error::ShuttingDown)?;
        let shards: Vec<Arc<Shard>> = (0..shard_count)
            .map(|id| {
                Arc::new(
                    Shard::new(
                        id,
                        shard_count,
                        self.config.clone(),
                        events_tx.clone(),
                        self.metrics.clone(),
                    )
                    .with_rest(self.rest.clone())
                    .with_failures(self.failures_tx.clone()),
                )
            })
            .collect();
        drop(events_tx);
        *self.shards.write() = shards.clone();

        info!(
            "Starting {} shards (burst {}) against {}",
            shard_count, burst, endpoint
        );

        let batches = plan_batches(shard_count, burst);
        let batch_count = batches.len();
        let ready_timeout = self.config.connection.ready_timeout;

        for (index, batch) in batches.into_iter().enumerate() {
            if index > 0 {
                let delay = self.config.sharding.batch_delay;
                debug!("Waiting {:?} before identify batch {}", delay, index + 1);
                self.pause(delay).await?;
            }

            let mut pending = Vec::with_capacity(batch.len());
            for &shard_id in &batch {
                let ready = shards[shard_id as usize].connect(endpoint.clone()).await?;
                pending.push((shard_id, ready));
            }

            let results = tokio::select! {
                _ = self.closing.cancelled() => return Err(Error::ShuttingDown),
                results = join_all(
                    pending
                        .into_iter()
                        .map(|(shard_id, ready)| async move { (shard_id, timeout(ready_timeout, ready).await) }),
                ) => results,
            };

            for (shard_id, result) in results {
                match result {
                    Ok(Ok(())) => debug!("[SHARD-{}] Ready", shard_id),
                    Ok(Err(_)) => {
                        return Err(Error::ShardFailed {
                            shard_id,
                            reason: "connection task stopped before becoming ready".to_string(),
                        })
                    }
                    Err(_) => warn!(
                        "[SHARD-{}] Not ready after {:?}, continuing",
                        shard_id, ready_timeout
                    ),
                }
            }

            info!("Identify batch {}/{} started: {:?}", index + 1, batch_count, batch);
        }

        info!("All {} shards started", shard_count);
        Ok(())
    }

    /// Sleep for `wait`, or fail if shutdown begins first
    async fn pause(&self, wait: Duration) -> Result<(), Error> {
        tokio::select! {
            _ = self.closing.cancelled() => {
                info!("Start interrupted by shutdown");
                Err(Error::ShuttingDown)
            }
            _ = tokio::time::sleep(wait) => Ok(()),
        }
    }

    /// Disconnect every shard concurrently, invalidating their sessions,
    /// then close the merged event stream.
    ///
    /// A `start` still waiting on the session budget, a batch delay or a
    /// ready signal returns `ShuttingDown` and releases the lifecycle lock.
    pub async fn shutdown(&self) {
        self.closing.cancel();
        let _lifecycle_guard = self.lifecycle_lock.lock().await;

        let shards = std::mem::take(&mut *self.shards.write());
        info!("Shutting down {} shards", shards.len());

        join_all(shards.iter().map(|shard| shard.disconnect(true))).await;
        drop(shards);

        self.events_tx.write().take();
        info!("ShardCoordinator stopped");
    }

    /// Whether shards have been started and not shut down
    pub fn is_running(&self) -> bool {
        !self.closing.is_cancelled() && !self.shards.read().is_empty()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.read().len()
    }

    pub fn shard(&self, shard_id: u32) -> Option<Arc<Shard>> {
        self.shards.read().get(shard_id as usize).cloned()
    }

    pub fn shard_state(&self, shard_id: u32) -> Option<ConnectionState> {
        self.shard(shard_id).map(|s| s.state())
    }

    /// Send an application frame on one shard
    pub async fn send(&self, shard_id: u32, frame: &GatewayFrame) -> Result<(), Error> {
        let shard = self.shard(shard_id).ok_or(Error::NotConnected(shard_id))?;
        shard.send(frame).await
    }

    /// Force one shard to reconnect, keeping its session
    pub fn reconnect_shard(&self, shard_id: u32) -> Result<(), Error> {
        let shard = self.shard(shard_id).ok_or(Error::NotConnected(shard_id))?;
        shard.reconnect();
        Ok(())
    }

    /// Shard responsible for a guild id: `(guild_id >> 22) % shard_count`
    pub fn shard_for_guild(&self, guild_id: u64) -> Option<u32> {
        let count = self.shard_count() as u64;
        if count == 0 {
            return None;
        }
        Some(((guild_id >> 22) % count) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RestConfig;

    fn coordinator() -> ShardCoordinator {
        let config = GatewayConfig::builder("token").build().unwrap();
        let rest = RestClient::new(RestConfig::new("token").base_url("http://127.0.0.1:9")).unwrap();
        ShardCoordinator::new(config, Arc::new(rest))
    }

    #[tokio::test]
    async fn test_streams_taken_once() {
        let coordinator = coordinator();
        assert!(coordinator.events().is_some());
        assert!(coordinator.events().is_none());
        assert!(coordinator.failures().is_some());
        assert!(coordinator.failures().is_none());
    }

    #[tokio::test]
    async fn test_no_shards_before_start() {
        let coordinator = coordinator();
        assert_eq!(coordinator.shard_count(), 0);
        assert!(!coordinator.is_running());
        assert!(coordinator.shard_state(0).is_none());
        assert!(coordinator.shard_for_guild(1).is_none());
        assert!(matches!(
            coordinator.reconnect_shard(0),
            Err(Error::NotConnected(0))
        ));
    }

    #[tokio::test]
    async fn test_start_after_shutdown_fails() {
        let coordinator = coordinator();
        let mut events = coordinator.events().unwrap();
        coordinator.shutdown().await;

        assert!(matches!(coordinator.start().await, Err(Error::ShuttingDown)));
        assert!(events.next_event().await.is_none());
    }
}
