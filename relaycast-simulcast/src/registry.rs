//! Process-wide table of running simulcasts, keyed by stream key.
//!
//! Mutations of one key are serialized by a per-key async lock so unrelated
//! streams never wait on each other. Reads go straight to the table and return
//! snapshots.

use dashmap::DashMap;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{info, warn};

use relaycast_core::Config;

use crate::destination::DestinationConfig;
use crate::error::{SimulcastError, SimulcastResult};
use crate::instance::SimulcastInstance;
use crate::snapshot::InstanceSnapshot;
use crate::transport::{FfmpegSettings, FfmpegTransports, TransportProvider};
use crate::worker::RetryPolicy;

/// Engine settings derived from [`Config`].
#[derive(Debug, Clone)]
pub struct SimulcastSettings {
    pub stop_grace_period: Duration,
    pub max_destinations_per_stream: usize,
    pub event_channel_capacity: usize,
    pub retry: RetryPolicy,
    pub health_check_interval: Duration,
    pub ingest_url_template: String,
}

impl Default for SimulcastSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for SimulcastSettings {
    fn from(config: &Config) -> Self {
        Self {
            stop_grace_period: Duration::from_secs(config.simulcast.stop_grace_period_seconds),
            max_destinations_per_stream: config.simulcast.max_destinations_per_stream,
            event_channel_capacity: config.simulcast.event_channel_capacity,
            retry: RetryPolicy::from(&config.retry),
            health_check_interval: Duration::from_secs(config.relay.health_check_interval_seconds),
            ingest_url_template: config.ingest.url_template.clone(),
        }
    }
}

pub struct SimulcastRegistry {
    instances: DashMap<String, Arc<SimulcastInstance>>,
    key_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    transports: Arc<dyn TransportProvider>,
    settings: SimulcastSettings,
}

impl SimulcastRegistry {
    pub fn new(transports: Arc<dyn TransportProvider>, settings: SimulcastSettings) -> Self {
        Self {
            instances: DashMap::new(),
            key_locks: DashMap::new(),
            transports,
            settings,
        }
    }

    /// Registry relaying through ffmpeg, configured from `config`.
    #[must_use]
    pub fn with_ffmpeg(config: &Config) -> Self {
        Self::new(
            Arc::new(FfmpegTransports::new(FfmpegSettings::from(&config.relay))),
            SimulcastSettings::from(config),
        )
    }

    #[must_use]
    pub const fn settings(&self) -> &SimulcastSettings {
        &self.settings
    }

    /// Start relaying `stream_key` to every destination.
    ///
    /// The returned snapshot is taken before any worker runs, so every
    /// destination is `PENDING`, or `ERROR` if its relay could not be created.
    pub async fn start(
        &self,
        stream_key: &str,
        destinations: Vec<DestinationConfig>,
    ) -> SimulcastResult<InstanceSnapshot> {
        self.validate_start(stream_key, &destinations)?;

        let _key = self.lock_key(stream_key).await;
        self.start_locked(stream_key, destinations)
    }

    /// Stop every relay of `stream_key` and forget the instance.
    pub async fn stop(&self, stream_key: &str) -> SimulcastResult<()> {
        let _key = self.lock_key(stream_key).await;
        self.stop_locked(stream_key).await
    }

    /// Snapshot of a running simulcast, `None` when nothing runs for the key.
    #[must_use]
    pub fn status(&self, stream_key: &str) -> Option<InstanceSnapshot> {
        self.instances
            .get(stream_key)
            .map(|instance| instance.snapshot())
    }

    /// Stop one destination. Removing the last one tears the instance down.
    pub async fn remove_destination(
        &self,
        stream_key: &str,
        destination_id: &str,
    ) -> SimulcastResult<()> {
        let _key = self.lock_key(stream_key).await;
        self.remove_destination_locked(stream_key, destination_id)
            .await
    }

    /// Replace the destination set of a stream: stop it if it runs, then
    /// start it again. Destinations cannot be added to a running instance.
    pub async fn restart(
        &self,
        stream_key: &str,
        destinations: Vec<DestinationConfig>,
    ) -> SimulcastResult<InstanceSnapshot> {
        self.validate_start(stream_key, &destinations)?;

        let _key = self.lock_key(stream_key).await;
        match self.stop_locked(stream_key).await {
            Ok(()) | Err(SimulcastError::NotFound(_)) => {
                self.start_locked(stream_key, destinations)
            }
            Err(e) => Err(e),
        }
    }

    #[must_use]
    pub fn is_active(&self, stream_key: &str) -> bool {
        self.instances.contains_key(stream_key)
    }

    /// Stream keys with a running simulcast, sorted.
    #[must_use]
    pub fn active_stream_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .instances
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Stop every running simulcast concurrently.
    pub async fn shutdown(&self) {
        let keys = self.active_stream_keys();
        if keys.is_empty() {
            return;
        }
        info!(count = keys.len(), "Stopping all simulcasts");

        let results = join_all(keys.iter().map(|key| self.stop(key))).await;
        for (key, result) in keys.iter().zip(results) {
            match result {
                Ok(()) | Err(SimulcastError::NotFound(_)) => {}
                Err(e) => warn!(stream_key = %key, error = %e, "Failed to stop simulcast"),
            }
        }
    }

    fn validate_start(
        &self,
        stream_key: &str,
        destinations: &[DestinationConfig],
    ) -> SimulcastResult<()> {
        if stream_key.trim().is_empty() {
            return Err(SimulcastError::InvalidInput(
                "stream key must not be empty".to_string(),
            ));
        }
        if destinations.is_empty() {
            return Err(SimulcastError::InvalidInput(
                "at least one destination is required".to_string(),
            ));
        }
        let max = self.settings.max_destinations_per_stream;
        if destinations.len() > max {
            return Err(SimulcastError::InvalidInput(format!(
                "{} destinations requested, at most {max} allowed",
                destinations.len()
            )));
        }

        let mut seen = HashSet::with_capacity(destinations.len());
        for destination in destinations {
            if destination.id.trim().is_empty() {
                return Err(SimulcastError::InvalidInput(
                    "destination id must not be empty".to_string(),
                ));
            }
            if !seen.insert(destination.id.as_str()) {
                return Err(SimulcastError::InvalidInput(format!(
                    "duplicate destination id: {}",
                    destination.id
                )));
            }
        }
        Ok(())
    }

    fn start_locked(
        &self,
        stream_key: &str,
        destinations: Vec<DestinationConfig>,
    ) -> SimulcastResult<InstanceSnapshot> {
        if self.instances.contains_key(stream_key) {
            return Err(SimulcastError::AlreadyRunning(stream_key.to_string()));
        }

        let (instance, snapshot) = SimulcastInstance::launch(
            stream_key,
            destinations,
            self.transports.as_ref(),
            &self.settings,
        )?;
        self.instances
            .insert(stream_key.to_string(), Arc::new(instance));
        Ok(snapshot)
    }

    async fn stop_locked(&self, stream_key: &str) -> SimulcastResult<()> {
        // Unregister first so the stream reads as inactive while it drains
        let (_, instance) = self.instances.remove(stream_key).ok_or_else(|| {
            SimulcastError::NotFound(format!("no simulcast running for stream: {stream_key}"))
        })?;
        info!(
            stream_key = %stream_key,
            destinations = instance.destination_count(),
            "Stopping simulcast"
        );
        instance.shutdown(self.settings.stop_grace_period).await;
        Ok(())
    }

    async fn remove_destination_locked(
        &self,
        stream_key: &str,
        destination_id: &str,
    ) -> SimulcastResult<()> {
        let instance = self
            .instances
            .get(stream_key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                SimulcastError::NotFound(format!("no simulcast running for stream: {stream_key}"))
            })?;

        let remaining = instance
            .remove_destination(destination_id, self.settings.stop_grace_period)
            .await?;
        if remaining == 0 {
            info!(stream_key = %stream_key, "Last destination removed");
            self.stop_locked(stream_key).await?;
        }
        Ok(())
    }

    async fn lock_key(&self, stream_key: &str) -> KeyGuard<'_> {
        let lock = Arc::clone(
            self.key_locks
                .entry(stream_key.to_string())
                .or_default()
                .value(),
        );
        // Built before waiting so a caller dropped mid-wait still prunes
        let mut key = KeyGuard {
            key_locks: &self.key_locks,
            stream_key: stream_key.to_string(),
            guard: None,
        };
        key.guard = Some(lock.lock_owned().await);
        key
    }
}

/// Hold on one stream key's lock. Dropping it releases the lock and removes
/// the lock entry once nobody else holds or waits on it.
struct KeyGuard<'a> {
    key_locks: &'a DashMap<String, Arc<AsyncMutex<()>>>,
    stream_key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.key_locks
            .remove_if(&self.stream_key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::{DestinationStatus, Platform, Protocol};
    use crate::transport::mock::{ConnectScript, MockTransport};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn settings() -> SimulcastSettings {
        SimulcastSettings {
            stop_grace_period: Duration::from_millis(100),
            max_destinations_per_stream: 4,
            retry: RetryPolicy {
                max_attempts: 2,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
            },
            health_check_interval: Duration::from_millis(50),
            ..SimulcastSettings::default()
        }
    }

    fn registry() -> (SimulcastRegistry, MockTransport) {
        let transport = MockTransport::new();
        let registry = SimulcastRegistry::new(Arc::new(transport.clone()), settings());
        (registry, transport)
    }

    fn dest(id: &str) -> DestinationConfig {
        DestinationConfig::new(id, Platform::YouTube, Protocol::Rtmp, "rtmp://a.rtmp.youtube.com/live2", "key")
    }

    async fn wait_for_status(
        registry: &SimulcastRegistry,
        key: &str,
        id: &str,
        status: DestinationStatus,
    ) {
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        loop {
            let current = registry
                .status(key)
                .and_then(|s| s.destination(id).map(|d| d.status));
            if current == Some(status) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "{key}/{id} stuck at {current:?}, expected {status}"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_twice_is_rejected() {
        let (registry, _) = registry();
        registry.start("s1", vec![dest("yt")]).await.unwrap();

        let err = registry.start("s1", vec![dest("tw")]).await.unwrap_err();
        assert_eq!(err, SimulcastError::AlreadyRunning("s1".to_string()));
        assert_eq!(registry.len(), 1);
        assert!(registry.status("s1").unwrap().destination("tw").is_none());

        registry.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_initial_snapshot_is_pending() {
        let (registry, _) = registry();
        let snapshot = registry
            .start("s1", vec![dest("a"), dest("b"), dest("c")])
            .await
            .unwrap();

        assert!(snapshot.is_active);
        assert_eq!(snapshot.stream_key, "s1");
        let ids: Vec<&str> = snapshot
            .destinations
            .iter()
            .map(|d| d.destination_id.as_str())
            .collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert!(snapshot
            .destinations
            .iter()
            .all(|d| d.status == DestinationStatus::Pending));

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_validation() {
        let (registry, transport) = registry();

        let cases = [
            registry.start("", vec![dest("a")]).await,
            registry.start("s1", Vec::new()).await,
            registry.start("s1", vec![dest("a"), dest("a")]).await,
            registry.start("s1", vec![dest("")]).await,
            registry
                .start("s1", (0..5).map(|i| dest(&format!("d{i}"))).collect())
                .await,
        ];
        for result in cases {
            assert_eq!(result.unwrap_err().code(), "invalid_input");
        }
        assert!(registry.status("s1").is_none());
        assert_eq!(transport.connect_count("a"), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_is_idempotent() {
        let (registry, transport) = registry();
        registry.start("s1", vec![dest("yt")]).await.unwrap();
        wait_for_status(&registry, "s1", "yt", DestinationStatus::Connected).await;

        registry.stop("s1").await.unwrap();
        assert!(registry.status("s1").is_none());
        assert!(transport.was_disconnected("yt"));

        let err = registry.stop("s1").await.unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_stops() {
        let (registry, _) = registry();
        registry.start("s1", vec![dest("yt")]).await.unwrap();

        let (a, b) = tokio::join!(registry.stop("s1"), registry.stop("s1"));
        let not_found = [&a, &b]
            .iter()
            .filter(|r| matches!(r, Err(SimulcastError::NotFound(_))))
            .count();
        assert!(a.is_ok() || b.is_ok());
        assert_eq!(not_found, 1);
        assert!(registry.key_locks.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_removing_last_destination_tears_down() {
        let (registry, _) = registry();
        registry.start("s3", vec![dest("a"), dest("b")]).await.unwrap();

        registry.remove_destination("s3", "a").await.unwrap();
        let snapshot = registry.status("s3").unwrap();
        assert_eq!(snapshot.destinations.len(), 1);
        assert_eq!(snapshot.destinations[0].destination_id, "b");

        let err = registry.remove_destination("s3", "a").await.unwrap_err();
        assert_eq!(err.code(), "not_found");
        let err = registry.remove_destination("nope", "b").await.unwrap_err();
        assert_eq!(err.code(), "not_found");

        registry.remove_destination("s3", "b").await.unwrap();
        assert!(registry.status("s3").is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_destination_leaves_siblings_alone() {
        let (registry, transport) = registry();
        registry.start("s1", vec![dest("yt"), dest("tw")]).await.unwrap();
        wait_for_status(&registry, "s1", "yt", DestinationStatus::Connected).await;
        wait_for_status(&registry, "s1", "tw", DestinationStatus::Connected).await;

        transport.script("yt", [ConnectScript::Fail("connection refused".to_string())]);
        assert!(transport.kill("yt", "ffmpeg exited (exit status: 1)"));
        wait_for_status(&registry, "s1", "yt", DestinationStatus::Error).await;

        let snapshot = registry.status("s1").unwrap();
        assert!(snapshot.is_active);
        let yt = snapshot.destination("yt").unwrap();
        assert!(yt.error_message.as_deref().unwrap().contains("connection refused"));
        assert_eq!(snapshot.destination("tw").unwrap().status, DestinationStatus::Connected);

        registry.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_partial_spawn_failure() {
        let (registry, transport) = registry();
        transport.reject("bad", "expected rtmp:// endpoint");

        let snapshot = registry
            .start("s1", vec![dest("bad"), dest("good")])
            .await
            .unwrap();
        assert_eq!(snapshot.destination("bad").unwrap().status, DestinationStatus::Error);
        wait_for_status(&registry, "s1", "good", DestinationStatus::Connected).await;
        assert_eq!(transport.connect_count("bad"), 0);

        transport.reject("good", "nope");
        let err = registry.start("s2", vec![dest("good")]).await.unwrap_err();
        assert_eq!(err.code(), "spawn_failure");
        assert!(!registry.is_active("s2"));

        registry.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_restart_replaces_destinations() {
        let (registry, _) = registry();
        registry.start("s1", vec![dest("yt")]).await.unwrap();

        let snapshot = registry
            .restart("s1", vec![dest("yt"), dest("tw")])
            .await
            .unwrap();
        assert_eq!(snapshot.destinations.len(), 2);
        assert_eq!(registry.len(), 1);

        // Restarting a stream that is not running just starts it
        registry.restart("s2", vec![dest("fb")]).await.unwrap();
        assert_eq!(registry.active_stream_keys(), ["s1", "s2"]);

        registry.shutdown().await;
        assert!(registry.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_is_bounded_by_grace_period() {
        let (registry, transport) = registry();
        transport.hang_on_disconnect("stuck");
        registry.start("s1", vec![dest("stuck"), dest("ok")]).await.unwrap();
        registry.start("s2", vec![dest("other")]).await.unwrap();
        wait_for_status(&registry, "s1", "stuck", DestinationStatus::Connected).await;
        wait_for_status(&registry, "s1", "ok", DestinationStatus::Connected).await;
        wait_for_status(&registry, "s2", "other", DestinationStatus::Connected).await;

        let started = std::time::Instant::now();
        registry.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(registry.is_empty());
        assert!(transport.was_disconnected("ok"));
        assert!(transport.was_disconnected("other"));
    }

    #[tokio::test]
    async fn test_missing_relay_binary_fails_start() {
        let mut config = Config::default();
        config.relay.ffmpeg_path = "/nonexistent/ffmpeg".to_string();
        let registry = SimulcastRegistry::with_ffmpeg(&config);

        let err = registry.start("s1", vec![dest("yt")]).await.unwrap_err();
        assert_eq!(err.code(), "spawn_failure");
        assert!(err.to_string().contains("/nonexistent/ffmpeg"));
        assert!(registry.status("s1").is_none());
        assert!(registry.key_locks.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_panicked_worker_marks_destination_error() {
        let (registry, transport) = registry();
        registry.start("s1", vec![dest("yt"), dest("tw")]).await.unwrap();
        wait_for_status(&registry, "s1", "yt", DestinationStatus::Connected).await;
        wait_for_status(&registry, "s1", "tw", DestinationStatus::Connected).await;

        transport.panic_on_health_check("yt");
        wait_for_status(&registry, "s1", "yt", DestinationStatus::Error).await;

        let snapshot = registry.status("s1").unwrap();
        assert_eq!(
            snapshot.destination("yt").unwrap().error_message.as_deref(),
            Some(crate::worker::WORKER_PANIC_REASON)
        );
        assert_eq!(snapshot.destination("tw").unwrap().status, DestinationStatus::Connected);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_abandoned_wait_releases_key_lock() {
        let (registry, _) = registry();
        let held = registry.lock_key("s1").await;

        // Gives up while queued behind `held`
        let waiting = tokio::time::timeout(Duration::from_millis(20), registry.stop("s1")).await;
        assert!(waiting.is_err());
        assert_eq!(registry.key_locks.len(), 1);

        drop(held);
        assert!(registry.key_locks.is_empty());
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = Config::default();
        config.simulcast.stop_grace_period_seconds = 9;
        config.retry.max_attempts = 4;
        let settings = SimulcastSettings::from(&config);
        assert_eq!(settings.stop_grace_period, Duration::from_secs(9));
        assert_eq!(settings.retry.max_attempts, 4);
        assert!(settings.ingest_url_template.contains("{stream_key}"));
    }
}
