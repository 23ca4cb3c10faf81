//! One running simulcast: the relay workers of a stream key and their state.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::destination::{DestinationConfig, DestinationState};
use crate::error::{SimulcastError, SimulcastResult};
use crate::ingest::IngestSource;
use crate::monitor::{SharedStates, StatusMonitor};
use crate::registry::SimulcastSettings;
use crate::snapshot::{DestinationSnapshot, InstanceSnapshot};
use crate::transport::TransportProvider;
use crate::worker::{RelayWorker, RelayWorkerHandle};

/// How long the monitor gets to drain the last worker events
const MONITOR_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Relay workers of one stream key, sharing one ingest tap.
///
/// The destination set is fixed at launch. Workers only leave it, through
/// [`remove_destination`](Self::remove_destination) or
/// [`shutdown`](Self::shutdown).
pub struct SimulcastInstance {
    stream_key: String,
    started_at: DateTime<Utc>,
    ingest: Arc<IngestSource>,
    states: SharedStates,
    workers: Mutex<IndexMap<String, RelayWorkerHandle>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    cancel_token: CancellationToken,
}

impl SimulcastInstance {
    /// Validate every destination against its transport and spawn the
    /// workers of those that pass.
    ///
    /// Destinations whose relay cannot be created are recorded as `ERROR`. If
    /// none can be created nothing is spawned. Also returns the snapshot taken
    /// before any worker ran.
    pub(crate) fn launch(
        stream_key: &str,
        destinations: Vec<DestinationConfig>,
        transports: &dyn TransportProvider,
        settings: &SimulcastSettings,
    ) -> SimulcastResult<(Self, InstanceSnapshot)> {
        let mut states = IndexMap::with_capacity(destinations.len());
        let mut runnable = Vec::with_capacity(destinations.len());
        let mut failures = Vec::new();

        for destination in destinations {
            let transport = transports.transport_for(destination.protocol);
            match transport.prepare(&destination) {
                Ok(()) => {
                    states.insert(
                        destination.id.clone(),
                        DestinationState::pending(&destination),
                    );
                    runnable.push((destination, transport));
                }
                Err(e) => {
                    warn!(
                        stream_key = %stream_key,
                        destination_id = %destination.id,
                        error = %e,
                        "Destination rejected"
                    );
                    let reason = e.to_string();
                    failures.push(reason.clone());
                    states.insert(
                        destination.id.clone(),
                        DestinationState::spawn_failed(&destination, reason),
                    );
                }
            }
        }

        if runnable.is_empty() {
            return Err(SimulcastError::SpawnFailure(format!(
                "no destination of stream {stream_key} could be started: {}",
                failures.join("; ")
            )));
        }

        let instance = Self {
            stream_key: stream_key.to_string(),
            started_at: Utc::now(),
            ingest: Arc::new(IngestSource::from_template(
                &settings.ingest_url_template,
                stream_key,
            )),
            states: Arc::new(RwLock::new(states)),
            workers: Mutex::new(IndexMap::with_capacity(runnable.len())),
            monitor: Mutex::new(None),
            cancel_token: CancellationToken::new(),
        };
        let snapshot = instance.snapshot();

        let (events_tx, events_rx) = mpsc::channel(settings.event_channel_capacity.max(1));
        *instance.monitor.lock() = Some(StatusMonitor::spawn(
            stream_key,
            Arc::clone(&instance.states),
            events_rx,
        ));

        let mut workers = instance.workers.lock();
        for (destination, transport) in runnable {
            let id = destination.id.clone();
            let worker = RelayWorker::new(
                stream_key.to_string(),
                destination,
                Arc::clone(&instance.ingest),
                transport,
                settings.retry.clone(),
                settings.health_check_interval,
                settings.stop_grace_period,
                events_tx.clone(),
                instance.cancel_token.child_token(),
            );
            workers.insert(id, worker.spawn());
        }
        drop(workers);

        info!(
            stream_key = %stream_key,
            ingest = %instance.ingest.url(),
            destinations = snapshot.destinations.len(),
            rejected = failures.len(),
            "Simulcast started"
        );
        Ok((instance, snapshot))
    }

    #[must_use]
    pub fn destination_count(&self) -> usize {
        self.states.read().len()
    }

    /// Copy of the current state, taken under the state lock.
    #[must_use]
    pub fn snapshot(&self) -> InstanceSnapshot {
        let states = self.states.read();
        InstanceSnapshot {
            stream_key: self.stream_key.clone(),
            is_active: true,
            start_time: self.started_at,
            destinations: states.values().map(DestinationSnapshot::from).collect(),
        }
    }

    /// Stop one destination's worker and forget its state.
    ///
    /// Returns the number of destinations left.
    pub(crate) async fn remove_destination(
        &self,
        destination_id: &str,
        grace: Duration,
    ) -> SimulcastResult<usize> {
        let handle = self.workers.lock().shift_remove(destination_id);
        let removed = self.states.write().shift_remove(destination_id).is_some();
        if handle.is_none() && !removed {
            return Err(SimulcastError::NotFound(format!(
                "destination {destination_id} in stream {}",
                self.stream_key
            )));
        }

        if let Some(handle) = handle {
            handle.shutdown(grace).await;
        }
        info!(
            stream_key = %self.stream_key,
            destination_id = %destination_id,
            "Destination removed"
        );
        Ok(self.destination_count())
    }

    /// Stop every worker, giving each `grace` to close its connection, then
    /// wait for the monitor to finish.
    pub(crate) async fn shutdown(&self, grace: Duration) {
        self.cancel_token.cancel();

        let handles: Vec<RelayWorkerHandle> =
            self.workers.lock().drain(..).map(|(_, handle)| handle).collect();
        join_all(handles.into_iter().map(|handle| handle.shutdown(grace))).await;

        let monitor = self.monitor.lock().take();
        if let Some(mut monitor) = monitor {
            match tokio::time::timeout(MONITOR_DRAIN_TIMEOUT, &mut monitor).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_panic() => {
                    error!(stream_key = %self.stream_key, "Status monitor panicked");
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!(stream_key = %self.stream_key, "Status monitor did not finish, aborting");
                    monitor.abort();
                }
            }
        }
        info!(stream_key = %self.stream_key, "Simulcast stopped");
    }
}

impl Drop for SimulcastInstance {
    fn drop(&mut self) {
        // Workers never outlive their instance
        self.cancel_token.cancel();
    }
}
