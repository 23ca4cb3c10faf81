//! Relay worker: supervises the outbound connection of one destination.
//!
//! A worker connects through its transport, watches the live link, and retries
//! with exponential backoff when the link drops. It never touches
//! `DestinationState` directly. Everything it observes goes to the instance's
//! status monitor as a [`WorkerEvent`].

use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use relaycast_core::RetryConfig;

use crate::destination::{DestinationConfig, RelayMetrics};
use crate::error::SimulcastError;
use crate::ingest::IngestSource;
use crate::transport::{LinkEvent, LinkHealth, RelayLink, RelayTransport};
use crate::util::backoff_delay;

/// Extra time a worker gets on top of the grace period before it is aborted
const SHUTDOWN_MARGIN: Duration = Duration::from_millis(500);
/// `tokio::time::interval` rejects a zero period
const MIN_HEALTH_CHECK_INTERVAL: Duration = Duration::from_millis(1);
/// Final error of a destination whose worker died
pub const WORKER_PANIC_REASON: &str = "relay worker panicked";

/// Bounded reconnect policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive failed attempts before the destination is given up on
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff_delay(
            attempt,
            u64::try_from(self.initial_backoff.as_millis()).unwrap_or(u64::MAX),
            u64::try_from(self.max_backoff.as_millis()).unwrap_or(u64::MAX),
        )
    }

    const fn attempt_limit(&self) -> u32 {
        if self.max_attempts == 0 {
            1
        } else {
            self.max_attempts
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEventKind {
    Connecting { attempt: u32 },
    Connected,
    Progress(RelayMetrics),
    /// The link failed and another attempt is scheduled
    Reconnecting { attempt: u32, reason: String },
    /// Retries are exhausted
    Failed { reason: String },
    Stopped,
}

/// One observation reported by a worker to its status monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerEvent {
    pub destination_id: String,
    /// Strictly increasing per worker
    pub sequence: u64,
    pub kind: WorkerEventKind,
    pub observed_at: DateTime<Utc>,
}

/// How a live link ended.
enum LinkEnd {
    Cancelled,
    Lost(String),
}

pub(crate) struct RelayWorker {
    stream_key: String,
    destination: DestinationConfig,
    ingest: Arc<IngestSource>,
    transport: Arc<dyn RelayTransport>,
    policy: RetryPolicy,
    health_check_interval: Duration,
    grace: Duration,
    events: mpsc::Sender<WorkerEvent>,
    cancel_token: CancellationToken,
    sequence: u64,
}

impl RelayWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        stream_key: String,
        destination: DestinationConfig,
        ingest: Arc<IngestSource>,
        transport: Arc<dyn RelayTransport>,
        policy: RetryPolicy,
        health_check_interval: Duration,
        grace: Duration,
        events: mpsc::Sender<WorkerEvent>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            stream_key,
            destination,
            ingest,
            transport,
            policy,
            health_check_interval: health_check_interval.max(MIN_HEALTH_CHECK_INTERVAL),
            grace,
            events,
            cancel_token,
            sequence: 0,
        }
    }

    /// Start the worker task.
    pub(crate) fn spawn(self) -> RelayWorkerHandle {
        let span = tracing::info_span!(
            "relay_worker",
            stream_key = %self.stream_key,
            destination_id = %self.destination.id,
            protocol = %self.destination.protocol,
        );
        let destination_id = self.destination.id.clone();
        let cancel_token = self.cancel_token.clone();
        let task = tokio::spawn(self.run_guarded().instrument(span));

        RelayWorkerHandle {
            destination_id,
            cancel_token,
            task,
        }
    }

    /// Run the worker, turning a panic into a final `Failed` report so the
    /// destination never stays stuck in its last status.
    async fn run_guarded(mut self) {
        if AssertUnwindSafe(self.run()).catch_unwind().await.is_err() {
            error!("Relay worker panicked");
            self.emit(WorkerEventKind::Failed {
                reason: WORKER_PANIC_REASON.to_string(),
            })
            .await;
        }
    }

    async fn run(&mut self) {
        let limit = self.policy.attempt_limit();
        let mut failures: u32 = 0;

        loop {
            self.emit(WorkerEventKind::Connecting {
                attempt: failures + 1,
            })
            .await;

            let connected = tokio::select! {
                result = self.transport.connect(&self.ingest, &self.destination) => result,
                () = self.cancel_token.cancelled() => {
                    debug!("Cancelled while connecting");
                    self.emit(WorkerEventKind::Stopped).await;
                    return;
                }
            };

            let reason = match connected {
                Ok(link) => {
                    info!("Relay connected");
                    failures = 0;
                    self.emit(WorkerEventKind::Connected).await;
                    match self.supervise(link).await {
                        LinkEnd::Cancelled => {
                            info!("Relay stopped");
                            self.emit(WorkerEventKind::Stopped).await;
                            return;
                        }
                        LinkEnd::Lost(reason) => reason,
                    }
                }
                Err(e @ SimulcastError::SpawnFailure(_)) => {
                    // Not retried: the relay could not even be launched
                    let reason = e.to_string();
                    error!(error = %reason, "Relay cannot be launched, giving up");
                    self.emit(WorkerEventKind::Failed { reason }).await;
                    return;
                }
                Err(e) => e.to_string(),
            };

            failures += 1;
            if failures >= limit {
                error!(attempt = failures, error = %reason, "Relay failed, giving up");
                self.emit(WorkerEventKind::Failed { reason }).await;
                return;
            }

            let delay = self.policy.delay_for(failures);
            warn!(
                attempt = failures,
                max_attempts = limit,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %reason,
                "Relay disconnected, retrying"
            );
            self.emit(WorkerEventKind::Reconnecting {
                attempt: failures,
                reason,
            })
            .await;

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.cancel_token.cancelled() => {
                    debug!("Cancelled during backoff");
                    self.emit(WorkerEventKind::Stopped).await;
                    return;
                }
            }
        }
    }

    /// Watch a live link until it is lost or the worker is cancelled. The link
    /// is closed either way.
    async fn supervise(&mut self, mut link: Box<dyn RelayLink>) -> LinkEnd {
        let mut health = tokio::time::interval(self.health_check_interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        health.tick().await;

        let end = loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => break LinkEnd::Cancelled,
                event = link.next_event() => match event {
                    LinkEvent::Progress(metrics) => self.report_progress(metrics),
                    LinkEvent::Closed { reason } => break LinkEnd::Lost(reason),
                },
                _ = health.tick() => {
                    if let LinkHealth::Unhealthy(reason) = link.health_check().await {
                        break LinkEnd::Lost(reason);
                    }
                }
            }
        };

        link.disconnect(self.grace).await;
        end
    }

    fn next_event(&mut self, kind: WorkerEventKind) -> WorkerEvent {
        self.sequence += 1;
        WorkerEvent {
            destination_id: self.destination.id.clone(),
            sequence: self.sequence,
            kind,
            observed_at: Utc::now(),
        }
    }

    async fn emit(&mut self, kind: WorkerEventKind) {
        let event = self.next_event(kind);
        // The monitor only goes away together with the instance
        let _ = self.events.send(event).await;
    }

    /// Progress is best effort: a busy monitor loses intermediate reports.
    fn report_progress(&mut self, metrics: RelayMetrics) {
        let event = self.next_event(WorkerEventKind::Progress(metrics));
        let _ = self.events.try_send(event);
    }
}

/// Owner's side of a running worker.
pub(crate) struct RelayWorkerHandle {
    destination_id: String,
    cancel_token: CancellationToken,
    task: JoinHandle<()>,
}

impl RelayWorkerHandle {
    /// Ask the worker to stop and wait for it, aborting it once `grace` has
    /// passed.
    pub(crate) async fn shutdown(self, grace: Duration) {
        self.cancel_token.cancel();
        let mut task = self.task;

        match tokio::time::timeout(grace + SHUTDOWN_MARGIN, &mut task).await {
            Ok(Ok(())) => debug!(destination_id = %self.destination_id, "Relay worker finished"),
            Ok(Err(e)) if e.is_panic() => {
                error!(destination_id = %self.destination_id, "Relay worker panicked");
            }
            Ok(Err(_)) => {}
            Err(_) => {
                warn!(
                    destination_id = %self.destination_id,
                    grace_secs = grace.as_secs_f64(),
                    "Relay worker did not stop within grace period, aborting"
                );
                task.abort();
            }
        }
    }
}
