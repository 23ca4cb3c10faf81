// Scripted transport for testing the engine without ffmpeg

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{LinkEvent, LinkHealth, RelayLink, RelayTransport, TransportProvider};
use crate::destination::{DestinationConfig, Protocol};
use crate::error::{SimulcastError, SimulcastResult};
use crate::ingest::IngestSource;

/// Outcome of one connect attempt.
#[derive(Debug, Clone)]
pub(crate) enum ConnectScript {
    Succeed,
    Fail(String),
    /// The relay cannot be launched at all
    SpawnFail(String),
    /// Never completes, like a destination that swallows the handshake
    Hang,
}

#[derive(Default)]
struct MockState {
    scripts: HashMap<String, VecDeque<ConnectScript>>,
    rejected: HashMap<String, String>,
    hang_on_disconnect: HashSet<String>,
    unhealthy: HashMap<String, String>,
    panicking: HashSet<String>,
    links: HashMap<String, mpsc::UnboundedSender<LinkEvent>>,
    connects: HashMap<String, u32>,
    disconnected: HashSet<String>,
}

/// Serves every protocol. Connects succeed unless scripted otherwise.
#[derive(Clone, Default)]
pub(crate) struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes for the next connect attempts of `id`.
    pub(crate) fn script(&self, id: &str, outcomes: impl IntoIterator<Item = ConnectScript>) {
        self.state
            .lock()
            .scripts
            .entry(id.to_string())
            .or_default()
            .extend(outcomes);
    }

    pub(crate) fn reject(&self, id: &str, reason: &str) {
        self.state
            .lock()
            .rejected
            .insert(id.to_string(), reason.to_string());
    }

    pub(crate) fn hang_on_disconnect(&self, id: &str) {
        self.state.lock().hang_on_disconnect.insert(id.to_string());
    }

    /// Fail the next health check of `id`'s live link.
    pub(crate) fn make_unhealthy(&self, id: &str, reason: &str) {
        self.state
            .lock()
            .unhealthy
            .insert(id.to_string(), reason.to_string());
    }

    /// Make the next health check of `id`'s live link panic.
    pub(crate) fn panic_on_health_check(&self, id: &str) {
        self.state.lock().panicking.insert(id.to_string());
    }

    /// Drop `id`'s live link from the remote side.
    pub(crate) fn kill(&self, id: &str, reason: &str) -> bool {
        self.emit(
            id,
            LinkEvent::Closed {
                reason: reason.to_string(),
            },
        )
    }

    pub(crate) fn emit(&self, id: &str, event: LinkEvent) -> bool {
        self.state
            .lock()
            .links
            .get(id)
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    pub(crate) fn connect_count(&self, id: &str) -> u32 {
        self.state.lock().connects.get(id).copied().unwrap_or(0)
    }

    pub(crate) fn was_disconnected(&self, id: &str) -> bool {
        self.state.lock().disconnected.contains(id)
    }
}

impl TransportProvider for MockTransport {
    fn transport_for(&self, _protocol: Protocol) -> Arc<dyn RelayTransport> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl RelayTransport for MockTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Rtmp
    }

    fn prepare(&self, destination: &DestinationConfig) -> SimulcastResult<()> {
        match self.state.lock().rejected.get(&destination.id) {
            Some(reason) => Err(SimulcastError::SpawnFailure(format!(
                "destination {}: {reason}",
                destination.id
            ))),
            None => Ok(()),
        }
    }

    async fn connect(
        &self,
        _ingest: &IngestSource,
        destination: &DestinationConfig,
    ) -> SimulcastResult<Box<dyn RelayLink>> {
        let id = destination.id.clone();
        let script = {
            let mut state = self.state.lock();
            *state.connects.entry(id.clone()).or_default() += 1;
            state
                .scripts
                .get_mut(&id)
                .and_then(VecDeque::pop_front)
                .unwrap_or(ConnectScript::Succeed)
        };

        match script {
            ConnectScript::Succeed => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.state.lock().links.insert(id.clone(), tx);
                Ok(Box::new(MockLink {
                    id,
                    rx,
                    state: Arc::clone(&self.state),
                }))
            }
            ConnectScript::Fail(reason) => Err(SimulcastError::Connection(reason)),
            ConnectScript::SpawnFail(reason) => Err(SimulcastError::SpawnFailure(reason)),
            ConnectScript::Hang => std::future::pending().await,
        }
    }
}

struct MockLink {
    id: String,
    rx: mpsc::UnboundedReceiver<LinkEvent>,
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl RelayLink for MockLink {
    async fn next_event(&mut self) -> LinkEvent {
        match self.rx.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        }
    }

    async fn health_check(&mut self) -> LinkHealth {
        let panicking = self.state.lock().panicking.remove(&self.id);
        assert!(!panicking, "link {} blew up", self.id);
        match self.state.lock().unhealthy.remove(&self.id) {
            Some(reason) => LinkHealth::Unhealthy(reason),
            None => LinkHealth::Healthy,
        }
    }

    async fn disconnect(&mut self, _grace: Duration) {
        let hang = self.state.lock().hang_on_disconnect.contains(&self.id);
        if hang {
            std::future::pending::<()>().await;
        }
        let mut state = self.state.lock();
        state.disconnected.insert(self.id.clone());
        state.links.remove(&self.id);
    }
}
