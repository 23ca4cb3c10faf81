//! Status monitor: the only writer of an instance's destination states.

use indexmap::IndexMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, Instrument};

use crate::destination::{DestinationState, DestinationStatus};
use crate::worker::{WorkerEvent, WorkerEventKind};

/// Destination states of one instance, in start order.
pub(crate) type SharedStates = Arc<RwLock<IndexMap<String, DestinationState>>>;

pub(crate) struct StatusMonitor {
    states: SharedStates,
}

impl StatusMonitor {
    /// Spawn the monitor for one instance. It runs until every worker has
    /// dropped its event sender.
    pub(crate) fn spawn(
        stream_key: &str,
        states: SharedStates,
        events: mpsc::Receiver<WorkerEvent>,
    ) -> JoinHandle<()> {
        let span = tracing::info_span!("status_monitor", stream_key = %stream_key);
        let monitor = Self { states };
        tokio::spawn(monitor.run(events).instrument(span))
    }

    async fn run(self, mut events: mpsc::Receiver<WorkerEvent>) {
        while let Some(event) = events.recv().await {
            let transition = {
                let mut states = self.states.write();
                let Some(state) = states.get_mut(&event.destination_id) else {
                    // Destination was removed while its worker wound down
                    continue;
                };
                let before = state.status;
                if apply_event(state, &event) && state.status != before {
                    Some((before, state.status, state.error_message.clone()))
                } else {
                    None
                }
            };

            if let Some((from, to, error)) = transition {
                info!(
                    destination_id = %event.destination_id,
                    %from,
                    %to,
                    error = error.as_deref().unwrap_or(""),
                    "Destination status changed"
                );
            }
        }
        debug!("All relay workers gone, status monitor exiting");
    }
}

/// Apply one worker event to a destination state.
///
/// Returns whether the event was applied. Events that are not newer than the
/// last applied one, events after a terminal status, and transitions the state
/// machine forbids are ignored, so applying the same event twice is a no-op.
pub(crate) fn apply_event(state: &mut DestinationState, event: &WorkerEvent) -> bool {
    if event.sequence <= state.last_sequence || state.status.is_terminal() {
        return false;
    }

    let applied = match &event.kind {
        WorkerEventKind::Connecting { .. } => transition(state, DestinationStatus::Connecting),
        WorkerEventKind::Connected => {
            let ok = transition(state, DestinationStatus::Connected);
            if ok {
                state.connected_at = Some(event.observed_at);
                state.error_message = None;
                state.reconnect_attempts = 0;
            }
            ok
        }
        WorkerEventKind::Progress(metrics) => {
            let ok = state.status == DestinationStatus::Connected;
            if ok {
                state.metrics = Some(metrics.clone());
            }
            ok
        }
        WorkerEventKind::Reconnecting { attempt, reason } => {
            let ok = transition(state, DestinationStatus::Connecting);
            if ok {
                state.error_message = Some(reason.clone());
                state.reconnect_attempts = *attempt;
                state.connected_at = None;
                state.metrics = None;
            }
            ok
        }
        WorkerEventKind::Failed { reason } => {
            let ok = transition(state, DestinationStatus::Error);
            if ok {
                state.error_message = Some(reason.clone());
                state.connected_at = None;
            }
            ok
        }
        WorkerEventKind::Stopped => transition(state, DestinationStatus::Stopped),
    };

    if applied {
        state.last_sequence = event.sequence;
        state.last_update = event.observed_at;
    }
    applied
}

fn transition(state: &mut DestinationState, next: DestinationStatus) -> bool {
    if state.status.can_transition_to(next) {
        state.status = next;
        true
    } else {
        false
    }
}
