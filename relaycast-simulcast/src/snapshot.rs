//! Immutable views of an instance, handed out to callers.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::destination::{DestinationState, DestinationStatus, Platform, Protocol, RelayMetrics};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationSnapshot {
    pub destination_id: String,
    pub platform: Platform,
    pub protocol: Protocol,
    pub status: DestinationStatus,
    pub error_message: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_update: DateTime<Utc>,
    pub reconnect_attempts: u32,
    pub metrics: Option<RelayMetrics>,
}

impl From<&DestinationState> for DestinationSnapshot {
    fn from(state: &DestinationState) -> Self {
        Self {
            destination_id: state.destination_id.clone(),
            platform: state.platform.clone(),
            protocol: state.protocol,
            status: state.status,
            error_message: state.error_message.clone(),
            connected_at: state.connected_at,
            last_update: state.last_update,
            reconnect_attempts: state.reconnect_attempts,
            metrics: state.metrics.clone(),
        }
    }
}

/// Point-in-time copy of one simulcast, safe to keep after the instance is
/// gone.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSnapshot {
    pub stream_key: String,
    /// An instance exists in the registry for this key
    pub is_active: bool,
    pub start_time: DateTime<Utc>,
    pub destinations: Vec<DestinationSnapshot>,
}

impl InstanceSnapshot {
    #[must_use]
    pub fn destination(&self, destination_id: &str) -> Option<&DestinationSnapshot> {
        self.destinations
            .iter()
            .find(|d| d.destination_id == destination_id)
    }

    #[must_use]
    pub fn count_by_status(&self, status: DestinationStatus) -> usize {
        self.destinations
            .iter()
            .filter(|d| d.status == status)
            .count()
    }
}
