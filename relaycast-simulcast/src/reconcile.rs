//! Merging run-time status with a persisted destination list.
//!
//! Stored destination rows are a cache that can lag behind the engine. For
//! display, run-time status and error win for every destination the engine
//! knows about; rows it does not know keep what was stored.

use serde::{Deserialize, Serialize};

use crate::snapshot::InstanceSnapshot;

/// A destination row as kept by an external store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedDestination {
    pub destination_id: String,
    pub platform: String,
    pub status: String,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciledDestination {
    pub destination_id: String,
    pub platform: String,
    pub status: String,
    pub error_message: Option<String>,
    /// Status comes from the running engine rather than the store
    pub live: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciledStatus {
    pub is_active: bool,
    pub destinations: Vec<ReconciledDestination>,
}

/// Merge a run-time snapshot (if the stream is active) over persisted rows.
///
/// Persisted order is kept; destinations only the engine knows are appended.
#[must_use]
pub fn merge_with_persisted(
    snapshot: Option<&InstanceSnapshot>,
    persisted: &[PersistedDestination],
) -> ReconciledStatus {
    let mut destinations: Vec<ReconciledDestination> = persisted
        .iter()
        .map(|row| {
            match snapshot.and_then(|s| s.destination(&row.destination_id)) {
                Some(live) => ReconciledDestination {
                    destination_id: row.destination_id.clone(),
                    platform: row.platform.clone(),
                    status: live.status.as_str().to_string(),
                    error_message: live.error_message.clone(),
                    live: true,
                },
                None => ReconciledDestination {
                    destination_id: row.destination_id.clone(),
                    platform: row.platform.clone(),
                    status: row.status.clone(),
                    error_message: row.error_message.clone(),
                    live: false,
                },
            }
        })
        .collect();

    if let Some(snapshot) = snapshot {
        for dest in &snapshot.destinations {
            if persisted.iter().any(|row| row.destination_id == dest.destination_id) {
                continue;
            }
            destinations.push(ReconciledDestination {
                destination_id: dest.destination_id.clone(),
                platform: dest.platform.to_string(),
                status: dest.status.as_str().to_string(),
                error_message: dest.error_message.clone(),
                live: true,
            });
        }
    }

    ReconciledStatus {
        is_active: snapshot.is_some_and(|s| s.is_active),
        destinations,
    }
}
