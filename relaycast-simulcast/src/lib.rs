// relaycast-simulcast - fan one live ingest out to many streaming platforms
//
// Architecture:
// - registry     - stream key -> running instance, per-key locking
// - instance     - one simulcast: relay workers plus their destination states
// - worker       - supervises one destination's outbound connection, retries
// - monitor      - applies worker events to destination states (sole writer)
// - transport/   - protocol transports (RTMP, RTMPS, SRT, WHIP) over ffmpeg
// - snapshot     - immutable status views for callers
// - reconcile    - merging run-time status with persisted destination rows
//
// Destination failures never escape as errors; they are recorded on the
// destination and visible through `SimulcastRegistry::status`.

pub mod destination;
pub mod error;
pub mod ingest;
pub mod instance;
mod monitor;
pub mod reconcile;
pub mod registry;
pub mod snapshot;
pub mod transport;
pub mod util;
pub mod worker;

pub use destination::{
    DestinationConfig, DestinationState, DestinationStatus, Platform, Protocol, RelayMetrics,
};
pub use error::{SimulcastError, SimulcastResult};
pub use ingest::IngestSource;
pub use instance::SimulcastInstance;
pub use reconcile::{merge_with_persisted, PersistedDestination, ReconciledDestination, ReconciledStatus};
pub use registry::{SimulcastRegistry, SimulcastSettings};
pub use snapshot::{DestinationSnapshot, InstanceSnapshot};
pub use transport::{
    FfmpegSettings, FfmpegTransport, FfmpegTransports, LinkEvent, LinkHealth, RelayLink,
    RelayTransport, Transport, TransportProvider,
};
pub use worker::{RetryPolicy, WorkerEvent, WorkerEventKind};
