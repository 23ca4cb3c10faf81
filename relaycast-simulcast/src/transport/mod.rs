// Protocol transports
//
// A transport turns (ingest, destination) into a live outbound link. The
// engine only sees the capability traits below; which concrete transport
// serves a destination is decided once, from its `Protocol`, by a
// `TransportProvider`.
//
// Production transports all drive one ffmpeg child per link and differ in how
// they validate the endpoint and compose the publish target and muxer.

pub mod ffmpeg;
pub mod rtmp;
pub mod srt;
pub mod whip;

#[cfg(test)]
pub(crate) mod mock;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::{
    destination::{DestinationConfig, Protocol, RelayMetrics},
    error::{SimulcastError, SimulcastResult},
    ingest::IngestSource,
};

pub use ffmpeg::{FfmpegLink, FfmpegSettings};
pub use rtmp::RtmpTransport;
pub use srt::SrtTransport;
pub use whip::WhipTransport;

/// Something observed on a live link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Progress(RelayMetrics),
    /// The link ended without being asked to
    Closed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkHealth {
    Healthy,
    Unhealthy(String),
}

/// A connected outbound link to one destination.
#[async_trait]
pub trait RelayLink: Send {
    /// Wait for the next progress report or for the link to close.
    ///
    /// Must be cancel safe: the worker races it against health checks.
    async fn next_event(&mut self) -> LinkEvent;

    async fn health_check(&mut self) -> LinkHealth;

    /// Close the link, allowing up to `grace` for a clean shutdown before
    /// forcing it.
    async fn disconnect(&mut self, grace: Duration);
}

/// Connection logic for one wire protocol.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Reject destinations this transport can never serve (wrong scheme,
    /// missing credential, no relay binary). Called before a worker is
    /// spawned.
    fn prepare(&self, destination: &DestinationConfig) -> SimulcastResult<()>;

    /// Establish the outbound connection. Returns once the destination has
    /// accepted the stream.
    async fn connect(
        &self,
        ingest: &IngestSource,
        destination: &DestinationConfig,
    ) -> SimulcastResult<Box<dyn RelayLink>>;
}

/// Picks the transport for a protocol.
pub trait TransportProvider: Send + Sync {
    fn transport_for(&self, protocol: Protocol) -> Arc<dyn RelayTransport>;
}

/// Protocol specific part of an ffmpeg relay: endpoint rules, publish target
/// and muxer arguments.
pub trait OutputProfile: Send + Sync {
    fn validate(&self, destination: &DestinationConfig) -> Result<(), String>;

    /// Publish target with `credential` spliced in. Logging passes a redacted
    /// credential here.
    fn target(&self, destination: &DestinationConfig, credential: &str) -> String;

    /// Output side of the ffmpeg command line, target included.
    fn output_args(&self, destination: &DestinationConfig) -> Vec<String>;
}

/// Transport selected by protocol.
pub enum Transport {
    Rtmp(RtmpTransport),
    Rtmps(RtmpTransport),
    Srt(SrtTransport),
    Whip(WhipTransport),
}

/// Ffmpeg-backed transport bound to its settings.
pub struct FfmpegTransport {
    transport: Transport,
    settings: FfmpegSettings,
}

impl Transport {
    #[must_use]
    pub const fn for_protocol(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Rtmp => Self::Rtmp(RtmpTransport::plain()),
            Protocol::Rtmps => Self::Rtmps(RtmpTransport::secure()),
            Protocol::Srt => Self::Srt(SrtTransport),
            Protocol::Whip => Self::Whip(WhipTransport),
        }
    }

    #[must_use]
    pub const fn protocol(&self) -> Protocol {
        match self {
            Self::Rtmp(_) => Protocol::Rtmp,
            Self::Rtmps(_) => Protocol::Rtmps,
            Self::Srt(_) => Protocol::Srt,
            Self::Whip(_) => Protocol::Whip,
        }
    }

    fn profile(&self) -> &dyn OutputProfile {
        match self {
            Self::Rtmp(t) | Self::Rtmps(t) => t,
            Self::Srt(t) => t,
            Self::Whip(t) => t,
        }
    }
}

impl FfmpegTransport {
    #[must_use]
    pub const fn new(transport: Transport, settings: FfmpegSettings) -> Self {
        Self {
            transport,
            settings,
        }
    }
}

#[async_trait]
impl RelayTransport for FfmpegTransport {
    fn protocol(&self) -> Protocol {
        self.transport.protocol()
    }

    fn prepare(&self, destination: &DestinationConfig) -> SimulcastResult<()> {
        if destination.protocol != self.protocol() {
            return Err(SimulcastError::SpawnFailure(format!(
                "{} transport cannot serve {} destination {}",
                self.protocol(),
                destination.protocol,
                destination.id
            )));
        }
        self.transport
            .profile()
            .validate(destination)
            .and_then(|()| self.settings.locate_binary().map(|_| ()))
            .map_err(|reason| {
                SimulcastError::SpawnFailure(format!("destination {}: {reason}", destination.id))
            })
    }

    async fn connect(
        &self,
        ingest: &IngestSource,
        destination: &DestinationConfig,
    ) -> SimulcastResult<Box<dyn RelayLink>> {
        let profile = self.transport.profile();
        let redacted = profile.target(
            destination,
            &crate::util::redact_credential(destination.credential()),
        );
        tracing::info!(
            destination_id = %destination.id,
            protocol = %self.protocol(),
            target = %redacted,
            "Starting relay process"
        );

        let mut link = FfmpegLink::spawn(
            &self.settings,
            ingest.url(),
            profile.output_args(destination),
            destination.credential(),
        )?;
        link.wait_for_handshake().await?;
        Ok(Box::new(link))
    }
}

/// Default provider: one ffmpeg transport per protocol.
pub struct FfmpegTransports {
    transports: Vec<Arc<FfmpegTransport>>,
}

impl FfmpegTransports {
    #[must_use]
    pub fn new(settings: FfmpegSettings) -> Self {
        let transports = Protocol::ALL
            .iter()
            .map(|protocol| {
                Arc::new(FfmpegTransport::new(
                    Transport::for_protocol(*protocol),
                    settings.clone(),
                ))
            })
            .collect();
        Self { transports }
    }
}

impl TransportProvider for FfmpegTransports {
    fn transport_for(&self, protocol: Protocol) -> Arc<dyn RelayTransport> {
        // `new` builds one transport for every protocol in `Protocol::ALL` order
        let index = Protocol::ALL
            .iter()
            .position(|p| *p == protocol)
            .unwrap_or_default();
        self.transports[index].clone()
    }
}

/// Splice a credential onto the end of a URL path.
pub(crate) fn append_path_segment(endpoint: &str, segment: &str) -> String {
    let base = endpoint.trim_end_matches('/');
    if segment.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{segment}")
    }
}
