//! Destination model: where a stream is relayed to and how it is doing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{SimulcastError, SimulcastResult};
use crate::util::redact_credential;

/// Wire protocol used for one outbound connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Rtmp,
    Rtmps,
    Srt,
    Whip,
}

impl Protocol {
    pub const ALL: [Self; 4] = [Self::Rtmp, Self::Rtmps, Self::Srt, Self::Whip];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rtmp => "RTMP",
            Self::Rtmps => "RTMPS",
            Self::Srt => "SRT",
            Self::Whip => "WHIP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = SimulcastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rtmp" => Ok(Self::Rtmp),
            "rtmps" => Ok(Self::Rtmps),
            "srt" => Ok(Self::Srt),
            "whip" => Ok(Self::Whip),
            other => Err(SimulcastError::InvalidInput(format!(
                "unknown protocol: {other}"
            ))),
        }
    }
}

/// Platform a destination belongs to.
///
/// Known platforms carry a default ingest endpoint so callers only need to
/// supply the stream key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Platform {
    YouTube,
    Twitch,
    Facebook,
    Kick,
    Custom(String),
}

impl Platform {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::YouTube => "youtube",
            Self::Twitch => "twitch",
            Self::Facebook => "facebook",
            Self::Kick => "kick",
            Self::Custom(name) => name,
        }
    }

    /// Default ingest endpoint and protocol, if the platform has a fixed one.
    #[must_use]
    pub fn default_endpoint(&self) -> Option<(&'static str, Protocol)> {
        match self {
            Self::YouTube => Some(("rtmp://a.rtmp.youtube.com/live2", Protocol::Rtmp)),
            Self::Twitch => Some(("rtmp://live.twitch.tv/app", Protocol::Rtmp)),
            Self::Facebook => Some(("rtmps://live-api-s.facebook.com:443/rtmp", Protocol::Rtmps)),
            // Kick hands out a per-channel ingest server
            Self::Kick | Self::Custom(_) => None,
        }
    }
}

impl From<String> for Platform {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "youtube" | "yt" => Self::YouTube,
            "twitch" => Self::Twitch,
            "facebook" | "fb" => Self::Facebook,
            "kick" => Self::Kick,
            _ => Self::Custom(value),
        }
    }
}

impl From<Platform> for String {
    fn from(value: Platform) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One destination a stream is relayed to.
///
/// Immutable for the lifetime of its relay worker; changing it means replacing
/// the worker. The credential never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct DestinationConfig {
    pub id: String,
    pub platform: Platform,
    pub protocol: Protocol,
    pub endpoint: String,
    credential: String,
}

impl DestinationConfig {
    pub fn new(
        id: impl Into<String>,
        platform: Platform,
        protocol: Protocol,
        endpoint: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            platform,
            protocol,
            endpoint: endpoint.into(),
            credential: credential.into(),
        }
    }

    /// Build a destination from the platform's default ingest endpoint.
    pub fn for_platform(
        id: impl Into<String>,
        platform: Platform,
        credential: impl Into<String>,
    ) -> SimulcastResult<Self> {
        let (endpoint, protocol) = platform.default_endpoint().ok_or_else(|| {
            SimulcastError::InvalidInput(format!(
                "platform {platform} has no default endpoint, an explicit URL is required"
            ))
        })?;
        Ok(Self::new(id, platform, protocol, endpoint, credential))
    }

    /// Stream key or token for the destination. Only transports read this.
    #[must_use]
    pub fn credential(&self) -> &str {
        &self.credential
    }
}

impl fmt::Debug for DestinationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestinationConfig")
            .field("id", &self.id)
            .field("platform", &self.platform)
            .field("protocol", &self.protocol)
            .field("endpoint", &self.endpoint)
            .field("credential", &redact_credential(&self.credential))
            .finish()
    }
}

/// Run-time status of a destination.
///
/// ```text
/// PENDING -> CONNECTING -> CONNECTED -> ERROR | STOPPED
///                 ^            |
///                 +------------+  (reconnect while attempts remain)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DestinationStatus {
    Pending,
    Connecting,
    Connected,
    Error,
    Stopped,
}

impl DestinationStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Error => "ERROR",
            Self::Stopped => "STOPPED",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Error | Self::Stopped)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Error | Self::Stopped, _) | (_, Self::Pending) => false,
            (Self::Pending, Self::Connected) => false,
            _ => true,
        }
    }
}

impl fmt::Display for DestinationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Throughput figures reported by a relay while it is connected.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayMetrics {
    pub frames: u64,
    pub fps: f64,
    pub bitrate_kbps: f64,
    pub total_size_bytes: u64,
    pub out_time_ms: u64,
    pub speed: f64,
    pub dropped_frames: u64,
}

/// Authoritative run-time state of one destination.
///
/// Written only by the status monitor; everyone else reads snapshots.
#[derive(Debug, Clone)]
pub struct DestinationState {
    pub destination_id: String,
    pub platform: Platform,
    pub protocol: Protocol,
    pub status: DestinationStatus,
    pub error_message: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_update: DateTime<Utc>,
    pub reconnect_attempts: u32,
    pub metrics: Option<RelayMetrics>,
    /// Sequence number of the last applied worker event
    pub(crate) last_sequence: u64,
}

impl DestinationState {
    pub(crate) fn pending(config: &DestinationConfig) -> Self {
        Self {
            destination_id: config.id.clone(),
            platform: config.platform.clone(),
            protocol: config.protocol,
            status: DestinationStatus::Pending,
            error_message: None,
            connected_at: None,
            last_update: Utc::now(),
            reconnect_attempts: 0,
            metrics: None,
            last_sequence: 0,
        }
    }

    /// State for a destination whose relay could not be created at all.
    pub(crate) fn spawn_failed(config: &DestinationConfig, reason: String) -> Self {
        Self {
            status: DestinationStatus::Error,
            error_message: Some(reason),
            ..Self::pending(config)
        }
    }
}
