//! RTMP and RTMPS publishing (FLV over a TCP or TLS session).

use url::Url;

use super::{append_path_segment, OutputProfile};
use crate::destination::DestinationConfig;

/// Publishes FLV to `rtmp://host/app/<stream key>`.
///
/// The secure flavour is identical apart from the `rtmps` scheme; ffmpeg
/// negotiates TLS itself.
#[derive(Debug, Clone, Copy)]
pub struct RtmpTransport {
    secure: bool,
}

impl RtmpTransport {
    #[must_use]
    pub const fn plain() -> Self {
        Self { secure: false }
    }

    #[must_use]
    pub const fn secure() -> Self {
        Self { secure: true }
    }

    const fn scheme(self) -> &'static str {
        if self.secure {
            "rtmps"
        } else {
            "rtmp"
        }
    }
}

impl OutputProfile for RtmpTransport {
    fn validate(&self, destination: &DestinationConfig) -> Result<(), String> {
        let url = Url::parse(&destination.endpoint)
            .map_err(|e| format!("invalid endpoint URL: {e}"))?;
        if url.scheme() != self.scheme() {
            return Err(format!(
                "expected {}:// endpoint, got {}://",
                self.scheme(),
                url.scheme()
            ));
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err("endpoint has no host".to_string());
        }
        if destination.credential().is_empty() {
            return Err("stream key is required".to_string());
        }
        Ok(())
    }

    fn target(&self, destination: &DestinationConfig, credential: &str) -> String {
        append_path_segment(&destination.endpoint, credential)
    }

    fn output_args(&self, destination: &DestinationConfig) -> Vec<String> {
        vec![
            "-c".to_string(),
            "copy".to_string(),
            "-f".to_string(),
            "flv".to_string(),
            self.target(destination, destination.credential()),
        ]
    }
}
