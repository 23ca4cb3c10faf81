//! WHIP publishing (WebRTC ingest negotiated over HTTP).

use url::Url;

use super::OutputProfile;
use crate::destination::DestinationConfig;

/// Publishes to a WHIP endpoint using the credential as bearer token.
///
/// WebRTC only carries Opus audio, so audio is re-encoded while video is
/// passed through.
#[derive(Debug, Clone, Copy)]
pub struct WhipTransport;

impl OutputProfile for WhipTransport {
    fn validate(&self, destination: &DestinationConfig) -> Result<(), String> {
        let url = Url::parse(&destination.endpoint)
            .map_err(|e| format!("invalid endpoint URL: {e}"))?;
        if url.scheme() != "https" && url.scheme() != "http" {
            return Err(format!(
                "expected http(s):// WHIP endpoint, got {}://",
                url.scheme()
            ));
        }
        if destination.credential().is_empty() {
            return Err("WHIP bearer token is required".to_string());
        }
        Ok(())
    }

    fn target(&self, destination: &DestinationConfig, _credential: &str) -> String {
        destination.endpoint.clone()
    }

    fn output_args(&self, destination: &DestinationConfig) -> Vec<String> {
        vec![
            "-c:v".to_string(),
            "copy".to_string(),
            "-c:a".to_string(),
            "libopus".to_string(),
            "-f".to_string(),
            "whip".to_string(),
            "-authorization".to_string(),
            destination.credential().to_string(),
            destination.endpoint.clone(),
        ]
    }
}
