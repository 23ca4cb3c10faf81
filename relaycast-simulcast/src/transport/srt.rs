//! SRT publishing (MPEG-TS over SRT in caller mode).

use url::Url;

use super::OutputProfile;
use crate::destination::DestinationConfig;

/// Publishes MPEG-TS to `srt://host:port`, passing the stream key as the SRT
/// `streamid`.
#[derive(Debug, Clone, Copy)]
pub struct SrtTransport;

impl OutputProfile for SrtTransport {
    fn validate(&self, destination: &DestinationConfig) -> Result<(), String> {
        let url = Url::parse(&destination.endpoint)
            .map_err(|e| format!("invalid endpoint URL: {e}"))?;
        if url.scheme() != "srt" {
            return Err(format!("expected srt:// endpoint, got {}://", url.scheme()));
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err("endpoint has no host".to_string());
        }
        if url.port().is_none() {
            return Err("SRT endpoint needs an explicit port".to_string());
        }
        Ok(())
    }

    fn target(&self, destination: &DestinationConfig, credential: &str) -> String {
        let Ok(mut url) = Url::parse(&destination.endpoint) else {
            return destination.endpoint.clone();
        };
        let has_mode = url.query_pairs().any(|(k, _)| k == "mode");
        {
            let mut pairs = url.query_pairs_mut();
            if !has_mode {
                pairs.append_pair("mode", "caller");
            }
            if !credential.is_empty() {
                pairs.append_pair("streamid", credential);
            }
        }
        url.to_string()
    }

    fn output_args(&self, destination: &DestinationConfig) -> Vec<String> {
        vec![
            "-c".to_string(),
            "copy".to_string(),
            "-f".to_string(),
            "mpegts".to_string(),
            self.target(destination, destination.credential()),
        ]
    }
}
