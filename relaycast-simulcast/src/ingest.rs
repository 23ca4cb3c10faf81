//! The live source every relay of one stream reads from.

use relaycast_core::config::STREAM_KEY_PLACEHOLDER;

/// Ingest tap shared read-only by all relay workers of one simulcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestSource {
    stream_key: String,
    url: String,
}

impl IngestSource {
    pub fn new(stream_key: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            stream_key: stream_key.into(),
            url: url.into(),
        }
    }

    /// Resolve the ingest URL by substituting the stream key into `template`.
    #[must_use]
    pub fn from_template(template: &str, stream_key: &str) -> Self {
        Self::new(stream_key, template.replace(STREAM_KEY_PLACEHOLDER, stream_key))
    }

    #[must_use]
    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}
