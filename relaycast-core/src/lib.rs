// relaycast-core - configuration and logging shared by the RelayCast crates

pub mod bootstrap;
pub mod config;
pub mod logging;

pub use config::{
    Config, IngestConfig, LoggingConfig, RelayConfig, RetryConfig, SimulcastConfig,
};
