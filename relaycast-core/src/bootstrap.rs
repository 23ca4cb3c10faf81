//! Configuration loading

use anyhow::Result;

use crate::Config;

/// Load configuration from config file or environment variables
///
/// Config file search order:
/// 1. `explicit_path` (from the command line)
/// 2. RELAYCAST_CONFIG_PATH environment variable
/// 3. ./relaycast.yaml (current working directory)
/// 4. /config/relaycast.yaml (container mount path)
/// 5. Fall back to environment variables only
///
/// Logging is not initialised yet when this runs, so progress goes to stderr.
pub fn load_config(explicit_path: Option<&str>) -> Result<Config> {
    if let Some(path) = explicit_path {
        if !std::path::Path::new(path).is_file() {
            anyhow::bail!("Config file {path} does not exist");
        }
    }

    let config_path = explicit_path
        .map(str::to_string)
        .or_else(|| {
            std::env::var("RELAYCAST_CONFIG_PATH")
                .ok()
                .filter(|p| std::path::Path::new(p).exists())
        })
        .or_else(|| existing("relaycast.yaml"))
        .or_else(|| existing("/config/relaycast.yaml"));

    let config = if let Some(path) = config_path {
        eprintln!("Loading config from {path}");
        Config::from_file(&path)
            .map_err(|e| anyhow::anyhow!("Failed to load {path}: {e}"))?
    } else {
        eprintln!("No config file found, using environment variables");
        Config::from_env().unwrap_or_else(|e| {
            eprintln!("Failed to load config from environment: {e}");
            eprintln!("Using default configuration");
            Config::default()
        })
    };

    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Config validation error: {error}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        ));
    }

    Ok(config)
}

fn existing(path: &str) -> Option<String> {
    if std::path::Path::new(path).exists() {
        Some(path.to_string())
    } else {
        None
    }
}
