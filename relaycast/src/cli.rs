use anyhow::{anyhow, bail, Result};
use clap::{Args, Parser, Subcommand};

use relaycast_simulcast::{DestinationConfig, Platform, Protocol};

#[derive(Parser, Debug)]
#[command(name = "relaycast")]
#[command(version, about = "Relay one live ingest to many streaming platforms", long_about = None)]
pub struct Cli {
    /// Config file (YAML or TOML)
    #[arg(long, global = true, env = "RELAYCAST_CONFIG_PATH")]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server, optionally starting one simulcast right away
    Run(RunArgs),
    /// Load and validate the configuration, then print it as JSON
    CheckConfig,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Stream key of the ingest to relay
    #[arg(long)]
    pub stream_key: Option<String>,

    /// Destination as `id=yt,platform=youtube,protocol=rtmp,url=rtmp://...,key=...`
    #[arg(long = "destination", value_name = "DEST")]
    pub destinations: Vec<String>,

    /// Seconds between status reports
    #[arg(long, default_value_t = 10)]
    pub status_interval: u64,
}

/// Parse a `--destination` value.
///
/// `platform` is required. `url` may be left out for platforms with a default
/// ingest endpoint, `protocol` is then taken from the platform or inferred
/// from the URL scheme. `id` defaults to the platform name.
pub fn parse_destination(spec: &str) -> Result<DestinationConfig> {
    let mut id = None;
    let mut platform = None;
    let mut protocol = None;
    let mut url = None;
    let mut key = None;

    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (name, value) = part
            .split_once('=')
            .ok_or_else(|| anyhow!("expected name=value, got {part:?}"))?;
        let value = value.trim().to_string();
        match name.trim() {
            "id" => id = Some(value),
            "platform" => platform = Some(Platform::from(value)),
            "protocol" => protocol = Some(value.parse::<Protocol>()?),
            "url" => url = Some(value),
            "key" => key = Some(value),
            other => bail!("unknown destination field {other:?}"),
        }
    }

    let platform = platform.ok_or_else(|| anyhow!("destination is missing platform="))?;
    let id = id.unwrap_or_else(|| platform.as_str().to_string());
    let key = key.unwrap_or_default();

    match url {
        Some(url) => {
            let protocol = match protocol {
                Some(protocol) => protocol,
                None => protocol_from_scheme(&url)?,
            };
            Ok(DestinationConfig::new(id, platform, protocol, url, key))
        }
        None => {
            let destination = DestinationConfig::for_platform(id, platform, key)?;
            if let Some(protocol) = protocol {
                if protocol != destination.protocol {
                    bail!(
                        "platform {} ingests over {}, pass url= to use {protocol}",
                        destination.platform,
                        destination.protocol
                    );
                }
            }
            Ok(destination)
        }
    }
}

fn protocol_from_scheme(url: &str) -> Result<Protocol> {
    let scheme = url
        .split_once("://")
        .map(|(scheme, _)| scheme.to_ascii_lowercase())
        .ok_or_else(|| anyhow!("destination url has no scheme: {url}"))?;
    match scheme.as_str() {
        "rtmp" => Ok(Protocol::Rtmp),
        "rtmps" => Ok(Protocol::Rtmps),
        "srt" => Ok(Protocol::Srt),
        "http" | "https" => Ok(Protocol::Whip),
        other => bail!("cannot infer protocol from scheme {other}://, pass protocol="),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_destination() {
        let dest = parse_destination(
            "id=tw,platform=twitch,protocol=rtmp,url=rtmp://live.twitch.tv/app,key=live_123",
        )
        .unwrap();
        assert_eq!(dest.id, "tw");
        assert_eq!(dest.platform, Platform::Twitch);
        assert_eq!(dest.protocol, Protocol::Rtmp);
        assert_eq!(dest.endpoint, "rtmp://live.twitch.tv/app");
        assert_eq!(dest.credential(), "live_123");
    }

    #[test]
    fn test_parse_uses_platform_default() {
        let dest = parse_destination("platform=youtube,key=abcd").unwrap();
        assert_eq!(dest.id, "youtube");
        assert_eq!(dest.endpoint, "rtmp://a.rtmp.youtube.com/live2");
        assert_eq!(dest.protocol, Protocol::Rtmp);

        assert!(parse_destination("platform=youtube,protocol=srt,key=abcd").is_err());
        assert!(parse_destination("platform=kick,key=abcd").is_err());
    }

    #[test]
    fn test_parse_infers_protocol() {
        let srt = parse_destination("id=gw,platform=my-gateway,url=srt://gw.example.com:9000?latency=200,key=k")
            .unwrap();
        assert_eq!(srt.protocol, Protocol::Srt);
        assert_eq!(srt.endpoint, "srt://gw.example.com:9000?latency=200");

        let whip = parse_destination("platform=cloudflare,url=https://whip.example.com/live,key=t").unwrap();
        assert_eq!(whip.protocol, Protocol::Whip);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_destination("id=x").is_err());
        assert!(parse_destination("platform=twitch,colour=blue").is_err());
        assert!(parse_destination("platform=twitch,novalue").is_err());
        assert!(parse_destination("platform=custom,url=ftp://x/y").is_err());
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "relaycast",
            "run",
            "--stream-key",
            "s1",
            "--destination",
            "platform=youtube,key=a",
            "--destination",
            "platform=twitch,key=b",
        ])
        .unwrap();
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.stream_key.as_deref(), Some("s1"));
                assert_eq!(args.destinations.len(), 2);
                assert_eq!(args.status_interval, 10);
            }
            Command::CheckConfig => panic!("expected run"),
        }
    }
}
