use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tandem_proto::DEFAULT_MAX_FRAME_BYTES;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    /// How long a fresh socket may wait before sending `introduction`.
    pub intro_timeout: Duration,
    /// Endpoints silent for longer than this are evicted.
    pub heartbeat_timeout: Duration,
    pub heartbeat_sweep: Duration,
    pub max_frame_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            intro_timeout: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(600),
            heartbeat_sweep: Duration::from_secs(60),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "tandem-road",
    author,
    version,
    about = "Signaling relay for perfect-negotiation peers"
)]
pub struct Cli {
    /// Address to bind the HTTP and websocket listener to.
    #[arg(long, env = "TANDEM_ROAD_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Seconds a new connection has to introduce itself.
    #[arg(long, env = "TANDEM_ROAD_INTRO_TIMEOUT_SECS", default_value_t = 10)]
    pub intro_timeout_secs: u64,

    /// Seconds without a ping before an endpoint is evicted.
    #[arg(long, env = "TANDEM_ROAD_HEARTBEAT_TIMEOUT_SECS", default_value_t = 600)]
    pub heartbeat_timeout_secs: u64,

    /// Interval between heartbeat sweeps.
    #[arg(long, env = "TANDEM_ROAD_HEARTBEAT_SWEEP_SECS", default_value_t = 60)]
    pub heartbeat_sweep_secs: u64,

    /// Largest accepted text frame, in bytes.
    #[arg(long, env = "TANDEM_ROAD_MAX_FRAME_BYTES", default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    pub max_frame_bytes: usize,
}

impl TryFrom<Cli> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        anyhow::ensure!(cli.intro_timeout_secs > 0, "intro timeout must be positive");
        anyhow::ensure!(cli.heartbeat_sweep_secs > 0, "heartbeat sweep must be positive");
        anyhow::ensure!(cli.max_frame_bytes > 0, "max frame size must be positive");
        Ok(RelayConfig {
            listen_addr,
            intro_timeout: Duration::from_secs(cli.intro_timeout_secs),
            heartbeat_timeout: Duration::from_secs(cli.heartbeat_timeout_secs),
            heartbeat_sweep: Duration::from_secs(cli.heartbeat_sweep_secs),
            max_frame_bytes: cli.max_frame_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn defaults_match_cli_defaults() {
        let cli = Cli::try_parse_from(["tandem-road"]).unwrap();
        let config = RelayConfig::try_from(cli).unwrap();
        let defaults = RelayConfig::default();
        assert_eq!(config.listen_addr, defaults.listen_addr);
        assert_eq!(config.intro_timeout, defaults.intro_timeout);
        assert_eq!(config.heartbeat_timeout, defaults.heartbeat_timeout);
        assert_eq!(config.heartbeat_sweep, defaults.heartbeat_sweep);
        assert_eq!(config.max_frame_bytes, 65536);
    }

    #[test_timeout::timeout]
    fn rejects_bad_listen_address() {
        let cli = Cli::try_parse_from(["tandem-road", "--listen-addr", "not-an-addr"]).unwrap();
        let err = RelayConfig::try_from(cli).unwrap_err();
        assert!(err.to_string().contains("invalid listen address"));
    }

    #[test_timeout::timeout]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "tandem-road",
            "--listen-addr",
            "127.0.0.1:9000",
            "--intro-timeout-secs",
            "3",
            "--max-frame-bytes",
            "1024",
        ])
        .unwrap();
        let config = RelayConfig::try_from(cli).unwrap();
        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(config.intro_timeout, Duration::from_secs(3));
        assert_eq!(config.max_frame_bytes, 1024);
    }
}
