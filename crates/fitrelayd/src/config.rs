//! Configuration for fitrelayd

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// fitrelayd - fitness-event relay daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "fitrelayd")]
#[command(about = "Publish-subscribe relay for signed health and fitness events")]
pub struct Config {
    /// Listen address for the WebSocket wire protocol
    #[arg(long, env = "FITRELAY_LISTEN_ADDRESS", default_value = "0.0.0.0:9300")]
    pub listen_address: SocketAddr,

    /// Listen address for the admin/metadata HTTP surface
    #[arg(long, env = "FITRELAY_HTTP_LISTEN_ADDRESS", default_value = "0.0.0.0:9301")]
    pub http_listen_address: SocketAddr,

    /// Backing store locator: a directory for the embedded database
    #[arg(long, env = "FITRELAY_DATABASE_URL", default_value = "./data/fitrelayd")]
    pub database_url: PathBuf,

    /// Hex-encoded Ed25519 seed for the relay's reference-event identity.
    /// When omitted, a seed is generated on first start and persisted
    /// alongside the event store so later restarts reuse the same pubkey.
    #[arg(long, env = "FITRELAY_SERVER_IDENTITY_SEED")]
    pub server_identity_seed: Option<String>,

    /// Contact advertised on the metadata endpoint
    #[arg(long, env = "FITRELAY_SERVER_CONTACT", default_value = "")]
    pub server_contact: String,

    /// Per-connection outbound queue depth
    #[arg(long, env = "FITRELAY_MAX_OUTBOUND_QUEUE", default_value = "256")]
    pub max_outbound_queue: usize,

    /// Default limit applied to a query when the client omits one
    #[arg(long, env = "FITRELAY_DEFAULT_QUERY_LIMIT", default_value = "100")]
    pub default_query_limit: usize,

    /// Upper bound on any query's effective limit
    #[arg(long, env = "FITRELAY_MAX_QUERY_LIMIT", default_value = "500")]
    pub max_query_limit: usize,

    /// How far into the future an event's created_at may sit before CLOCK_SKEW
    #[arg(long, env = "FITRELAY_CLOCK_SKEW_FUTURE_SECONDS", default_value = "900")]
    pub clock_skew_future_seconds: i64,

    /// Staleness threshold for satellite liveness
    #[arg(long, env = "FITRELAY_SATELLITE_LIVENESS_SECONDS", default_value = "86400")]
    pub satellite_liveness_seconds: u64,

    /// Interval between expiry sweeps
    #[arg(long, env = "FITRELAY_EXPIRY_SWEEP_INTERVAL_SECONDS", default_value = "3600")]
    pub expiry_sweep_interval_seconds: u64,

    /// Wall-clock ceiling for satellite-forwarding retry backoff
    #[arg(long, env = "FITRELAY_FORWARD_RETRY_CEILING_SECONDS", default_value = "120")]
    pub forward_retry_ceiling_seconds: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Cross-field validation beyond what clap's per-field parsing covers.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_query_limit < self.default_query_limit {
            anyhow::bail!("max_query_limit must be >= default_query_limit");
        }
        if self.max_outbound_queue == 0 {
            anyhow::bail!("max_outbound_queue must be positive");
        }
        if self.default_query_limit == 0 || self.max_query_limit == 0 {
            anyhow::bail!("default_query_limit and max_query_limit must be positive");
        }
        if self.clock_skew_future_seconds < 0 {
            anyhow::bail!("clock_skew_future_seconds must be non-negative");
        }
        if self.satellite_liveness_seconds == 0 {
            anyhow::bail!("satellite_liveness_seconds must be positive");
        }
        if self.expiry_sweep_interval_seconds == 0 {
            anyhow::bail!("expiry_sweep_interval_seconds must be positive");
        }
        if let Some(seed) = &self.server_identity_seed {
            let bytes = hex::decode(seed)
                .map_err(|e| anyhow::anyhow!("server_identity_seed must be hex: {e}"))?;
            if bytes.len() != 32 {
                anyhow::bail!("server_identity_seed must decode to 32 bytes");
            }
        }
        Ok(())
    }
}

/// The relay's own signing identity, persisted alongside the event store so
/// restarts keep producing reference events under the same pubkey.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub identity_seed: [u8; 32],
}

impl NodeState {
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        Self { identity_seed: seed }
    }
}
