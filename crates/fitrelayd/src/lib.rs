//! fitrelayd - relay daemon for signed health/fitness events.
//!
//! Wires together the event validator and privacy classifier from
//! `fitrelay-core` with the durable store and secondary indexes, the
//! query engine, the subscription registry, the satellite registry and
//! forwarding path, the reference-event synthesizer, the expiry sweeper,
//! and the WebSocket + HTTP front door.

pub mod admin;
pub mod config;
pub mod expiry;
pub mod forward;
pub mod query;
pub mod satellite;
pub mod server;
pub mod storage;
pub mod subscriptions;
pub mod synth;
pub mod wire;

pub use config::Config;
pub use server::Server;

/// Current unix timestamp, seconds.
pub fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_secs() as i64
}
