//! Runtime configuration, built once at startup and shared read-only.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use ed2kd_proto::constants::{DEFAULT_ADVERTISED_PORT, HASH_LEN};

use crate::net::rate_limit::RateLimitConfig;

/// Default listening address of an ed2k server.
pub const DEFAULT_BIND: &str = "0.0.0.0:4661";

/// Default cap on a single frame (header + opcode + payload).
pub const DEFAULT_MAX_FRAME_LEN: usize = 256 * 1024;

/// What the port-check needs to know about this server.
#[derive(Debug, Clone)]
pub struct PortcheckConfig {
    /// Identity hash sent in the greeting.
    pub server_hash: [u8; HASH_LEN],
    /// Name tag sent in the greeting.
    pub server_name: String,
    /// Listening port announced in the greeting.
    pub advertised_port: u16,
    /// Budget for connect plus handshake.
    pub timeout: Duration,
    pub max_frame_len: usize,
}

impl Default for PortcheckConfig {
    fn default() -> Self {
        Self {
            server_hash: rand::random(),
            server_name: "ed2kd".to_string(),
            advertised_port: DEFAULT_ADVERTISED_PORT,
            timeout: Duration::from_secs(10),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub max_frame_len: usize,
    /// Close connections that have not logged in after this long.
    pub login_timeout: Option<Duration>,
    /// How often idle connections are swept.
    pub sweep_interval: Duration,
    pub rate_limit: RateLimitConfig,
    pub portcheck: PortcheckConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 4661)),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            login_timeout: Some(Duration::from_secs(30)),
            sweep_interval: Duration::from_secs(1),
            rate_limit: RateLimitConfig::default(),
            portcheck: PortcheckConfig::default(),
        }
    }
}

/// Parse a 32 character hex string into a hash.
pub fn parse_hash(s: &str) -> anyhow::Result<[u8; HASH_LEN]> {
    let bytes = hex::decode(s.trim()).context("server hash is not valid hex")?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| anyhow::anyhow!("server hash must be {HASH_LEN} bytes, got {}", b.len()))
}

/// `0` seconds disables a timeout.
pub fn optional_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
