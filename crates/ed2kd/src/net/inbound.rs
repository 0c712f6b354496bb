use std::sync::atomic::{AtomicU64, Ordering};

use ed2kd_proto::packet::Packet;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;

use super::outbound::OutboundTx;

/// Unique connection identifier assigned by the server.
pub type ConnId = u64;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_conn_id() -> ConnId {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

/// Inbound events produced by the network layer.
///
/// - `Connected` is emitted once per accepted connection, with an `OutboundTx`
///   that upper layers can use to send frames back and a token that closes
///   the connection when cancelled.
/// - `Packet` is emitted for every decoded frame, in stream order.
/// - `Disconnected` is emitted when the connection handler exits.
#[derive(Debug)]
pub enum InboundEvent {
    Connected {
        conn_id: ConnId,
        peer: SocketAddr,
        outbound: OutboundTx,
        cancel_token: CancellationToken,
    },

    Packet {
        conn_id: ConnId,
        peer: SocketAddr,
        packet: Packet,
    },

    Disconnected {
        conn_id: ConnId,
        peer: SocketAddr,
        /// Best-effort human-readable reason (logging/debug).
        reason: String,
    },
}
