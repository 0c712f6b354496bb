//! Per-connection session state, owned exclusively by the server loop.

use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use ed2kd_proto::messages::{LoginRequest, Source};
use tokio_util::sync::CancellationToken;

use crate::net::inbound::ConnId;
use crate::net::outbound::OutboundTx;
use crate::net::rate_limit::ConnRateLimiter;
use crate::portcheck::{PortcheckSlot, PortcheckState};

/// A client connection and everything the server knows about it.
///
/// Dropping a session closes its connection and cancels its port-check.
pub struct Session {
    pub conn_id: ConnId,
    pub peer: SocketAddr,
    pub outbound: OutboundTx,
    cancel_token: CancellationToken,
    /// Last accepted login. `None` until the client logs in.
    pub login: Option<LoginRequest>,
    /// Assigned once the port-check is over. `0` means unassigned.
    pub client_id: u32,
    pub portcheck: PortcheckSlot,
    pub rate_limiter: Option<ConnRateLimiter>,
    pub connected_at: Instant,
}

impl Session {
    pub fn new(
        conn_id: ConnId,
        peer: SocketAddr,
        outbound: OutboundTx,
        cancel_token: CancellationToken,
        rate_limiter: Option<ConnRateLimiter>,
    ) -> Self {
        Self {
            conn_id,
            peer,
            outbound,
            cancel_token,
            login: None,
            client_id: 0,
            portcheck: PortcheckSlot::default(),
            rate_limiter,
            connected_at: Instant::now(),
        }
    }

    /// Address the client claims to be reachable on.
    pub fn claimed_ip(&self) -> IpAddr {
        self.peer.ip()
    }

    pub fn claimed_port(&self) -> u16 {
        self.login.as_ref().map_or(0, |l| l.port)
    }

    pub fn is_logged_in(&self) -> bool {
        self.login.is_some()
    }

    /// Replace the login record. A previous identity is forgotten, including
    /// its client id.
    pub fn apply_login(&mut self, login: LoginRequest) {
        self.login = Some(login);
        self.client_id = 0;
    }

    pub fn portcheck_state(&self) -> PortcheckState {
        self.portcheck.state()
    }

    /// Whether the client was verified as reachable on its claimed port.
    pub fn is_high_id(&self) -> bool {
        self.portcheck_state() == PortcheckState::Succeeded
    }

    /// How other clients reach this one.
    pub fn source(&self) -> Source {
        Source {
            client_id: self.client_id,
            port: self.claimed_port(),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.portcheck.cancel();
        self.cancel_token.cancel();
    }
}
