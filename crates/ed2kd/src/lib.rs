//! Server library - main loop logic extracted for testing.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;

use ed2kd_proto::packet::Packet;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::index::Services;
use crate::net::inbound::{ConnId, InboundEvent};
use crate::net::outbound::OutboundTx;
use crate::net::rate_limit::ConnRateLimiter;
use crate::portcheck::PortcheckReport;
use crate::proto_dispatch::error::HandlerError;
use crate::proto_dispatch::handlers::{HandlerContext, dispatch_packet, login::announce_client_id};
use crate::session::Session;

pub mod config;
pub mod index;
pub mod net;
pub mod portcheck;
pub mod proto_dispatch;
pub mod session;

/// Low id counter, see `login::client_id_for`.
static NEXT_LOW_ID: AtomicU32 = AtomicU32::new(0);

/// Run the server main loop until the inbound channel closes.
///
/// The loop is the only owner of session state. Port-check tasks report back
/// over an internal channel, so every state change happens here.
pub async fn run_server(
    mut rx: mpsc::Receiver<InboundEvent>,
    config: Arc<ServerConfig>,
    services: Services,
) -> anyhow::Result<()> {
    let mut sessions: HashMap<ConnId, Session> = HashMap::new();
    let (portcheck_tx, mut portcheck_rx) = mpsc::channel::<PortcheckReport>(256);

    let mut sweep_timer = tokio::time::interval(config.sweep_interval);
    sweep_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("Server main loop started");

    loop {
        tokio::select! {
            ev = rx.recv() => {
                let Some(ev) = ev else {
                    break;
                };
                match ev {
                    InboundEvent::Connected {
                        conn_id,
                        peer,
                        outbound,
                        cancel_token,
                    } => {
                        handle_connected(&mut sessions, &config, conn_id, peer, outbound, cancel_token);
                    }

                    InboundEvent::Disconnected {
                        conn_id,
                        peer,
                        reason,
                    } => {
                        remove_session(&mut sessions, &services, conn_id);
                        info!(conn_id, %peer, %reason, "Client disconnected");
                    }

                    InboundEvent::Packet {
                        conn_id,
                        peer,
                        packet,
                    } => {
                        handle_packet(
                            &mut sessions,
                            &services,
                            &config,
                            &portcheck_tx,
                            conn_id,
                            peer,
                            packet,
                        )
                        .await;
                    }
                }
            }
            Some(report) = portcheck_rx.recv() => {
                handle_portcheck_report(&mut sessions, &services, report);
            }
            _ = sweep_timer.tick(), if config.login_timeout.is_some() => {
                sweep_unauthenticated(&mut sessions, &services, &config);
            }
        }
    }

    info!(sessions = sessions.len(), "Server main loop stopped");
    Ok(())
}

fn handle_connected(
    sessions: &mut HashMap<ConnId, Session>,
    config: &ServerConfig,
    conn_id: ConnId,
    peer: SocketAddr,
    outbound: OutboundTx,
    cancel_token: CancellationToken,
) {
    let rate_limiter = ConnRateLimiter::new(&config.rate_limit);
    sessions.insert(
        conn_id,
        Session::new(conn_id, peer, outbound, cancel_token, rate_limiter),
    );
    debug!(conn_id, %peer, "Session created");
}

/// Drop a session and everything hanging off it.
fn remove_session(sessions: &mut HashMap<ConnId, Session>, services: &Services, conn_id: ConnId) {
    if sessions.remove(&conn_id).is_some() {
        services.files.remove_owner(conn_id);
    }
}

async fn handle_packet(
    sessions: &mut HashMap<ConnId, Session>,
    services: &Services,
    config: &ServerConfig,
    portcheck_tx: &mpsc::Sender<PortcheckReport>,
    conn_id: ConnId,
    peer: SocketAddr,
    packet: Packet,
) {
    let Some(session) = sessions.get_mut(&conn_id) else {
        return;
    };

    let result = if session.rate_limiter.as_ref().is_some_and(|l| !l.check()) {
        Err(HandlerError::rate_limited())
    } else {
        let mut ctx = HandlerContext {
            session,
            services,
            config,
            portcheck_tx,
        };
        dispatch_packet(&mut ctx, &packet).await
    };

    if let Err(e) = result {
        warn!(
            conn_id,
            %peer,
            opcode = packet.opcode,
            kind = ?e.kind(),
            error = %e,
            "Closing connection"
        );
        remove_session(sessions, services, conn_id);
    }
}

fn handle_portcheck_report(
    sessions: &mut HashMap<ConnId, Session>,
    services: &Services,
    report: PortcheckReport,
) {
    let Some(session) = sessions.get_mut(&report.conn_id) else {
        debug!(conn_id = report.conn_id, "Port-check report for a gone session");
        return;
    };
    if !session.portcheck.finish(report.generation, report.outcome) {
        debug!(
            conn_id = report.conn_id,
            generation = report.generation,
            "Stale port-check report ignored"
        );
        return;
    }

    info!(conn_id = report.conn_id, outcome = ?report.outcome, "Port-check finished");
    if let Err(e) = announce_client_id(session, services.files.as_ref()) {
        warn!(
            conn_id = report.conn_id,
            peer = %session.peer,
            error = %e,
            "Closing connection: cannot queue IdChange"
        );
        remove_session(sessions, services, report.conn_id);
    }
}

/// Close connections that did not log in within the configured time.
fn sweep_unauthenticated(
    sessions: &mut HashMap<ConnId, Session>,
    services: &Services,
    config: &ServerConfig,
) {
    let Some(timeout) = config.login_timeout else {
        return;
    };

    let expired: Vec<ConnId> = sessions
        .values()
        .filter(|s| !s.is_logged_in() && s.connected_at.elapsed() > timeout)
        .map(|s| s.conn_id)
        .collect();

    for conn_id in expired {
        if let Some(session) = sessions.get(&conn_id) {
            info!(conn_id, peer = %session.peer, "Closing connection: login timeout");
        }
        remove_session(sessions, services, conn_id);
    }
}
