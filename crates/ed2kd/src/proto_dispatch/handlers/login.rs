//! LoginHandler - accepts a login and starts the port-check.

use std::net::IpAddr;
use std::sync::atomic::Ordering;

use ed2kd_proto::constants::LOW_ID_LIMIT;
use ed2kd_proto::messages::{IdChange, LoginRequest};
use tracing::{debug, info};

use super::{Handler, HandlerContext};
use crate::NEXT_LOW_ID;
use crate::index::FileIndex;
use crate::net::outbound::try_send_msg;
use crate::portcheck::{portcheck_target, spawn_portcheck};
use crate::proto_dispatch::error::{HandlerError, HandlerResult};
use crate::session::Session;

pub(crate) struct LoginHandler;

impl Handler<LoginRequest> for LoginHandler {
    async fn handle(&self, ctx: &mut HandlerContext<'_>, login: LoginRequest) -> HandlerResult {
        info!(
            conn_id = ctx.session.conn_id,
            peer = %ctx.session.peer,
            user_hash = %hex::encode(login.user_hash),
            nick = %login.nick,
            port = login.port,
            "Client login"
        );

        let expected_hash = login.user_hash;
        ctx.session.apply_login(login);
        ctx.services.files.update_owner(ctx.session);

        let Some(target) = portcheck_target(ctx.session.claimed_ip(), ctx.session.claimed_port())
        else {
            debug!(conn_id = ctx.session.conn_id, "Port-check not possible");
            ctx.session.portcheck.fail_to_start();
            return announce_client_id(ctx.session, ctx.services.files.as_ref())
                .map_err(|_| HandlerError::OutboundUnavailable);
        };

        let (generation, cancel) = ctx.session.portcheck.begin();
        spawn_portcheck(
            ctx.session.conn_id,
            generation,
            target,
            expected_hash,
            ctx.config.portcheck.clone(),
            cancel,
            ctx.portcheck_tx.clone(),
        );
        debug!(conn_id = ctx.session.conn_id, %target, generation, "Port-check started");
        Ok(())
    }
}

/// Next low id, cycling through `1..LOW_ID_LIMIT`.
fn next_low_id() -> u32 {
    NEXT_LOW_ID.fetch_add(1, Ordering::Relaxed) % (LOW_ID_LIMIT - 1) + 1
}

/// The id a session gets once its port-check is over.
///
/// A reachable IPv4 client is identified by its address; everyone else gets
/// a low id.
pub(crate) fn client_id_for(session: &Session) -> u32 {
    match session.claimed_ip().to_canonical() {
        IpAddr::V4(ip) if session.is_high_id() => u32::from_le_bytes(ip.octets()),
        _ => next_low_id(),
    }
}

/// Assign the session's id and tell the client.
///
/// Never waits on the client. If the `IdChange` cannot be queued right away
/// the error is returned and the caller drops the connection.
pub(crate) fn announce_client_id(session: &mut Session, files: &dyn FileIndex) -> anyhow::Result<()> {
    session.client_id = client_id_for(session);
    files.update_owner(session);

    info!(
        conn_id = session.conn_id,
        client_id = session.client_id,
        high_id = session.is_high_id(),
        "Client id assigned"
    );
    let msg = IdChange {
        client_id: session.client_id,
    };
    try_send_msg(&session.outbound, &msg)
}
