use ed2kd_proto::messages::{ClientRequest, decode_client_request};
use ed2kd_proto::packet::Packet;
use tokio::sync::mpsc;
use tracing::trace;

use crate::config::ServerConfig;
use crate::index::Services;
use crate::portcheck::PortcheckReport;
use crate::proto_dispatch::error::HandlerResult;
use crate::session::Session;

mod get_sources;
pub(crate) mod login;
mod offer_files;

/// Everything a handler may touch while processing one request.
pub(crate) struct HandlerContext<'a> {
    pub session: &'a mut Session,
    pub services: &'a Services,
    pub config: &'a ServerConfig,
    /// Where started port-checks report back.
    pub portcheck_tx: &'a mpsc::Sender<PortcheckReport>,
}

/// A handler for one decoded request type.
pub(crate) trait Handler<M> {
    async fn handle(&self, ctx: &mut HandlerContext<'_>, msg: M) -> HandlerResult;
}

/// Decode a primary-connection packet and run its handler.
///
/// Decoding happens in full before any handler runs, so a malformed request
/// has no effect besides the returned error.
pub(crate) async fn dispatch_packet(ctx: &mut HandlerContext<'_>, packet: &Packet) -> HandlerResult {
    match decode_client_request(packet.opcode, &packet.payload)? {
        ClientRequest::Login(login) => login::LoginHandler.handle(ctx, login).await,
        ClientRequest::OfferFiles(offer) => offer_files::OfferFilesHandler.handle(ctx, offer).await,
        ClientRequest::GetSources(query) => get_sources::GetSourcesHandler.handle(ctx, query).await,
        ClientRequest::GetServerList | ClientRequest::Search => {
            trace!(
                conn_id = ctx.session.conn_id,
                opcode = packet.opcode,
                "Request accepted without action"
            );
            Ok(())
        }
    }
}
