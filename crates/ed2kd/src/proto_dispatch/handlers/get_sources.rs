use bytes::Bytes;

use super::{Handler, HandlerContext};
use crate::proto_dispatch::error::HandlerResult;

/// Forwards the raw query to the sources responder.
pub(crate) struct GetSourcesHandler;

impl Handler<Bytes> for GetSourcesHandler {
    async fn handle(&self, ctx: &mut HandlerContext<'_>, query: Bytes) -> HandlerResult {
        ctx.services.sources.send_found_sources(ctx.session, &query);
        Ok(())
    }
}
