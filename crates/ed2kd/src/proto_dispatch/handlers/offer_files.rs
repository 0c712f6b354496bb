//! OfferFilesHandler - records offered files in the file index.

use ed2kd_proto::messages::OfferFiles;
use tracing::debug;

use super::{Handler, HandlerContext};
use crate::proto_dispatch::error::HandlerResult;

pub(crate) struct OfferFilesHandler;

impl Handler<OfferFiles> for OfferFilesHandler {
    async fn handle(&self, ctx: &mut HandlerContext<'_>, offer: OfferFiles) -> HandlerResult {
        debug!(
            conn_id = ctx.session.conn_id,
            count = offer.files.len(),
            "Files offered"
        );
        for file in &offer.files {
            ctx.services.files.add(file, ctx.session);
        }
        Ok(())
    }
}
