use bytes::Bytes;
use ed2kd_proto::messages::{Message, encode_message};
use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc;

/// Outbound channel sender type.
/// Data must already be framed (header + opcode + payload).
pub type OutboundTx = mpsc::Sender<Bytes>;

/// Spawn a writer task that writes framed bytes to the stream.
///
/// - Exits when the channel is closed.
/// - Returns an error if a socket write fails.
pub fn spawn_writer<S>(
    mut write: S,
    mut rx: mpsc::Receiver<Bytes>,
) -> tokio::task::JoinHandle<anyhow::Result<()>>
where
    S: Sink<Bytes, Error = std::io::Error> + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            write.send(frame).await?;
        }
        Ok(())
    })
}

/// Queue a message without waiting for room in the outbound queue.
///
/// Fails if the queue is full or the connection is gone.
pub fn try_send_msg<T: Message>(tx: &OutboundTx, msg: &T) -> anyhow::Result<()> {
    tx.try_send(encode_message(msg))?;
    Ok(())
}
