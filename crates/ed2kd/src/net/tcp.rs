use std::net::SocketAddr;
use std::sync::Arc;

use ed2kd_proto::codec::InflateLimit;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{BytesCodec, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::net::rate_limit::IpRateLimiter;

use super::framing::Framer;
use super::inbound::{ConnId, InboundEvent, next_conn_id};
use super::outbound::spawn_writer;

/// Slack on top of the largest frame before a connection's receive buffer is
/// considered abusive.
const RX_BUFFER_SLACK: usize = 64 * 1024;

/// Source IPs the connection limiter keeps state for.
const MAX_TRACKED_IPS: usize = 10_000;

/// Start a TCP listener. All decoded packets and connection events are sent to `tx`.
pub async fn run_tcp_listener(
    bind: SocketAddr,
    tx: mpsc::Sender<InboundEvent>,
    max_frame_len: usize,
    ip_rate_limiter: Option<Arc<IpRateLimiter>>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    run_tcp_listener_with_listener(listener, tx, max_frame_len, ip_rate_limiter).await
}

/// Run the accept loop on an existing listener.
pub async fn run_tcp_listener_with_listener(
    listener: TcpListener,
    tx: mpsc::Sender<InboundEvent>,
    max_frame_len: usize,
    ip_rate_limiter: Option<Arc<IpRateLimiter>>,
) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;

        if let Some(ref limiter) = ip_rate_limiter
            && !limiter.check(peer.ip().to_canonical())
        {
            warn!(%peer, "Connection rejected: IP rate limit exceeded");
            drop(stream);
            continue;
        }
        if let Some(ref limiter) = ip_rate_limiter {
            limiter.cleanup_stale(MAX_TRACKED_IPS);
        }

        let conn_id = next_conn_id();
        let tx_clone = tx.clone();
        tokio::spawn(async move {
            handle_tcp_connection(stream, peer, conn_id, tx_clone, max_frame_len).await;
        });
    }
}

/// Handle a single client connection until EOF, error or cancellation.
pub async fn handle_tcp_connection(
    stream: TcpStream,
    peer: SocketAddr,
    conn_id: ConnId,
    tx: mpsc::Sender<InboundEvent>,
    max_frame_len: usize,
) {
    let _ = stream.set_nodelay(true);
    let (mut read, write) = stream.into_split();

    // Outbound queue (framed bytes).
    let (out_tx, out_rx) = mpsc::channel::<bytes::Bytes>(256);
    let writer = spawn_writer(FramedWrite::new(write, BytesCodec::new()), out_rx);

    let cancel_token = CancellationToken::new();

    tx.send(InboundEvent::Connected {
        conn_id,
        peer,
        outbound: out_tx.clone(),
        cancel_token: cancel_token.clone(),
    })
    .await
    .ok();
    debug!(conn_id, %peer, "Client connected");

    // Framer keeps bytes across reads.
    let mut framer = Framer::new(8 * 1024, max_frame_len, InflateLimit::SERVER);
    let rx_cap = max_frame_len.saturating_add(RX_BUFFER_SLACK);

    let disconnect_reason = 'conn: loop {
        if framer.buffered() > rx_cap {
            break format!("rx buffer exceeded limit ({rx_cap} bytes)");
        }

        framer.buf_mut().reserve(4096);
        let read_res = tokio::select! {
            res = read.read_buf(framer.buf_mut()) => res,
            _ = cancel_token.cancelled() => break 'conn "closed by server".to_string(),
        };

        match read_res {
            Ok(0) => break "eof".to_string(),
            Ok(_) => {}
            Err(e) => break format!("read error: {e}"),
        }

        loop {
            match framer.next_packet() {
                Ok(Some(packet)) => {
                    if tx
                        .send(InboundEvent::Packet {
                            conn_id,
                            peer,
                            packet,
                        })
                        .await
                        .is_err()
                    {
                        break 'conn "inbound channel closed".to_string();
                    }
                }
                Ok(None) => break,
                Err(e) => break 'conn format!("protocol error: {e}"),
            }
        }
    };

    let _ = tx
        .send(InboundEvent::Disconnected {
            conn_id,
            peer,
            reason: disconnect_reason,
        })
        .await;

    // Close outbound channel so writer can exit once the server drops its sender too.
    drop(out_tx);
    let _ = writer.await;
}
