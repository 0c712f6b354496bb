//! Port-check: connect back to a client's claimed port and verify that an
//! ed2k peer answers there.
//!
//! Three layers:
//! - [`PortcheckSlot`] is the session-owned state (`NotStarted` →
//!   `InProgress` → `Succeeded | Failed`). It is the only writer of that state.
//! - [`PortcheckLink`] is the protocol state of one secondary connection:
//!   frames in, at most one outcome out.
//! - [`spawn_portcheck`] drives a link over a real socket and reports the
//!   outcome back to the server loop.

use std::net::{IpAddr, SocketAddr};

use ed2kd_proto::codec::InflateLimit;
use ed2kd_proto::constants::HASH_LEN;
use ed2kd_proto::error::{ErrorKind, ProtoError};
use ed2kd_proto::messages::peer::server_hello;
use ed2kd_proto::messages::{PeerMessage, decode_peer_message, encode_message};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::PortcheckConfig;
use crate::net::framing::Framer;
use crate::net::inbound::ConnId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortcheckState {
    NotStarted,
    InProgress,
    Succeeded,
    Failed,
}

impl PortcheckState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PortcheckState::Succeeded | PortcheckState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    /// The check could not even be started (no usable address or port).
    NotStartable,
    ConnectFailed,
    /// The peer closed the link or it errored before a valid answer.
    Closed,
    Malformed(ErrorKind),
    HashMismatch,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortcheckOutcome {
    Succeeded,
    Failed(FailReason),
}

impl PortcheckOutcome {
    fn state(self) -> PortcheckState {
        match self {
            PortcheckOutcome::Succeeded => PortcheckState::Succeeded,
            PortcheckOutcome::Failed(_) => PortcheckState::Failed,
        }
    }
}

/// Sent by a port-check task when its link reaches an outcome.
#[derive(Debug)]
pub struct PortcheckReport {
    pub conn_id: ConnId,
    pub generation: u64,
    pub outcome: PortcheckOutcome,
}

/// Port-check state as owned by a session.
///
/// Every started check gets a new generation; reports carrying an older
/// generation are stale and ignored. Dropping the slot cancels any check in
/// flight.
#[derive(Debug)]
pub struct PortcheckSlot {
    state: PortcheckState,
    generation: u64,
    cancel: Option<CancellationToken>,
}

impl Default for PortcheckSlot {
    fn default() -> Self {
        Self {
            state: PortcheckState::NotStarted,
            generation: 0,
            cancel: None,
        }
    }
}

impl PortcheckSlot {
    pub fn state(&self) -> PortcheckState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Enter `InProgress` with a fresh generation, cancelling any previous check.
    pub fn begin(&mut self) -> (u64, CancellationToken) {
        self.cancel();
        self.generation += 1;
        self.state = PortcheckState::InProgress;

        let token = CancellationToken::new();
        self.cancel = Some(token.clone());
        (self.generation, token)
    }

    /// Apply an outcome. Returns `true` only for the transition out of
    /// `InProgress` of the current generation; everything else is a no-op.
    pub fn finish(&mut self, generation: u64, outcome: PortcheckOutcome) -> bool {
        if self.state != PortcheckState::InProgress || generation != self.generation {
            return false;
        }
        self.state = outcome.state();
        self.cancel = None;
        true
    }

    /// Mark a check that could not be initiated as failed.
    pub fn fail_to_start(&mut self) -> u64 {
        let (generation, _) = self.begin();
        self.finish(generation, PortcheckOutcome::Failed(FailReason::NotStartable));
        generation
    }

    pub fn cancel(&mut self) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
    }
}

impl Drop for PortcheckSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Protocol state of one port-check connection.
///
/// Once an outcome is reached the link is terminal: further input is
/// discarded and no further outcome is ever produced.
pub struct PortcheckLink {
    /// The user hash the client sent in its login. A `HelloAnswer` carrying
    /// any other hash fails the check.
    expected_hash: [u8; HASH_LEN],
    framer: Framer,
    outcome: Option<PortcheckOutcome>,
}

impl PortcheckLink {
    /// `expected_hash` is the client's login user hash, not the server's own.
    pub fn new(expected_hash: [u8; HASH_LEN], max_frame_len: usize) -> Self {
        Self {
            expected_hash,
            framer: Framer::new(1024, max_frame_len, InflateLimit::PEER),
            outcome: None,
        }
    }

    pub fn outcome(&self) -> Option<PortcheckOutcome> {
        self.outcome
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    /// Feed received bytes. Returns the outcome on the call that reaches it.
    pub fn on_data(&mut self, data: &[u8]) -> Option<PortcheckOutcome> {
        if self.is_finished() {
            return None;
        }
        self.framer.extend(data);

        while !self.is_finished() {
            match self.framer.next_packet() {
                Ok(Some(packet)) => {
                    match decode_peer_message(packet.opcode, &packet.payload) {
                        Ok(PeerMessage::HelloAnswer(answer)) => {
                            if answer.hash == self.expected_hash {
                                self.finish(PortcheckOutcome::Succeeded);
                            } else {
                                let err = ProtoError::HashMismatch;
                                self.finish(PortcheckOutcome::Failed(FailReason::HashMismatch));
                                trace!(error = %err, "Port-check answer rejected");
                            }
                        }
                        Ok(PeerMessage::Ignored(opcode)) => {
                            trace!(opcode, "Port-check skipping packet");
                        }
                        Err(e) => self.fail_malformed(&e),
                    }
                }
                Ok(None) => break,
                Err(e) => self.fail_malformed(&e),
            }
        }

        self.outcome
    }

    /// The connection closed or errored.
    pub fn on_closed(&mut self) -> Option<PortcheckOutcome> {
        self.finish(PortcheckOutcome::Failed(FailReason::Closed))
    }

    pub fn on_timeout(&mut self) -> Option<PortcheckOutcome> {
        self.finish(PortcheckOutcome::Failed(FailReason::TimedOut))
    }

    pub fn on_connect_failed(&mut self) -> Option<PortcheckOutcome> {
        self.finish(PortcheckOutcome::Failed(FailReason::ConnectFailed))
    }

    fn fail_malformed(&mut self, e: &ProtoError) {
        trace!(error = %e, "Port-check link malformed");
        self.finish(PortcheckOutcome::Failed(FailReason::Malformed(e.kind())));
    }

    fn finish(&mut self, outcome: PortcheckOutcome) -> Option<PortcheckOutcome> {
        if self.is_finished() {
            return None;
        }
        self.outcome = Some(outcome);
        Some(outcome)
    }
}

/// Address the check connects to, or `None` if no check is possible.
///
/// High IDs are IPv4 addresses, so only IPv4 peers with a non-zero port qualify.
pub fn portcheck_target(peer_ip: IpAddr, claimed_port: u16) -> Option<SocketAddr> {
    match peer_ip.to_canonical() {
        IpAddr::V4(ip) if claimed_port != 0 => Some(SocketAddr::from((ip, claimed_port))),
        _ => None,
    }
}

/// Local address as the little-endian id ed2k uses for IPv4 addresses.
fn local_ip_id(stream: &TcpStream) -> u32 {
    match stream.local_addr().map(|a| a.ip().to_canonical()) {
        Ok(IpAddr::V4(ip)) => u32::from_le_bytes(ip.octets()),
        _ => 0,
    }
}

/// Run a port-check to completion in a background task.
///
/// The task reports through `report_tx` unless `cancel` fires first, in which
/// case it drops the link silently.
pub fn spawn_portcheck(
    conn_id: ConnId,
    generation: u64,
    target: SocketAddr,
    expected_hash: [u8; HASH_LEN],
    config: PortcheckConfig,
    cancel: CancellationToken,
    report_tx: mpsc::Sender<PortcheckReport>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut link = PortcheckLink::new(expected_hash, config.max_frame_len);

        let res = tokio::select! {
            _ = cancel.cancelled() => None,
            res = tokio::time::timeout(config.timeout, drive(&mut link, target, &config)) => Some(res),
        };
        let Some(res) = res else {
            debug!(conn_id, %target, "Port-check cancelled");
            return;
        };
        let outcome = match res {
            Ok(outcome) => outcome,
            Err(_) => link.on_timeout(),
        };

        let Some(outcome) = outcome.or(link.outcome()) else {
            return;
        };
        debug!(conn_id, %target, ?outcome, "Port-check finished");
        let _ = report_tx
            .send(PortcheckReport {
                conn_id,
                generation,
                outcome,
            })
            .await;
    })
}

async fn drive(
    link: &mut PortcheckLink,
    target: SocketAddr,
    config: &PortcheckConfig,
) -> Option<PortcheckOutcome> {
    let mut stream = match TcpStream::connect(target).await {
        Ok(s) => s,
        Err(e) => {
            trace!(%target, error = %e, "Port-check connect failed");
            return link.on_connect_failed();
        }
    };
    let _ = stream.set_nodelay(true);

    let hello = server_hello(
        config.server_hash,
        local_ip_id(&stream),
        config.advertised_port,
        &config.server_name,
    );
    if stream.write_all(&encode_message(&hello)).await.is_err() {
        return link.on_closed();
    }

    let mut buf = vec![0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return link.on_closed(),
            Ok(n) => {
                if let Some(outcome) = link.on_data(&buf[..n]) {
                    return Some(outcome);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed2kd_proto::codec::{encode_frame, encode_packed_frame};
    use ed2kd_proto::messages::{Hello, HelloAnswer, Message};
    use ed2kd_proto::opcode::PeerOpcode;
    use std::net::Ipv4Addr;

    const HASH: [u8; 16] = [0x42; 16];

    fn link() -> PortcheckLink {
        PortcheckLink::new(HASH, 64 * 1024)
    }

    fn answer(hash: [u8; 16]) -> Vec<u8> {
        encode_message(&HelloAnswer { hash }).to_vec()
    }

    #[test]
    fn matching_answer_succeeds() {
        let mut link = link();
        assert_eq!(link.on_data(&answer(HASH)), Some(PortcheckOutcome::Succeeded));
        assert_eq!(link.outcome(), Some(PortcheckOutcome::Succeeded));
    }

    #[test]
    fn one_byte_off_hash_fails() {
        let mut wrong = HASH;
        wrong[15] ^= 1;
        let mut link = link();
        assert_eq!(
            link.on_data(&answer(wrong)),
            Some(PortcheckOutcome::Failed(FailReason::HashMismatch))
        );
        assert_eq!(link.on_data(&answer(HASH)), None);
        assert_eq!(
            link.outcome(),
            Some(PortcheckOutcome::Failed(FailReason::HashMismatch))
        );
    }

    #[test]
    fn other_opcodes_are_skipped_until_the_answer() {
        let mut stream = encode_frame(PeerOpcode::Hello as u8, &[1, 2, 3]).to_vec();
        stream.extend_from_slice(&encode_frame(0x77, &[]));
        stream.extend_from_slice(&answer(HASH));

        let mut link = link();
        assert_eq!(link.on_data(&stream), Some(PortcheckOutcome::Succeeded));
    }

    #[test]
    fn packed_answer_is_accepted() {
        let mut payload = bytes::BytesMut::new();
        HelloAnswer { hash: HASH }.encode_payload(&mut payload);
        let frame = encode_packed_frame(PeerOpcode::HelloAnswer as u8, &payload).unwrap();

        assert_eq!(link().on_data(&frame), Some(PortcheckOutcome::Succeeded));
    }

    #[test]
    fn answer_split_across_reads_succeeds_once() {
        let bytes = answer(HASH);
        let mut link = link();
        let mut outcomes = Vec::new();
        for b in &bytes {
            outcomes.extend(link.on_data(std::slice::from_ref(b)));
        }
        assert_eq!(outcomes, vec![PortcheckOutcome::Succeeded]);
    }

    #[test]
    fn garbage_fails_as_malformed() {
        let mut link = link();
        assert_eq!(
            link.on_data(&[0x00, 0, 0, 0, 0, 0]),
            Some(PortcheckOutcome::Failed(FailReason::Malformed(
                ErrorKind::Framing
            )))
        );

        let mut link2 = PortcheckLink::new(HASH, 64 * 1024);
        let short = encode_frame(PeerOpcode::HelloAnswer as u8, &[0x42; 4]);
        assert_eq!(
            link2.on_data(&short),
            Some(PortcheckOutcome::Failed(FailReason::Malformed(
                ErrorKind::Malformed
            )))
        );
    }

    #[test]
    fn terminal_link_ignores_everything() {
        let mut link = link();
        let mut stream = answer(HASH);
        stream.extend_from_slice(&[0xFF; 32]);

        assert_eq!(link.on_data(&stream), Some(PortcheckOutcome::Succeeded));
        assert_eq!(link.on_data(&[0xFF; 8]), None);
        assert_eq!(link.on_data(&answer(HASH)), None);
        assert_eq!(link.on_closed(), None);
        assert_eq!(link.on_timeout(), None);
        assert_eq!(link.outcome(), Some(PortcheckOutcome::Succeeded));
    }

    #[test]
    fn close_before_answer_fails() {
        let mut link = link();
        assert_eq!(link.on_data(&answer(HASH)[..10]), None);
        assert_eq!(
            link.on_closed(),
            Some(PortcheckOutcome::Failed(FailReason::Closed))
        );
    }

    #[test]
    fn slot_walks_the_state_machine() {
        let mut slot = PortcheckSlot::default();
        assert_eq!(slot.state(), PortcheckState::NotStarted);

        let (generation, token) = slot.begin();
        assert_eq!(slot.state(), PortcheckState::InProgress);
        assert!(slot.finish(generation, PortcheckOutcome::Succeeded));
        assert_eq!(slot.state(), PortcheckState::Succeeded);
        assert!(!token.is_cancelled());

        assert!(!slot.finish(generation, PortcheckOutcome::Failed(FailReason::Closed)));
        assert_eq!(slot.state(), PortcheckState::Succeeded);
    }

    #[test]
    fn restarting_cancels_and_outdates_the_previous_check() {
        let mut slot = PortcheckSlot::default();
        let (old_gen, old_token) = slot.begin();
        let (new_gen, new_token) = slot.begin();

        assert!(old_token.is_cancelled());
        assert!(!new_token.is_cancelled());
        assert!(!slot.finish(old_gen, PortcheckOutcome::Succeeded));
        assert_eq!(slot.state(), PortcheckState::InProgress);
        assert!(slot.finish(new_gen, PortcheckOutcome::Succeeded));
    }

    #[test]
    fn dropping_the_slot_cancels_the_check() {
        let mut slot = PortcheckSlot::default();
        let (_, token) = slot.begin();
        drop(slot);
        assert!(token.is_cancelled());
    }

    #[test]
    fn failing_to_start_is_terminal() {
        let mut slot = PortcheckSlot::default();
        slot.fail_to_start();
        assert_eq!(slot.state(), PortcheckState::Failed);
        assert!(slot.state().is_terminal());
    }

    #[test]
    fn only_ipv4_with_a_port_is_checked() {
        let v4 = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));
        assert_eq!(
            portcheck_target(v4, 4662),
            Some(SocketAddr::from(([192, 0, 2, 1], 4662)))
        );
        assert_eq!(portcheck_target(v4, 0), None);
        assert_eq!(portcheck_target("::2".parse().unwrap(), 4662), None);
        assert!(portcheck_target("::ffff:192.0.2.1".parse().unwrap(), 4662).is_some());
    }

    #[tokio::test]
    async fn unreachable_port_reports_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        drop(listener);

        let (tx, mut rx) = mpsc::channel(1);
        let config = PortcheckConfig {
            timeout: std::time::Duration::from_secs(2),
            ..PortcheckConfig::default()
        };
        spawn_portcheck(7, 1, target, HASH, config, CancellationToken::new(), tx);

        let report = rx.recv().await.unwrap();
        assert_eq!(report.conn_id, 7);
        assert_eq!(report.generation, 1);
        assert!(matches!(report.outcome, PortcheckOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        let _accepting = tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        });

        let (tx, mut rx) = mpsc::channel(1);
        let config = PortcheckConfig {
            timeout: std::time::Duration::from_millis(200),
            ..PortcheckConfig::default()
        };
        spawn_portcheck(1, 1, target, HASH, config, CancellationToken::new(), tx);

        let report = rx.recv().await.unwrap();
        assert_eq!(
            report.outcome,
            PortcheckOutcome::Failed(FailReason::TimedOut)
        );
    }

    /// A client port that answers the greeting with `pick(&greeting)`.
    async fn answering_peer(pick: fn(&Hello) -> [u8; 16]) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut framer = Framer::new(1024, 1 << 16, InflateLimit::PEER);
            let mut buf = [0u8; 1024];
            let hello = loop {
                if let Some(packet) = framer.next_packet().unwrap() {
                    break Hello::decode(&packet.payload).unwrap();
                }
                let n = sock.read(&mut buf).await.unwrap();
                assert!(n > 0);
                framer.extend(&buf[..n]);
            };
            sock.write_all(&encode_message(&HelloAnswer { hash: pick(&hello) }))
                .await
                .unwrap();
            let _ = sock.read(&mut buf).await;
        });
        target
    }

    fn check_config() -> PortcheckConfig {
        PortcheckConfig {
            server_hash: [0x5E; 16],
            timeout: std::time::Duration::from_secs(2),
            ..PortcheckConfig::default()
        }
    }

    #[tokio::test]
    async fn answer_must_carry_the_login_hash() {
        let target = answering_peer(|_| HASH).await;
        let (tx, mut rx) = mpsc::channel(1);
        spawn_portcheck(1, 1, target, HASH, check_config(), CancellationToken::new(), tx);
        assert_eq!(rx.recv().await.unwrap().outcome, PortcheckOutcome::Succeeded);

        // Echoing the greeting's server hash back is not enough.
        let target = answering_peer(|hello| hello.hash).await;
        let (tx, mut rx) = mpsc::channel(1);
        spawn_portcheck(1, 1, target, HASH, check_config(), CancellationToken::new(), tx);
        assert_eq!(
            rx.recv().await.unwrap().outcome,
            PortcheckOutcome::Failed(FailReason::HashMismatch)
        );
    }

    #[tokio::test]
    async fn cancelled_check_reports_nothing() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        let _accepting = tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        });

        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let task = spawn_portcheck(
            1,
            1,
            target,
            HASH,
            PortcheckConfig::default(),
            cancel.clone(),
            tx,
        );
        cancel.cancel();
        task.await.unwrap();
        assert!(rx.recv().await.is_none());
    }
}
