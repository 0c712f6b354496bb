#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ed2kd::config::{PortcheckConfig, ServerConfig};
use ed2kd::index::{MemoryFileIndex, Services};
use ed2kd::net::framing::Framer;
use ed2kd::net::rate_limit::RateLimitConfig;
use ed2kd::net::tcp::run_tcp_listener_with_listener;
use ed2kd_proto::codec::InflateLimit;
use ed2kd_proto::messages::{Hello, HelloAnswer, LoginRequest, Message, encode_message};
use ed2kd_proto::opcode::PeerOpcode;
use ed2kd_proto::packet::Packet;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const SERVER_HASH: [u8; 16] = [0x5E; 16];
pub const RECV_TIMEOUT: Duration = Duration::from_secs(3);

/// 127.0.0.1 as an ed2k high id.
pub const LOCALHOST_ID: u32 = 0x0100_007F;

pub fn test_config() -> ServerConfig {
    ServerConfig {
        listen: SocketAddr::from(([127, 0, 0, 1], 0)),
        rate_limit: RateLimitConfig::disabled(),
        sweep_interval: Duration::from_millis(50),
        portcheck: PortcheckConfig {
            server_hash: SERVER_HASH,
            server_name: "test-server".to_string(),
            timeout: Duration::from_secs(2),
            ..PortcheckConfig::default()
        },
        ..ServerConfig::default()
    }
}

pub async fn spawn_test_server(config: ServerConfig) -> (SocketAddr, Arc<MemoryFileIndex>) {
    let (event_tx, event_rx) = mpsc::channel(1024);
    let listener = TcpListener::bind(config.listen).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let max_frame_len = config.max_frame_len;
    tokio::spawn(async move {
        let _ = run_tcp_listener_with_listener(listener, event_tx, max_frame_len, None).await;
    });

    let (services, index) = Services::in_memory();
    tokio::spawn(async move {
        let _ = ed2kd::run_server(event_rx, Arc::new(config), services).await;
    });

    (addr, index)
}

/// Mock ed2k client on the primary connection.
pub struct TestClient {
    pub stream: TcpStream,
    framer: Framer,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        Ok(Self {
            stream: TcpStream::connect(addr).await?,
            framer: Framer::new(4096, 1 << 20, InflateLimit::SERVER),
        })
    }

    pub async fn send<T: Message>(&mut self, msg: &T) -> anyhow::Result<()> {
        self.stream.write_all(&encode_message(msg)).await?;
        Ok(())
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    pub async fn login(&mut self, user_hash: [u8; 16], port: u16) -> anyhow::Result<()> {
        self.send(&login_request(user_hash, port)).await
    }

    pub async fn recv_packet(&mut self) -> anyhow::Result<Packet> {
        loop {
            if let Some(packet) = self.framer.next_packet()? {
                return Ok(packet);
            }
            let mut buf = [0u8; 4096];
            let n = timeout(RECV_TIMEOUT, self.stream.read(&mut buf)).await??;
            anyhow::ensure!(n > 0, "connection closed");
            self.framer.extend(&buf[..n]);
        }
    }

    /// `true` if the server closes the connection before the timeout.
    pub async fn closed_by_server(&mut self) -> bool {
        let mut buf = [0u8; 256];
        loop {
            match timeout(RECV_TIMEOUT, self.stream.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return true,
                Ok(Ok(_)) => continue,
                Err(_) => return false,
            }
        }
    }
}

pub fn login_request(user_hash: [u8; 16], port: u16) -> LoginRequest {
    LoginRequest {
        user_hash,
        port,
        nick: "tester".to_string(),
        server_flags: 0,
        emule_version: 0,
    }
}

/// A client's listening port that answers the port-check greeting.
pub struct FakePeer {
    pub port: u16,
    /// Greeting received from the server.
    pub hello_rx: mpsc::Receiver<Hello>,
}

impl FakePeer {
    /// Answer the first greeting with `answer_hash`.
    pub async fn spawn(answer_hash: [u8; 16]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (hello_tx, hello_rx) = mpsc::channel(4);

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut framer = Framer::new(1024, 1 << 16, InflateLimit::PEER);
                let mut buf = [0u8; 1024];
                let hello = loop {
                    if let Ok(Some(packet)) = framer.next_packet() {
                        break Hello::decode(&packet.payload).ok().filter(|_| packet.opcode == PeerOpcode::Hello as u8);
                    }
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break None,
                        Ok(n) => framer.extend(&buf[..n]),
                    }
                };
                let Some(hello) = hello else {
                    continue;
                };
                let _ = hello_tx.send(hello).await;
                let _ = stream
                    .write_all(&encode_message(&HelloAnswer { hash: answer_hash }))
                    .await;
                // Keep the link open until the server hangs up.
                let _ = stream.read(&mut buf).await;
            }
        });

        Self { port, hello_rx }
    }
}

/// A port nothing listens on.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}
