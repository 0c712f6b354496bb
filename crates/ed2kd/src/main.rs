use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{Level, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use ed2kd::config::{
    DEFAULT_BIND, DEFAULT_MAX_FRAME_LEN, PortcheckConfig, ServerConfig, optional_secs, parse_hash,
};
use ed2kd::index::Services;
use ed2kd::net::rate_limit::{IpRateLimiter, RateLimitConfig};
use ed2kd::run_server;

/// eDonkey2000 server
#[derive(Parser, Debug)]
#[command(name = "ed2kd")]
#[command(about = "ed2k server with port-check and an in-memory file index", long_about = None)]
struct Args {
    /// TCP bind address
    #[arg(short, long, default_value = DEFAULT_BIND)]
    bind: SocketAddr,

    /// Server identity hash (32 hex chars). Random when omitted.
    #[arg(long)]
    server_hash: Option<String>,

    /// Name announced to clients during the port-check
    #[arg(long, default_value = "ed2kd")]
    server_name: String,

    /// Listening port announced during the port-check
    #[arg(long, default_value_t = ed2kd_proto::constants::DEFAULT_ADVERTISED_PORT)]
    advertised_port: u16,

    /// Port-check budget in seconds (connect + handshake)
    #[arg(long, default_value_t = 10)]
    portcheck_timeout_secs: u64,

    /// Close connections that do not log in within this many seconds (0 disables)
    #[arg(long, default_value_t = 30)]
    login_timeout_secs: u64,

    /// Maximum frame size in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_LEN)]
    max_frame_len: usize,

    /// New connections per IP per second (0 disables)
    #[arg(long, default_value_t = 10)]
    conn_per_ip_per_sec: u32,

    /// Frames per connection per second (0 disables)
    #[arg(long, default_value_t = 100)]
    msg_per_conn_per_sec: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: Level,

    /// `RUST_LOG` style filter, overrides `--log-level`
    #[arg(long)]
    log_filter: Option<String>,
}

impl Args {
    fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let mut portcheck = PortcheckConfig {
            server_name: self.server_name.clone(),
            advertised_port: self.advertised_port,
            timeout: std::time::Duration::from_secs(self.portcheck_timeout_secs.max(1)),
            max_frame_len: self.max_frame_len,
            ..PortcheckConfig::default()
        };
        if let Some(hash) = &self.server_hash {
            portcheck.server_hash = parse_hash(hash)?;
        }

        Ok(ServerConfig {
            listen: self.bind,
            max_frame_len: self.max_frame_len,
            login_timeout: optional_secs(self.login_timeout_secs),
            rate_limit: RateLimitConfig {
                conn_per_ip_per_sec: self.conn_per_ip_per_sec,
                msg_per_conn_per_sec: self.msg_per_conn_per_sec,
                ..RateLimitConfig::default()
            },
            portcheck,
            ..ServerConfig::default()
        })
    }
}

fn init_tracing(args: &Args) -> anyhow::Result<()> {
    let builder = FmtSubscriber::builder()
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact();

    match &args.log_filter {
        Some(filter) => {
            let subscriber = builder.with_env_filter(EnvFilter::try_new(filter)?).finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        None => {
            let subscriber = builder.with_max_level(args.log_level).finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args)?;

    let config = Arc::new(args.server_config()?);
    let (services, _index) = Services::in_memory();

    // Network layer -> server loop events.
    let (tx, rx) = mpsc::channel(1024);

    let ip_limiter = Arc::new(IpRateLimiter::new(&config.rate_limit));
    let listener = tokio::net::TcpListener::bind(config.listen).await?;
    let max_frame_len = config.max_frame_len;
    tokio::spawn(async move {
        if let Err(e) = ed2kd::net::tcp::run_tcp_listener_with_listener(
            listener,
            tx,
            max_frame_len,
            Some(ip_limiter),
        )
        .await
        {
            tracing::error!(error = %e, "TCP listener stopped");
        }
    });

    info!(
        bind = %config.listen,
        server_hash = %hex::encode(config.portcheck.server_hash),
        advertised_port = config.portcheck.advertised_port,
        "ed2k server started"
    );

    tokio::select! {
        res = run_server(rx, config, services) => res,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    }
}
