//! Service node storage server entry point.
//!
//! Startup order: options, logging, daemon client, private keys (blocking
//! with retry), TLS certificate and its pinned signature, message store,
//! shared state, background loops, HTTPS listener.

use anyhow::{anyhow, Context, Result};
use axum_server::tls_openssl::OpenSSLConfig;
use clap::Parser;
use common::tls::TlsConfig;
use common::{Network, NetworkParams};
use std::net::SocketAddr;
use std::sync::Arc;
use storage_server::daemon::DaemonClient;
use storage_server::identity::IdentityKeys;
use storage_server::logbuf::{BufferLayer, LogBuffer};
use storage_server::state::AppState;
use storage_server::store::MessageStore;
use storage_server::swarm::Swarm;
use storage_server::{auditor, config, handlers, service_node};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn init_logging(
    options: &config::Options,
    buffer: Arc<LogBuffer>,
) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let logs_dir = options.data_dir.join("logs");
    std::fs::create_dir_all(&logs_dir).context("could not create the logs directory")?;

    let file_appender = tracing_appender::rolling::daily(&logs_dir, "storage-server.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.log_level.clone()));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .with(BufferLayer::new(buffer))
        .init();
    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = config::Args::parse();
    let options = match config::Options::resolve(args) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("{e}");
            eprintln!("Usage: storage-server <address> <port> [--help for options]");
            std::process::exit(1);
        }
    };

    std::fs::create_dir_all(&options.data_dir).context("could not create the data directory")?;

    let log_buffer = Arc::new(LogBuffer::new());
    let _log_guard = init_logging(&options, Arc::clone(&log_buffer))?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting storage server");

    if options.ip == "127.0.0.1" {
        error!(
            "Tried to bind the storage server to localhost, please bind \
             to an outward facing address"
        );
        std::process::exit(1);
    }
    if options.port == options.arqmad_rpc_port {
        error!("Storage server port must be different from the daemon RPC port");
        std::process::exit(config::EXIT_INVALID_PORT);
    }

    let params = NetworkParams::new(if options.stagenet {
        warn!("Starting in stagenet mode, make sure it is intentional");
        Network::Stagenet
    } else {
        Network::Mainnet
    });

    info!(
        data_dir = %options.data_dir.display(),
        daemon_rpc = %format!("{}:{}", options.arqmad_rpc_ip, options.arqmad_rpc_port),
        listen = %format!("{}:{}", options.ip, options.port),
        log_level = %options.log_level,
        "Configuration loaded"
    );

    let daemon = DaemonClient::new(&options.arqmad_rpc_ip, options.arqmad_rpc_port);

    info!("Retrieving service node keys from the daemon");
    let (legacy_hex, ed25519_hex, x25519_hex) = daemon.get_privkeys_with_retry().await;
    let identity = Arc::new(IdentityKeys::from_hex(
        &legacy_hex,
        &ed25519_hex,
        &x25519_hex,
    )?);
    info!(pubkey = %identity.pubkey_hex(), "Service node identity loaded");

    let tls = TlsConfig::new(&options.data_dir).map_err(|e| anyhow!(e))?;
    identity.set_cert_signature(&tls.cert_pem().map_err(|e| anyhow!(e))?);

    let store = Arc::new(
        MessageStore::open(options.data_dir.join("storage.db"))
            .context("could not open the message database")?,
    );
    let our_record = identity.our_record(&options.ip, options.port)?;
    let swarm = Swarm::new(our_record);

    let state = Arc::new(AppState::with_log_buffer(
        params,
        identity,
        daemon,
        store,
        swarm,
        options.force_start,
        log_buffer,
    ));

    tokio::spawn(service_node::run_refresh_loop(Arc::clone(&state)));
    tokio::spawn(service_node::run_purge_loop(Arc::clone(&state)));
    tokio::spawn(service_node::run_ping_loop(Arc::clone(&state)));
    tokio::spawn(auditor::run_storage_test_loop(Arc::clone(&state)));
    tokio::spawn(auditor::run_blockchain_test_loop(Arc::clone(&state)));
    tokio::spawn(auditor::run_retest_loop(Arc::clone(&state)));

    let app = handlers::build_router(state);
    let tls_config = OpenSSLConfig::from_pem_file(&tls.cert_path, &tls.key_path)
        .map_err(|e| anyhow!("failed to load the TLS config: {e}"))?;

    let addr: SocketAddr = format!("{}:{}", options.ip, options.port)
        .parse()
        .context("invalid listen address")?;
    info!(addr = %addr, "Listening (HTTPS)");

    axum_server::bind_openssl(addr, tls_config)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .map_err(|e| anyhow!("HTTPS server error: {e}"))
}
