//! Entry point: wires the declarative config, task store, dispatcher, and
//! the two network-facing halves of the service — the axum HTTP frontend
//! and the raw WebSocket streaming gateway — together, then runs both
//! until a shutdown signal arrives.

mod args;
mod routes;
mod tls;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use concierge_core::config::ConfigStore;
use concierge_core::process::ProcessRegistry;
use concierge_core::store::PersistentOrderedMap;
use concierge_core::task::TaskDispatcher;
use concierge_core::ws::{self, ClientRegistry, TokenIssuer};

use args::ServerArgs;
use routes::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = ServerArgs::parse();

    let config = ConfigStore::load(&args.config_path).with_context(|| format!("loading config from {}", args.config_path.display()))?;

    let tasks = match &args.tasks_dir {
        Some(dir) => Arc::new(PersistentOrderedMap::open(dir, args.max_tasks).context("opening task store")?),
        None => Arc::new(PersistentOrderedMap::new(args.max_tasks)),
    };
    tracing::info!(tasks_loaded = tasks.len() as u64, "task store ready");

    let process_registry = Arc::new(ProcessRegistry::new());
    let client_registry = Arc::new(ClientRegistry::new());
    let token_issuer = Arc::new(TokenIssuer::new(args.ws_secret.clone().into_bytes()));

    let dispatcher = Arc::new(TaskDispatcher::new(config, tasks, process_registry.clone()).with_streams(client_registry.clone()));

    let recovered = dispatcher.recover_from_restart();
    if recovered > 0 {
        tracing::warn!(recovered, "recovered tasks left running by a previous process");
    }

    let app_state = Arc::new(AppState {
        dispatcher,
        token_issuer: token_issuer.clone(),
        api_key: args.api_key.clone(),
        admin_key: args.admin_key.clone(),
    });
    let router = routes::router(app_state);

    let http_addr: SocketAddr = args.bind_addr.parse().context("parsing --bind-addr")?;
    let ws_addr: SocketAddr = args.ws_bind_addr.parse().context("parsing --ws-bind-addr")?;

    let tls_config = match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => Some(tls::load_server_config(cert, key)?),
        (None, None) => None,
        _ => anyhow::bail!("--tls-cert and --tls-key must be set together"),
    };

    let http_server = spawn_http_server(router, http_addr, tls_config.clone());
    let ws_server = spawn_ws_server(ws_addr, token_issuer, client_registry, process_registry, tls_config);

    tracing::info!(%http_addr, %ws_addr, "concierge-server listening");

    tokio::select! {
        res = http_server => res.context("http frontend server failed")??,
        res = ws_server => res.context("websocket gateway server failed")??,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    Ok(())
}

fn spawn_http_server(router: axum::Router, addr: SocketAddr, tls_config: Option<Arc<rustls::ServerConfig>>) -> tokio::task::JoinHandle<Result<()>> {
    tokio::spawn(async move {
        match tls_config {
            Some(config) => {
                let rustls_config = axum_server::tls_rustls::RustlsConfig::from_config(config);
                axum_server::bind_rustls(addr, rustls_config)
                    .serve(router.into_make_service())
                    .await
                    .context("serving TLS http frontend")
            }
            None => axum_server::bind(addr).serve(router.into_make_service()).await.context("serving http frontend"),
        }
    })
}

fn spawn_ws_server(
    addr: SocketAddr,
    issuer: Arc<TokenIssuer>,
    registry: Arc<ClientRegistry>,
    process_registry: Arc<ProcessRegistry>,
    tls_config: Option<Arc<rustls::ServerConfig>>,
) -> tokio::task::JoinHandle<Result<()>> {
    tokio::spawn(async move {
        let listener = TcpListener::bind(addr).await.context("binding websocket gateway listener")?;
        let acceptor = tls_config.map(tokio_rustls::TlsAcceptor::from);

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "websocket gateway accept failed");
                    continue;
                }
            };

            let issuer = issuer.clone();
            let registry = registry.clone();
            let process_registry = process_registry.clone();
            let acceptor = acceptor.clone();

            tokio::spawn(async move {
                let now = unix_now();
                let result = match acceptor {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => ws::handle_connection(tls_stream, &issuer, &registry, &process_registry, now).await,
                        Err(e) => {
                            tracing::warn!(%peer, error = %e, "websocket gateway TLS handshake failed");
                            return;
                        }
                    },
                    None => ws::handle_connection(stream, &issuer, &registry, &process_registry, now).await,
                };
                if let Err(e) = result {
                    tracing::debug!(%peer, error = %e, "websocket gateway connection ended");
                }
            });
        }
    })
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
