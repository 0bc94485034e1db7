//! Command-line / environment configuration for the server binary.
//!
//! Every flag has a matching `CONCIERGE_*` environment variable via
//! `clap`'s `env` feature, so the process can be configured identically by
//! a systemd unit, a container, or a developer's shell.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "concierge-server", about = "Remote-host control and orchestration service")]
pub struct ServerArgs {
    /// Address the HTTP frontend binds to.
    #[arg(long, env = "CONCIERGE_BIND_ADDR", default_value = "0.0.0.0:8443")]
    pub bind_addr: String,

    /// Address the WebSocket streaming gateway binds to.
    #[arg(long, env = "CONCIERGE_WS_BIND_ADDR", default_value = "0.0.0.0:8444")]
    pub ws_bind_addr: String,

    /// Path to the declarative hosts/commands/execution-plans document.
    #[arg(long, env = "CONCIERGE_CONFIG_PATH", default_value = "concierge.json")]
    pub config_path: PathBuf,

    /// Directory used to persist task records across restarts.
    #[arg(long, env = "CONCIERGE_TASKS_DIR")]
    pub tasks_dir: Option<PathBuf>,

    /// Maximum number of task records retained (0 = unbounded).
    #[arg(long, env = "CONCIERGE_MAX_TASKS", default_value_t = 1000)]
    pub max_tasks: usize,

    /// API key required via `X-API-Key` for non-admin endpoints.
    #[arg(long, env = "CONCIERGE_API_KEY")]
    pub api_key: String,

    /// API key required via `X-Admin-Key` for `/admin/*` endpoints.
    #[arg(long, env = "CONCIERGE_ADMIN_KEY")]
    pub admin_key: String,

    /// Secret used to sign WebSocket stream tokens.
    #[arg(long, env = "CONCIERGE_WS_SECRET")]
    pub ws_secret: String,

    /// TLS certificate chain (PEM). If unset, both listeners run in plaintext.
    #[arg(long, env = "CONCIERGE_TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key (PEM, PKCS8 or RSA).
    #[arg(long, env = "CONCIERGE_TLS_KEY")]
    pub tls_key: Option<PathBuf>,
}
