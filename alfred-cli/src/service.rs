//! Service shell: wires the store, the APIs, and signal handling.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use alfred_core::{Configuration, Store, SystemClock, roles};

use crate::api::{self, ApiState};
use crate::diag;
use crate::handlers::ws::{WsListener, WsSettings};
use crate::transactions::ClientTransactions;

/// Variables set through the command line.
#[derive(Debug, Default, Clone)]
pub struct Environment {
    /// Explicit store file path, tried before the defaults.
    pub store_file_path: Option<PathBuf>,
    /// Whether diagnostics go to the configured log file.
    pub daemon: bool,
}

/// Runs the service until a shutdown signal arrives.
///
/// # Errors
///
/// Returns an error for any setup failure: no loadable store file,
/// unreadable TLS material, an unbindable port.
pub async fn run(environment: Environment) -> Result<()> {
    let store = Arc::new(Store::new());
    let store_path = mobilize_store(&store, environment.store_file_path.as_deref())?;
    let configuration = Configuration::from_document(&store.get(&[], &roles::admin()));
    diag::init(&configuration, environment.daemon)?;
    info!(path = %store_path.display(), "store loaded");
    load_tls_material(&configuration)?;

    let transactions = Arc::new(
        ClientTransactions::new(Duration::from_secs_f64(configuration.request_timeout_seconds))
            .context("unable to construct the HTTP client")?,
    );
    let ws = WsListener::new(
        Arc::downgrade(&store),
        Arc::clone(&transactions),
        WsSettings::from_configuration(&configuration),
    );
    let app = api::create_api_routes()
        .with_state(ApiState::new(Arc::downgrade(&store)))
        .merge(ws.router());

    let port = configuration.http_port();
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("unable to bind the HTTP listener on port {port}"))?;
    info!(port, "Alfred up and running.");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("Exiting...");
    ws.demobilize();
    transactions.demobilize();
    store.demobilize();
    Ok(())
}

/// Mobilizes the store from the first loadable candidate: the explicit
/// `--store` path, `Alfred.json` next to the executable, then `Alfred.json`
/// in the working directory.
fn mobilize_store(store: &Store, override_path: Option<&Path>) -> Result<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(path) = override_path {
        candidates.push(path.to_owned());
    }
    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_owned))
    {
        candidates.push(exe_dir.join("Alfred.json"));
    }
    candidates.push(PathBuf::from("Alfred.json"));

    let clock = Arc::new(SystemClock);
    let mut failures = Vec::new();
    for candidate in candidates {
        match store.mobilize(&candidate, clock.clone()) {
            Ok(()) => return Ok(candidate),
            Err(mobilize_error) => {
                failures.push(format!("{}: {mobilize_error}", candidate.display()));
            }
        }
    }
    bail!("unable to load a store file:\n  {}", failures.join("\n  "))
}

/// Verifies the configured TLS material is present and readable. The
/// material itself is consumed by the fronting TLS terminator.
fn load_tls_material(configuration: &Configuration) -> Result<()> {
    let entries = [
        ("SSL certificate", &configuration.ssl_certificate),
        ("SSL private key", &configuration.ssl_key),
        ("CA certificates", &configuration.ca_certificates),
    ];
    for (label, path) in entries {
        if let Some(path) = path {
            std::fs::read(path).with_context(|| format!("unable to load {label} from {path}"))?;
            info!("{label} loaded from {path}");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    if signal::ctrl_c().await.is_err() {
        warn!("unable to listen for the interrupt signal");
        return;
    }
    info!("shutdown requested");
}
