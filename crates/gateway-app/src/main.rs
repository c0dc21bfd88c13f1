//! The gateway binary: wires C1–C9 together behind an axum server (§5.3 of
//! SPEC_FULL.md). CLI parsing, registry-file persistence, and process
//! lifecycle live here rather than in the `mcp-gateway` library, since
//! spec.md §1 scopes all three out as external collaborators.

mod registry_file;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use mcp_gateway::api::{self, ApiState};
use mcp_gateway::capture::Recorder;
use mcp_gateway::client;
use mcp_gateway::health::{self, HealthChecker};
use mcp_gateway::oauth::{self, OAuthState};
use mcp_gateway::proxy::{self, AppState};
use mcp_gateway::registry::Registry;
use mcp_gateway::session::SessionStore;
use mcp_gateway::store::SqliteStore;
use registry_file::RegistryFile;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// How long in-flight handlers get to finish on their own after a shutdown
/// signal before the process forces itself closed (§5 "Cancellation": "a
/// global shutdown signal cancels all in-flight handlers with a bounded
/// grace period and then forces close").
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "gateway-app", about = "MCP observability gateway")]
struct Args {
	/// Address the HTTP server listens on.
	#[arg(long, default_value = "0.0.0.0:8080")]
	listen: SocketAddr,

	/// Path to the SQLite capture database.
	#[arg(long, default_value = "gateway.db")]
	db_path: PathBuf,

	/// Path to the JSON-backed registry file.
	#[arg(long, default_value = "registry.json")]
	registry_path: PathBuf,

	/// Health-check tick interval in milliseconds.
	#[arg(long, default_value_t = 5000)]
	health_interval_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	gateway_core::logging::init();
	let args = Args::parse();

	let registry_file = RegistryFile::new(args.registry_path.clone());
	let servers = registry_file.load()?;
	info!(count = servers.len(), path = %args.registry_path.display(), "loaded registry");
	let registry = Arc::new(Registry::load(servers));

	let store = Arc::new(SqliteStore::open(&args.db_path).await?);
	let sessions = Arc::new(SessionStore::new());
	let recorder = Arc::new(Recorder::new(store.clone()));
	let http = client::build_http_client();

	let observer_registry = registry.clone();
	let observer_file = RegistryFile::new(args.registry_path.clone());
	let health_checker = Arc::new(
		HealthChecker::new(registry.clone(), http.clone(), Duration::from_millis(args.health_interval_ms))
			.with_observer(Arc::new(move |updates| {
				for update in &updates {
					info!(server = %update.name, health = %update.health, "health check");
				}
				if let Err(e) = observer_file.save(&observer_registry.list()) {
					tracing::warn!(error = %e, "failed to persist registry after health tick");
				}
			})),
	);
	let shutdown = health::spawn(health_checker);

	let app = axum::Router::new()
		.merge(proxy::router(AppState {
			registry: registry.clone(),
			sessions: sessions.clone(),
			recorder,
			store: store.clone(),
			http: http.clone(),
		}))
		.merge(oauth::router(OAuthState { registry: registry.clone(), http }))
		.merge(api::router(ApiState { store, sessions, registry }))
		.layer(TraceLayer::new_for_http());

	let listener = tokio::net::TcpListener::bind(args.listen).await?;
	info!(addr = %args.listen, "gateway listening");
	axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
		.with_graceful_shutdown(shutdown_signal())
		.await?;

	shutdown.cancel();
	Ok(())
}

/// Waits for SIGINT (ctrl-c), then arms a grace-period timer before
/// returning so `axum::serve`'s graceful shutdown starts draining in-flight
/// handlers immediately. If the drain hasn't finished by the time the timer
/// fires — `axum::serve(...).await` above hasn't returned, so the process
/// is still alive to run it — the timer forces the process closed rather
/// than waiting indefinitely (§5 "Cancellation", §6 of SPEC_FULL.md
/// "Graceful shutdown").
async fn shutdown_signal() {
	tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
	info!("shutdown signal received, draining in-flight requests");
	tokio::spawn(async {
		tokio::time::sleep(SHUTDOWN_GRACE_PERIOD).await;
		warn!("shutdown grace period elapsed with handlers still in flight, forcing close");
		std::process::exit(0);
	});
}
