#![forbid(unsafe_code)]

mod config;
mod server;
mod util;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use courier_util::endpoint::TcpEndpoint;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{QueueBackend, ServerConfig};
use crate::server::auth::{Authenticator, HmacAuthenticator, PlaintextAuthenticator};
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::listener::serve;
use crate::server::offline_store::{InMemoryOfflineStore, OfflineStore, SqlOfflineStore};
use crate::server::poller::{PollerSettings, ReconciliationPoller};
use crate::server::queue_bridge::{LocalQueueBridge, QueueBridge, run_queue_consumer};
use crate::server::redis_bridge::RedisQueueBridge;
use crate::server::registry::PresenceRegistry;
use crate::server::router::Router;
use crate::server::session::{RelayContext, SessionSettings};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: courier_server [--bind tcp://host:port] [--config path]\n\
\n\
Options:\n\
\t--bind    Bind endpoint (default: tcp://127.0.0.1:8081)\n\
\t         Format: tcp://host:port\n\
\t--config  Config file (default: $COURIER_CONFIG or ~/.courier/config.toml)\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	bind: Option<String>,
	config: Option<PathBuf>,
}

fn parse_args() -> Args {
	let mut args = Args {
		bind: None,
		config: None,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected tcp://host:port)");
					usage_and_exit();
				}
				args.bind = Some(v);
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.config = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,courier_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("courier_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn build_authenticator(cfg: &ServerConfig) -> anyhow::Result<Arc<dyn Authenticator>> {
	if let Some(secret) = cfg.auth.hmac_secret.clone() {
		return Ok(Arc::new(HmacAuthenticator::new(secret)));
	}
	if cfg.auth.insecure_plaintext_identities {
		warn!("using plaintext identities; do not run this in production");
		return Ok(Arc::new(PlaintextAuthenticator));
	}
	Err(anyhow::anyhow!("no credential verifier configured"))
}

async fn build_offline_store(cfg: &ServerConfig) -> anyhow::Result<Arc<dyn OfflineStore>> {
	match cfg.offline_store.database_url.as_ref() {
		Some(url) => {
			let store = SqlOfflineStore::connect(url.expose(), cfg.offline_store.max_connections).await?;
			info!(backend = store.backend_name(), "offline store ready");
			Ok(Arc::new(store))
		}
		None => {
			warn!("offline store: no database_url; pending messages are kept in memory only");
			Ok(Arc::new(InMemoryOfflineStore::new()))
		}
	}
}

async fn build_queue_bridge(
	cfg: &ServerConfig,
	store: Arc<dyn OfflineStore>,
	cancel: CancellationToken,
) -> anyhow::Result<Arc<dyn QueueBridge>> {
	match cfg.queue.backend {
		QueueBackend::Local => Ok(Arc::new(LocalQueueBridge::new(cfg.queue.outbound_capacity))),
		QueueBackend::Redis => {
			let url = cfg
				.queue
				.redis_url
				.as_ref()
				.ok_or_else(|| anyhow::anyhow!("queue.backend = redis without queue.redis_url"))?;
			let bridge =
				RedisQueueBridge::connect(url.expose(), &cfg.queue.topic, cfg.queue.outbound_capacity, store, cancel)
					.await?;
			Ok(Arc::new(bridge))
		}
	}
}

async fn shutdown_signal() {
	let ctrl_c = async {
		if let Err(e) = tokio::signal::ctrl_c().await {
			warn!(error = %e, "failed to listen for ctrl-c");
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
			Ok(mut sig) => {
				sig.recv().await;
			}
			Err(e) => {
				warn!(error = %e, "failed to listen for SIGTERM");
				std::future::pending::<()>().await;
			}
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {}
		_ = terminate => {}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = crate::config::resolve_config_path(args.config)?;
	let mut server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	if let Some(bind) = args.bind {
		server_cfg.server.bind = bind;
	}
	info!(path = %config_path.display(), instance_id = %server_cfg.server.instance_id, "loaded server config (toml + env overrides)");

	let bind = TcpEndpoint::parse_bind(&server_cfg.server.bind).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});
	let bind_addr: SocketAddr = bind.to_socket_addr_if_ip_literal().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let cancel = CancellationToken::new();
	let registry = PresenceRegistry::new();

	let health_state = HealthState::new(registry.clone());
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone(), cancel.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let auth = build_authenticator(&server_cfg)?;
	let store = build_offline_store(&server_cfg).await?;
	let bridge = build_queue_bridge(&server_cfg, Arc::clone(&store), cancel.clone()).await?;
	info!(auth = auth.name(), bridge = bridge.name(), "relay backends ready");

	let router = Arc::new(Router::new(
		registry.clone(),
		Arc::clone(&bridge),
		Arc::clone(&store),
		server_cfg.server.instance_id.clone(),
	));

	let consumer = tokio::spawn(run_queue_consumer(
		Arc::clone(&bridge),
		Arc::clone(&router),
		cancel.clone(),
	));

	let rc = &server_cfg.reconciliation;
	let poller = ReconciliationPoller::new(
		Arc::clone(&router),
		Arc::clone(&store),
		PollerSettings {
			interval: rc.interval,
			idle_interval: rc.idle_interval,
			max_per_identity: rc.max_per_identity,
			max_attempts: rc.max_attempts,
			ttl: rc.ttl,
			removal_retention: rc.removal_retention,
		},
	);
	let poller = tokio::spawn(poller.run(cancel.clone()));

	let listener = TcpListener::bind(bind_addr)
		.await
		.with_context(|| format!("bind {bind}"))?;
	info!(bind = %bind, local = ?listener.local_addr().ok(), "courier_server: listening");

	let ctx = RelayContext {
		router,
		auth,
		settings: SessionSettings {
			max_frame_bytes: server_cfg.server.max_frame_bytes,
			write_timeout: server_cfg.server.write_timeout,
			handoff_capacity: server_cfg.server.handoff_capacity,
			command_rate_limit_per_conn_burst: server_cfg.server.command_rate_limit_per_conn_burst,
			command_rate_limit_per_conn_per_minute: server_cfg.server.command_rate_limit_per_conn_per_minute,
		},
	};

	health_state.mark_ready();
	let accept = tokio::spawn(serve(listener, ctx, cancel.clone()));

	shutdown_signal().await;
	info!("shutdown requested");
	health_state.mark_not_ready();
	cancel.cancel();

	let _ = tokio::join!(accept, consumer, poller);
	info!("courier_server stopped");
	Ok(())
}
