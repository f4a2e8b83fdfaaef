#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use courier_server::config::{ServerConfig, default_config_path, load_server_config_from_path};
use courier_server::server::admin::serve_admin;
use courier_server::server::auth::Authenticator;
use courier_server::server::cluster::{ClusterBus, ClusterConfig, ClusterLink, RedisBus, spawn_replicator};
use courier_server::server::connection::{ConnectionSettings, serve_ws};
use courier_server::server::health::{HealthState, spawn_health_server};
use courier_server::server::hub::{Hub, HubConfig};
use courier_server::server::store::{InMemoryStore, MessageStore, SqlStore};
use courier_util::endpoint::validate_bind_addr;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: courier_server [--config path]\n\
\n\
Options:\n\
\t--config  Config file (default: ~/.courier/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<PathBuf> {
	let mut config_path = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" | "-c" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	config_path
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

	match validate_bind_addr(bind) {
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

async fn open_store(cfg: &ServerConfig) -> anyhow::Result<Arc<dyn MessageStore>> {
	match cfg.persistence.database_url.as_deref() {
		Some(url) => {
			let store = SqlStore::connect(url, cfg.persistence.max_connections).await?;
			info!("message store: sql");
			Ok(Arc::new(store))
		}
		None => {
			warn!("no database_url configured; messages are kept in memory only");
			Ok(Arc::new(InMemoryStore::new()))
		}
	}
}

async fn open_cluster(cfg: &ServerConfig) -> anyhow::Result<Option<ClusterLink>> {
	if !cfg.cluster.enabled {
		return Ok(None);
	}
	let Some(url) = cfg.cluster.redis_url.as_deref() else {
		return Err(anyhow::anyhow!("cluster enabled but no redis_url configured"));
	};

	let bus = RedisBus::connect(url).await?;
	bus.ping().await.context("cluster bus unreachable")?;
	info!(node = %cfg.cluster.name, channel = %cfg.cluster.channel, "cluster bus connected");

	Ok(Some(ClusterLink::new(
		Arc::new(bus),
		ClusterConfig {
			node_name: cfg.cluster.name.clone(),
			channel: cfg.cluster.channel.clone(),
			resubscribe_delay: cfg.cluster.resubscribe_delay,
		},
	)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let config_path = match parse_args() {
		Some(p) => p,
		None => default_config_path()?,
	};
	let server_cfg = load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match validate_bind_addr(bind) {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let ws_addr = validate_bind_addr(&server_cfg.server.ws_bind).map_err(|e| anyhow::anyhow!("ws_bind: {e}"))?;
	let admin_addr =
		validate_bind_addr(&server_cfg.server.admin_bind).map_err(|e| anyhow::anyhow!("admin_bind: {e}"))?;

	let store = open_store(&server_cfg).await?;
	let cluster = open_cluster(&server_cfg).await?;

	let hub = Hub::new(
		store,
		cluster,
		HubConfig {
			replay_batch_size: server_cfg.persistence.replay_batch_size,
		},
	);
	let _replicator = spawn_replicator(hub.clone());

	let auth = Arc::new(Authenticator::new(server_cfg.auth.clone()));

	let admin_listener = TcpListener::bind(admin_addr)
		.await
		.with_context(|| format!("bind admin listener on {admin_addr}"))?;
	info!(addr = %admin_addr, "admin endpoint listening");
	tokio::spawn(serve_admin(admin_listener, hub.clone(), Arc::clone(&auth)));

	let ws_listener = TcpListener::bind(ws_addr)
		.await
		.with_context(|| format!("bind websocket listener on {ws_addr}"))?;
	info!(addr = %ws_addr, node = %server_cfg.cluster.name, "courier_server: websocket endpoint ready");

	health_state.mark_ready(hub.clone());

	serve_ws(ws_listener, hub, auth, ConnectionSettings::from(server_cfg.client.clone())).await;
	Ok(())
}
