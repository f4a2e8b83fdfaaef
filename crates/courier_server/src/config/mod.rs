#![forbid(unsafe_code)]

use core::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use courier_protocol::DigestAlgorithm;
use serde::Deserialize;
use tracing::{info, warn};

use crate::util::time::default_node_name;

/// Default config path: `~/.courier/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".courier").join("config.toml"))
}

/// Load the node config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);
	cfg.finish();
	cfg.validate()?;

	Ok(cfg)
}

/// Wrapper that redacts in logs.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

/// Node config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub auth: AuthSettings,
	pub client: ClientSettings,
	pub persistence: PersistenceSettings,
	pub cluster: ClusterSettings,
}

/// Listener addresses.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// WebSocket listener for client connections (host:port).
	pub ws_bind: String,
	/// Admin ingestion HTTP listener (host:port).
	pub admin_bind: String,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			ws_bind: "127.0.0.1:8080".to_string(),
			admin_bind: "127.0.0.1:8081".to_string(),
			metrics_bind: None,
			health_bind: None,
		}
	}
}

/// Keys for login tokens and admin signatures.
#[derive(Debug, Clone, Default)]
pub struct AuthSettings {
	pub secret: SecretString,
	pub admin_secret: SecretString,
	pub digest: DigestAlgorithm,
	/// Reject login timestamps older (or newer) than this. `None` disables the check.
	pub token_max_age: Option<Duration>,
}

/// Per-connection limits and keepalive timers.
#[derive(Debug, Clone)]
pub struct ClientSettings {
	pub read_message_size_limit: usize,
	/// Socket read chunk size in bytes.
	pub read_buffer_size: usize,
	/// Bytes buffered before a write is flushed to the socket.
	pub write_buffer_size: usize,
	pub queue_capacity: usize,
	pub enqueue_timeout: Duration,
	pub ping_period: Duration,
	pub pong_wait: Duration,
	pub write_wait: Duration,
}

impl Default for ClientSettings {
	fn default() -> Self {
		Self {
			read_message_size_limit: 4096,
			read_buffer_size: 4096,
			write_buffer_size: 4096,
			queue_capacity: 5,
			enqueue_timeout: Duration::from_millis(5000),
			ping_period: Duration::from_secs(54),
			pong_wait: Duration::from_secs(60),
			write_wait: Duration::from_secs(10),
		}
	}
}

/// Storage settings.
#[derive(Debug, Clone)]
pub struct PersistenceSettings {
	/// Database URL (sqlite: or postgres:). `None` keeps everything in memory.
	pub database_url: Option<String>,
	/// Messages per offline replay frame.
	pub replay_batch_size: usize,
	pub max_connections: u32,
}

impl Default for PersistenceSettings {
	fn default() -> Self {
		Self {
			database_url: None,
			replay_batch_size: 5,
			max_connections: 10,
		}
	}
}

/// Replication bus settings.
#[derive(Debug, Clone)]
pub struct ClusterSettings {
	pub enabled: bool,
	pub redis_url: Option<String>,
	/// Node identity on the bus.
	pub name: String,
	/// Bus channel; defaults to `name`.
	pub channel: String,
	pub resubscribe_delay: Duration,
}

impl Default for ClusterSettings {
	fn default() -> Self {
		Self {
			enabled: false,
			redis_url: None,
			name: String::new(),
			channel: String::new(),
			resubscribe_delay: Duration::from_millis(1000),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	auth: FileAuthSettings,

	#[serde(default)]
	client: FileClientSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	cluster: FileClusterSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	ws_bind: Option<String>,
	admin_bind: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAuthSettings {
	secret: Option<String>,
	admin_secret: Option<String>,
	digest: Option<DigestAlgorithm>,
	token_max_age_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileClientSettings {
	read_message_size_limit: Option<usize>,
	read_buffer_size: Option<usize>,
	write_buffer_size: Option<usize>,
	queue_capacity: Option<usize>,
	enqueue_timeout_ms: Option<u64>,
	ping_period_secs: Option<u64>,
	pong_wait_secs: Option<u64>,
	write_wait_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
	replay_batch_size: Option<usize>,
	max_connections: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileClusterSettings {
	enabled: Option<bool>,
	redis_url: Option<String>,
	name: Option<String>,
	channel: Option<String>,
	resubscribe_delay_ms: Option<u64>,
}

fn non_blank(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let server_defaults = ServerSettings::default();
		let client_defaults = ClientSettings::default();
		let persistence_defaults = PersistenceSettings::default();
		let cluster_defaults = ClusterSettings::default();

		Self {
			server: ServerSettings {
				ws_bind: non_blank(file.server.ws_bind).unwrap_or(server_defaults.ws_bind),
				admin_bind: non_blank(file.server.admin_bind).unwrap_or(server_defaults.admin_bind),
				metrics_bind: non_blank(file.server.metrics_bind),
				health_bind: non_blank(file.server.health_bind),
			},
			auth: AuthSettings {
				secret: SecretString::new(file.auth.secret.unwrap_or_default()),
				admin_secret: SecretString::new(file.auth.admin_secret.unwrap_or_default()),
				digest: file.auth.digest.unwrap_or_default(),
				token_max_age: file
					.auth
					.token_max_age_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs),
			},
			client: ClientSettings {
				read_message_size_limit: file
					.client
					.read_message_size_limit
					.unwrap_or(client_defaults.read_message_size_limit),
				read_buffer_size: file.client.read_buffer_size.unwrap_or(client_defaults.read_buffer_size),
				write_buffer_size: file
					.client
					.write_buffer_size
					.unwrap_or(client_defaults.write_buffer_size),
				queue_capacity: file.client.queue_capacity.unwrap_or(client_defaults.queue_capacity),
				enqueue_timeout: file
					.client
					.enqueue_timeout_ms
					.map(Duration::from_millis)
					.unwrap_or(client_defaults.enqueue_timeout),
				ping_period: file
					.client
					.ping_period_secs
					.map(Duration::from_secs)
					.unwrap_or(client_defaults.ping_period),
				pong_wait: file
					.client
					.pong_wait_secs
					.map(Duration::from_secs)
					.unwrap_or(client_defaults.pong_wait),
				write_wait: file
					.client
					.write_wait_secs
					.map(Duration::from_secs)
					.unwrap_or(client_defaults.write_wait),
			},
			persistence: PersistenceSettings {
				database_url: non_blank(file.persistence.database_url),
				replay_batch_size: file
					.persistence
					.replay_batch_size
					.unwrap_or(persistence_defaults.replay_batch_size),
				max_connections: file
					.persistence
					.max_connections
					.unwrap_or(persistence_defaults.max_connections),
			},
			cluster: ClusterSettings {
				enabled: file.cluster.enabled.unwrap_or(false),
				redis_url: non_blank(file.cluster.redis_url),
				name: non_blank(file.cluster.name).unwrap_or_default(),
				channel: non_blank(file.cluster.channel).unwrap_or_default(),
				resubscribe_delay: file
					.cluster
					.resubscribe_delay_ms
					.map(Duration::from_millis)
					.unwrap_or(cluster_defaults.resubscribe_delay),
			},
		}
	}

	/// Fill derived defaults and clamp values that would wedge a connection.
	fn finish(&mut self) {
		if self.cluster.name.is_empty() {
			self.cluster.name = default_node_name();
		}
		if self.cluster.channel.is_empty() {
			self.cluster.channel = self.cluster.name.clone();
		}

		if self.client.queue_capacity == 0 {
			warn!("client config: queue_capacity must be > 0; using 1");
			self.client.queue_capacity = 1;
		}
		if self.client.read_buffer_size == 0 {
			warn!("client config: read_buffer_size must be > 0; using 4096");
			self.client.read_buffer_size = 4096;
		}
		if self.persistence.replay_batch_size == 0 {
			warn!("persistence: replay_batch_size must be > 0; using 5");
			self.persistence.replay_batch_size = 5;
		}
		if self.client.ping_period >= self.client.pong_wait {
			let ping = self.client.pong_wait.mul_f64(0.9);
			warn!(
				ping_ms = self.client.ping_period.as_millis(),
				pong_ms = self.client.pong_wait.as_millis(),
				"client config: ping_period must be shorter than pong_wait; using 90% of pong_wait"
			);
			self.client.ping_period = ping;
		}

		if self.auth.secret.is_empty() {
			warn!("auth: no client secret configured; every login will be rejected");
		}
		if self.auth.admin_secret.is_empty() {
			warn!("auth: no admin secret configured; every admin request will be rejected");
		}
	}

	/// Reject combinations the node cannot serve correctly.
	fn validate(&self) -> anyhow::Result<()> {
		// Replicated messages are delivered without their body; it must be
		// readable from a database shared with the origin node.
		if self.cluster.enabled && self.persistence.database_url.is_none() {
			return Err(anyhow!(
				"cluster.enabled requires persistence.database_url shared by every node"
			));
		}
		Ok(())
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn env_string(key: &str) -> Option<String> {
	std::env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Some(v) = env_string("COURIER_WS_BIND") {
		cfg.server.ws_bind = v;
		info!("server config: ws_bind overridden by env");
	}

	if let Some(v) = env_string("COURIER_ADMIN_BIND") {
		cfg.server.admin_bind = v;
		info!("server config: admin_bind overridden by env");
	}

	if let Some(v) = env_string("COURIER_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = env_string("COURIER_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = env_string("COURIER_AUTH_SECRET") {
		cfg.auth.secret = SecretString::new(v);
		info!("auth: secret overridden by env");
	}

	if let Some(v) = env_string("COURIER_AUTH_ADMIN_SECRET") {
		cfg.auth.admin_secret = SecretString::new(v);
		info!("auth: admin_secret overridden by env");
	}

	if let Some(v) = env_string("COURIER_AUTH_DIGEST") {
		match v.parse::<DigestAlgorithm>() {
			Ok(digest) => {
				cfg.auth.digest = digest;
				info!(%digest, "auth: digest overridden by env");
			}
			Err(e) => warn!(error = %e, "auth: ignoring invalid COURIER_AUTH_DIGEST"),
		}
	}

	if let Some(v) = env_string("COURIER_AUTH_TOKEN_MAX_AGE_SECS")
		&& let Ok(secs) = v.parse::<u64>()
	{
		cfg.auth.token_max_age = (secs > 0).then(|| Duration::from_secs(secs));
		info!(secs, "auth: token_max_age overridden by env");
	}

	if let Some(v) = env_string("COURIER_CLIENT_READ_MESSAGE_SIZE_LIMIT")
		&& let Ok(limit) = v.parse::<usize>()
	{
		cfg.client.read_message_size_limit = limit;
		info!(limit, "client config: read_message_size_limit overridden by env");
	}

	if let Some(v) = env_string("COURIER_CLIENT_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.parse::<usize>()
	{
		cfg.client.queue_capacity = capacity;
		info!(capacity, "client config: queue_capacity overridden by env");
	}

	if let Some(v) = env_string("COURIER_CLIENT_ENQUEUE_TIMEOUT_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.client.enqueue_timeout = Duration::from_millis(ms);
		info!(ms, "client config: enqueue_timeout overridden by env");
	}

	if let Some(v) = env_string("COURIER_PERSISTENCE_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if let Some(v) = env_string("COURIER_PERSISTENCE_REPLAY_BATCH_SIZE")
		&& let Ok(size) = v.parse::<usize>()
	{
		cfg.persistence.replay_batch_size = size;
		info!(size, "persistence: replay_batch_size overridden by env");
	}

	if let Some(v) = env_string("COURIER_CLUSTER_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.cluster.enabled = enabled;
		info!(enabled, "cluster: enabled overridden by env");
	}

	if let Some(v) = env_string("COURIER_CLUSTER_REDIS_URL") {
		cfg.cluster.redis_url = Some(v);
		info!("cluster: redis_url overridden by env");
	}

	if let Some(v) = env_string("COURIER_CLUSTER_NAME") {
		cfg.cluster.name = v;
		info!("cluster: name overridden by env");
	}

	if let Some(v) = env_string("COURIER_CLUSTER_CHANNEL") {
		cfg.cluster.channel = v;
		info!("cluster: channel overridden by env");
	}
}
