#![forbid(unsafe_code)]

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context as _, anyhow, bail};
use courier_util::endpoint::TcpEndpoint;
use serde::Deserialize;
use tracing::{info, warn};

pub const DEFAULT_BIND: &str = "tcp://127.0.0.1:8081";

/// Env var naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "COURIER_CONFIG";

/// A string that never shows up in logs or debug output.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
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

impl<'de> Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

/// Default config path: `~/.courier/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".courier").join("config.toml"))
}

/// `--config` beats `COURIER_CONFIG`, which beats the default path.
pub fn resolve_config_path(cli: Option<PathBuf>) -> anyhow::Result<PathBuf> {
	if let Some(path) = cli {
		return Ok(path);
	}
	if let Ok(v) = std::env::var(CONFIG_PATH_ENV)
		&& !v.trim().is_empty()
	{
		return Ok(PathBuf::from(v.trim()));
	}
	default_config_path()
}

/// Load the config from TOML (missing file = defaults) plus `COURIER_*` env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);
	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
	cfg.validate()?;

	Ok(cfg)
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub auth: AuthSettings,
	pub queue: QueueSettings,
	pub offline_store: OfflineStoreSettings,
	pub reconciliation: ReconciliationSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Listen endpoint, `tcp://host:port`.
	pub bind: String,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	pub max_frame_bytes: usize,
	pub write_timeout: Duration,
	/// Envelopes buffered between a session's reader and dispatcher.
	pub handoff_capacity: usize,
	/// Stable name of this relay process; tags messages it accepts.
	pub instance_id: String,
	/// Command rate limiting: per-connection burst size (0 = off).
	pub command_rate_limit_per_conn_burst: u32,
	/// Command rate limiting: per-connection requests per minute (0 = off).
	pub command_rate_limit_per_conn_per_minute: u32,
}

#[derive(Debug, Clone, Default)]
pub struct AuthSettings {
	/// HMAC secret for stateless access tokens.
	pub hmac_secret: Option<SecretString>,
	/// Treat the raw credential as the identity. Development only.
	pub insecure_plaintext_identities: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueBackend {
	#[default]
	Local,
	Redis,
}

impl FromStr for QueueBackend {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"local" | "memory" => Ok(QueueBackend::Local),
			"redis" => Ok(QueueBackend::Redis),
			other => Err(anyhow!("unknown queue backend {other:?} (expected local or redis)")),
		}
	}
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
	pub backend: QueueBackend,
	pub redis_url: Option<SecretString>,
	pub topic: String,
	pub outbound_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct OfflineStoreSettings {
	/// `sqlite:`, `postgres:` or `mysql:` URL; unset keeps messages in memory.
	pub database_url: Option<SecretString>,
	pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct ReconciliationSettings {
	pub interval: Duration,
	pub idle_interval: Duration,
	pub max_per_identity: usize,
	pub max_attempts: Option<u32>,
	pub ttl: Option<Duration>,
	pub removal_retention: Duration,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self::from_file(FileConfig::default())
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	auth: FileAuthSettings,

	#[serde(default)]
	queue: FileQueueSettings,

	#[serde(default)]
	offline_store: FileOfflineStoreSettings,

	#[serde(default)]
	reconciliation: FileReconciliationSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileServerSettings {
	bind: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	max_frame_bytes: Option<usize>,
	write_timeout_ms: Option<u64>,
	handoff_capacity: Option<usize>,
	instance_id: Option<String>,
	command_rate_limit_per_conn_burst: Option<u32>,
	command_rate_limit_per_conn_per_minute: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileAuthSettings {
	hmac_secret: Option<SecretString>,
	insecure_plaintext_identities: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileQueueSettings {
	backend: Option<String>,
	redis_url: Option<SecretString>,
	topic: Option<String>,
	outbound_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileOfflineStoreSettings {
	database_url: Option<SecretString>,
	max_connections: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileReconciliationSettings {
	interval_ms: Option<u64>,
	idle_interval_ms: Option<u64>,
	max_per_identity: Option<usize>,
	max_attempts: Option<u32>,
	ttl_secs: Option<u64>,
	removal_retention_secs: Option<u64>,
}

fn non_empty(s: Option<String>) -> Option<String> {
	s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn non_empty_secret(s: Option<SecretString>) -> Option<SecretString> {
	s.filter(|s| !s.expose().trim().is_empty())
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let backend = match file.queue.backend.as_deref().map(QueueBackend::from_str) {
			Some(Ok(b)) => b,
			Some(Err(e)) => {
				warn!(error = %e, "queue config: falling back to local backend");
				QueueBackend::Local
			}
			None => QueueBackend::Local,
		};

		Self {
			server: ServerSettings {
				bind: non_empty(file.server.bind).unwrap_or_else(|| DEFAULT_BIND.to_string()),
				metrics_bind: non_empty(file.server.metrics_bind),
				health_bind: non_empty(file.server.health_bind),
				max_frame_bytes: file
					.server
					.max_frame_bytes
					.unwrap_or(courier_protocol::DEFAULT_MAX_FRAME_SIZE),
				write_timeout: Duration::from_millis(file.server.write_timeout_ms.unwrap_or(5_000)),
				handoff_capacity: file.server.handoff_capacity.unwrap_or(64),
				instance_id: non_empty(file.server.instance_id)
					.unwrap_or_else(|| format!("relay-{}", uuid::Uuid::new_v4())),
				command_rate_limit_per_conn_burst: file.server.command_rate_limit_per_conn_burst.unwrap_or(0),
				command_rate_limit_per_conn_per_minute: file.server.command_rate_limit_per_conn_per_minute.unwrap_or(0),
			},
			auth: AuthSettings {
				hmac_secret: non_empty_secret(file.auth.hmac_secret),
				insecure_plaintext_identities: file.auth.insecure_plaintext_identities.unwrap_or(false),
			},
			queue: QueueSettings {
				backend,
				redis_url: non_empty_secret(file.queue.redis_url),
				topic: non_empty(file.queue.topic).unwrap_or_else(|| "im".to_string()),
				outbound_capacity: file.queue.outbound_capacity.unwrap_or(1024),
			},
			offline_store: OfflineStoreSettings {
				database_url: non_empty_secret(file.offline_store.database_url),
				max_connections: file.offline_store.max_connections.unwrap_or(5),
			},
			reconciliation: ReconciliationSettings {
				interval: Duration::from_millis(file.reconciliation.interval_ms.unwrap_or(5_000)),
				idle_interval: Duration::from_millis(file.reconciliation.idle_interval_ms.unwrap_or(30_000)),
				max_per_identity: file.reconciliation.max_per_identity.unwrap_or(32),
				max_attempts: file.reconciliation.max_attempts.filter(|v| *v > 0),
				ttl: file.reconciliation.ttl_secs.filter(|v| *v > 0).map(Duration::from_secs),
				removal_retention: Duration::from_secs(file.reconciliation.removal_retention_secs.unwrap_or(3_600)),
			},
		}
	}

	/// Reject configurations the relay cannot start with.
	pub fn validate(&self) -> anyhow::Result<()> {
		TcpEndpoint::parse_bind(&self.server.bind).with_context(|| format!("server.bind = {:?}", self.server.bind))?;

		if self.server.max_frame_bytes == 0 || self.server.max_frame_bytes > u32::MAX as usize {
			bail!("server.max_frame_bytes must be in 1..=4294967295");
		}
		if self.server.write_timeout.is_zero() {
			bail!("server.write_timeout_ms must be positive");
		}
		if self.server.handoff_capacity == 0 {
			bail!("server.handoff_capacity must be positive");
		}
		if self.queue.outbound_capacity == 0 {
			bail!("queue.outbound_capacity must be positive");
		}
		if self.queue.backend == QueueBackend::Redis && self.queue.redis_url.is_none() {
			bail!("queue.backend = \"redis\" requires queue.redis_url");
		}
		if self.reconciliation.interval.is_zero() || self.reconciliation.idle_interval.is_zero() {
			bail!("reconciliation intervals must be positive");
		}
		if self.reconciliation.max_per_identity == 0 {
			bail!("reconciliation.max_per_identity must be positive");
		}
		if self.reconciliation.removal_retention.is_zero() {
			bail!("reconciliation.removal_retention_secs must be positive");
		}
		if self.auth.hmac_secret.is_none() && !self.auth.insecure_plaintext_identities {
			bail!("no credential verifier: set auth.hmac_secret (or auth.insecure_plaintext_identities for development)");
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

fn env_string(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
	non_empty(get(key))
}

fn env_parse<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
	let v = env_string(get, key)?;
	match v.parse::<T>() {
		Ok(parsed) => Some(parsed),
		Err(_) => {
			warn!(key, value = %v, "ignoring unparsable env override");
			None
		}
	}
}

/// Apply `COURIER_*` overrides. `get` is the environment lookup.
pub fn apply_env_overrides(cfg: &mut ServerConfig, get: impl Fn(&str) -> Option<String>) {
	if let Some(v) = env_string(&get, "COURIER_BIND") {
		info!(bind = %v, "server config: bind overridden by env");
		cfg.server.bind = v;
	}

	if let Some(v) = env_string(&get, "COURIER_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = env_string(&get, "COURIER_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(bytes) = env_parse::<usize>(&get, "COURIER_MAX_FRAME_BYTES") {
		cfg.server.max_frame_bytes = bytes;
		info!(bytes, "server config: max_frame_bytes overridden by env");
	}

	if let Some(ms) = env_parse::<u64>(&get, "COURIER_WRITE_TIMEOUT_MS") {
		cfg.server.write_timeout = Duration::from_millis(ms);
		info!(ms, "server config: write_timeout overridden by env");
	}

	if let Some(capacity) = env_parse::<usize>(&get, "COURIER_HANDOFF_CAPACITY") {
		cfg.server.handoff_capacity = capacity;
		info!(capacity, "server config: handoff_capacity overridden by env");
	}

	if let Some(v) = env_string(&get, "COURIER_INSTANCE_ID") {
		info!(instance_id = %v, "server config: instance_id overridden by env");
		cfg.server.instance_id = v;
	}

	if let Some(burst) = env_parse::<u32>(&get, "COURIER_COMMAND_RATE_LIMIT_PER_CONN_BURST") {
		cfg.server.command_rate_limit_per_conn_burst = burst;
		info!(burst, "server config: command_rate_limit_per_conn_burst overridden by env");
	}

	if let Some(rate) = env_parse::<u32>(&get, "COURIER_COMMAND_RATE_LIMIT_PER_CONN_PER_MINUTE") {
		cfg.server.command_rate_limit_per_conn_per_minute = rate;
		info!(
			rate,
			"server config: command_rate_limit_per_conn_per_minute overridden by env"
		);
	}

	if let Some(v) = env_string(&get, "COURIER_AUTH_HMAC_SECRET") {
		cfg.auth.hmac_secret = Some(SecretString::new(v));
		info!("server auth: hmac_secret overridden by env");
	}

	if let Some(v) = env_string(&get, "COURIER_AUTH_INSECURE_PLAINTEXT")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.auth.insecure_plaintext_identities = enabled;
		info!(enabled, "server auth: insecure_plaintext_identities overridden by env");
	}

	if let Some(v) = env_string(&get, "COURIER_QUEUE_BACKEND") {
		match v.parse::<QueueBackend>() {
			Ok(backend) => {
				cfg.queue.backend = backend;
				info!(?backend, "queue config: backend overridden by env");
			}
			Err(e) => warn!(error = %e, "queue config: ignoring COURIER_QUEUE_BACKEND"),
		}
	}

	if let Some(v) = env_string(&get, "COURIER_REDIS_URL") {
		cfg.queue.redis_url = Some(SecretString::new(v));
		info!("queue config: redis_url overridden by env");
	}

	if let Some(v) = env_string(&get, "COURIER_QUEUE_TOPIC") {
		info!(topic = %v, "queue config: topic overridden by env");
		cfg.queue.topic = v;
	}

	if let Some(capacity) = env_parse::<usize>(&get, "COURIER_QUEUE_OUTBOUND_CAPACITY") {
		cfg.queue.outbound_capacity = capacity;
		info!(capacity, "queue config: outbound_capacity overridden by env");
	}

	if let Some(v) = env_string(&get, "COURIER_OFFLINE_STORE_DATABASE_URL") {
		cfg.offline_store.database_url = Some(SecretString::new(v));
		info!("offline store: database_url overridden by env");
	}

	if let Some(n) = env_parse::<u32>(&get, "COURIER_OFFLINE_STORE_MAX_CONNECTIONS") {
		cfg.offline_store.max_connections = n;
		info!(max_connections = n, "offline store: max_connections overridden by env");
	}

	if let Some(ms) = env_parse::<u64>(&get, "COURIER_RECONCILE_INTERVAL_MS") {
		cfg.reconciliation.interval = Duration::from_millis(ms);
		info!(ms, "reconciliation: interval overridden by env");
	}

	if let Some(ms) = env_parse::<u64>(&get, "COURIER_RECONCILE_IDLE_INTERVAL_MS") {
		cfg.reconciliation.idle_interval = Duration::from_millis(ms);
		info!(ms, "reconciliation: idle_interval overridden by env");
	}

	if let Some(n) = env_parse::<usize>(&get, "COURIER_RECONCILE_MAX_PER_IDENTITY") {
		cfg.reconciliation.max_per_identity = n;
		info!(max_per_identity = n, "reconciliation: max_per_identity overridden by env");
	}

	if let Some(n) = env_parse::<u32>(&get, "COURIER_RECONCILE_MAX_ATTEMPTS") {
		cfg.reconciliation.max_attempts = Some(n).filter(|v| *v > 0);
		info!(max_attempts = n, "reconciliation: max_attempts overridden by env");
	}

	if let Some(secs) = env_parse::<u64>(&get, "COURIER_RECONCILE_TTL_SECS") {
		cfg.reconciliation.ttl = Some(secs).filter(|v| *v > 0).map(Duration::from_secs);
		info!(secs, "reconciliation: ttl overridden by env");
	}

	if let Some(secs) = env_parse::<u64>(&get, "COURIER_RECONCILE_REMOVAL_RETENTION_SECS") {
		cfg.reconciliation.removal_retention = Duration::from_secs(secs);
		info!(secs, "reconciliation: removal_retention overridden by env");
	}

	if cfg.auth.insecure_plaintext_identities {
		warn!("server auth: insecure_plaintext_identities is on; credentials are trusted as identities");
	}
}
