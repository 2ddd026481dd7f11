#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::hub::HubConfig;
use crate::server::session::SessionSettings;

/// Default config path: `~/.banter/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".banter").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = default_config_path()?;
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);
	validate(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub limits: LimitSettings,
	pub persistence: PersistenceSettings,
}

/// Process-level settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// Create unknown rooms on first join with the presented code.
	pub allow_open_rooms: bool,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			metrics_bind: None,
			health_bind: None,
			allow_open_rooms: true,
		}
	}
}

/// Fan-out core sizing and deadlines.
#[derive(Debug, Clone)]
pub struct LimitSettings {
	/// Per-client outbound queue capacity.
	pub client_outbound_capacity: usize,
	/// Hub broadcast channel capacity.
	pub broadcast_capacity: usize,
	/// Per-room history ring capacity.
	pub room_history_capacity: usize,
	/// Messages replayed at join.
	pub history_replay_limit: usize,
	/// Per-client history load timeout.
	pub history_load_timeout: Duration,
	/// Per-connection read idle deadline.
	pub read_idle_deadline: Duration,
	/// Per-frame write deadline.
	pub write_deadline: Duration,
	/// Server keep-alive ping interval.
	pub ping_interval: Duration,
	/// Maximum inbound frame size in bytes.
	pub max_frame_bytes: usize,
	/// Consecutive drops before a slow client is disconnected.
	pub slow_client_drop_threshold: u32,
}

impl Default for LimitSettings {
	fn default() -> Self {
		Self {
			client_outbound_capacity: 64,
			broadcast_capacity: 256,
			room_history_capacity: 1000,
			history_replay_limit: 50,
			history_load_timeout: Duration::from_secs(5),
			read_idle_deadline: Duration::from_secs(60),
			write_deadline: Duration::from_secs(10),
			ping_interval: Duration::from_secs(30),
			max_frame_bytes: 32 * 1024,
			slow_client_drop_threshold: 32,
		}
	}
}

impl LimitSettings {
	pub fn session_settings(&self) -> SessionSettings {
		SessionSettings {
			outbound_capacity: self.client_outbound_capacity,
			max_frame_bytes: self.max_frame_bytes,
			read_idle_deadline: self.read_idle_deadline,
			write_deadline: self.write_deadline,
			ping_interval: self.ping_interval,
		}
	}

	pub fn hub_config(&self) -> HubConfig {
		HubConfig {
			broadcast_capacity: self.broadcast_capacity,
			history_replay_limit: self.history_replay_limit,
			history_load_timeout: self.history_load_timeout,
			slow_client_drop_threshold: self.slow_client_drop_threshold,
			..HubConfig::default()
		}
	}
}

/// Message persistence settings.
#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Enable the durable message store.
	pub enabled: bool,
	/// Database URL (sqlite:).
	pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	limits: FileLimitSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	allow_open_rooms: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileLimitSettings {
	client_outbound_capacity: Option<usize>,
	broadcast_capacity: Option<usize>,
	room_history_capacity: Option<usize>,
	history_replay_limit: Option<usize>,
	history_load_timeout_secs: Option<u64>,
	read_idle_deadline_secs: Option<u64>,
	write_deadline_secs: Option<u64>,
	ping_interval_secs: Option<u64>,
	max_frame_bytes: Option<usize>,
	slow_client_drop_threshold: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = LimitSettings::default();

		Self {
			server: ServerSettings {
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				allow_open_rooms: file.server.allow_open_rooms.unwrap_or(true),
			},
			limits: LimitSettings {
				client_outbound_capacity: file
					.limits
					.client_outbound_capacity
					.unwrap_or(defaults.client_outbound_capacity),
				broadcast_capacity: file.limits.broadcast_capacity.unwrap_or(defaults.broadcast_capacity),
				room_history_capacity: file.limits.room_history_capacity.unwrap_or(defaults.room_history_capacity),
				history_replay_limit: file.limits.history_replay_limit.unwrap_or(defaults.history_replay_limit),
				history_load_timeout: file
					.limits
					.history_load_timeout_secs
					.map(Duration::from_secs)
					.unwrap_or(defaults.history_load_timeout),
				read_idle_deadline: file
					.limits
					.read_idle_deadline_secs
					.map(Duration::from_secs)
					.unwrap_or(defaults.read_idle_deadline),
				write_deadline: file
					.limits
					.write_deadline_secs
					.map(Duration::from_secs)
					.unwrap_or(defaults.write_deadline),
				ping_interval: file
					.limits
					.ping_interval_secs
					.map(Duration::from_secs)
					.unwrap_or(defaults.ping_interval),
				max_frame_bytes: file.limits.max_frame_bytes.unwrap_or(defaults.max_frame_bytes),
				slow_client_drop_threshold: file
					.limits
					.slow_client_drop_threshold
					.unwrap_or(defaults.slow_client_drop_threshold),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
			},
		}
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

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("BANTER_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("BANTER_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.health_bind = Some(v);
			info!("server config: health_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("BANTER_ALLOW_OPEN_ROOMS")
		&& let Some(allow) = parse_env_bool(&v)
	{
		cfg.server.allow_open_rooms = allow;
		info!(allow, "server config: allow_open_rooms overridden by env");
	}

	if let Ok(v) = std::env::var("BANTER_CLIENT_OUTBOUND_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
	{
		cfg.limits.client_outbound_capacity = capacity;
		info!(capacity, "limits: client_outbound_capacity overridden by env");
	}

	if let Ok(v) = std::env::var("BANTER_BROADCAST_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
	{
		cfg.limits.broadcast_capacity = capacity;
		info!(capacity, "limits: broadcast_capacity overridden by env");
	}

	if let Ok(v) = std::env::var("BANTER_ROOM_HISTORY_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
	{
		cfg.limits.room_history_capacity = capacity;
		info!(capacity, "limits: room_history_capacity overridden by env");
	}

	if let Ok(v) = std::env::var("BANTER_HISTORY_REPLAY_LIMIT")
		&& let Ok(limit) = v.trim().parse::<usize>()
	{
		cfg.limits.history_replay_limit = limit;
		info!(limit, "limits: history_replay_limit overridden by env");
	}

	if let Ok(v) = std::env::var("BANTER_HISTORY_LOAD_TIMEOUT_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.limits.history_load_timeout = Duration::from_secs(secs);
		info!(secs, "limits: history_load_timeout overridden by env");
	}

	if let Ok(v) = std::env::var("BANTER_READ_IDLE_DEADLINE_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.limits.read_idle_deadline = Duration::from_secs(secs);
		info!(secs, "limits: read_idle_deadline overridden by env");
	}

	if let Ok(v) = std::env::var("BANTER_WRITE_DEADLINE_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.limits.write_deadline = Duration::from_secs(secs);
		info!(secs, "limits: write_deadline overridden by env");
	}

	if let Ok(v) = std::env::var("BANTER_PING_INTERVAL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.limits.ping_interval = Duration::from_secs(secs);
		info!(secs, "limits: ping_interval overridden by env");
	}

	if let Ok(v) = std::env::var("BANTER_MAX_FRAME_BYTES")
		&& let Ok(bytes) = v.trim().parse::<usize>()
	{
		cfg.limits.max_frame_bytes = bytes;
		info!(bytes, "limits: max_frame_bytes overridden by env");
	}

	if let Ok(v) = std::env::var("BANTER_SLOW_CLIENT_DROP_THRESHOLD")
		&& let Ok(threshold) = v.trim().parse::<u32>()
	{
		cfg.limits.slow_client_drop_threshold = threshold;
		info!(threshold, "limits: slow_client_drop_threshold overridden by env");
	}

	if let Ok(v) = std::env::var("BANTER_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Ok(v) = std::env::var("BANTER_PERSISTENCE_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = Some(v);
			info!("persistence: database_url overridden by env");
		}
	}
}

fn validate(cfg: &mut ServerConfig) {
	// The server must ping faster than peers give up on an idle read.
	if cfg.limits.ping_interval >= cfg.limits.read_idle_deadline {
		let clamped = (cfg.limits.read_idle_deadline / 2).max(Duration::from_secs(1));
		warn!(
			ping_secs = cfg.limits.ping_interval.as_secs(),
			read_idle_secs = cfg.limits.read_idle_deadline.as_secs(),
			clamped_secs = clamped.as_secs(),
			"limits: ping_interval >= read_idle_deadline; clamping"
		);
		cfg.limits.ping_interval = clamped;
	}
}
