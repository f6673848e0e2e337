//! Process-wide configuration (SPEC_FULL.md §1 "Configuration").
//!
//! The provider-registry document itself (primary + override JSON,
//! deep-merged, compiled into field paths) is [`crate::registry::load`]'s
//! job — this module only resolves the scalar process settings around
//! it: listen port, state-file directory, sink sizing, shutdown grace,
//! and the legacy host-rewrite map (spec.md §4.4, §9). Scalars are read
//! from environment variables with code defaults, the teacher's
//! `parse::<T>(ENV_VAR)` idiom (`config.rs`) carried over without the
//! XDS/mesh-specific plumbing that doesn't apply to a single-process
//! sidecar.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::control::DEFAULT_SHUTDOWN_GRACE;
use crate::sink::{SinkConfig, DEFAULT_QUEUE_CAPACITY, DEFAULT_WORKER_COUNT};

/// Default port for the proxy listener (spec.md §6).
pub const DEFAULT_PROXY_PORT: u16 = 8080;

/// Default cap on a single decoded SSE event (spec.md §4.3 references a
/// "configured byte budget"; this is the streaming-frame analogue of the
/// text-sample budget in §4.2).
pub const DEFAULT_MAX_SSE_EVENT_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
	pub proxy_port: u16,
	pub state_dir: PathBuf,
	pub primary_provider_config: PathBuf,
	pub override_provider_config: Option<PathBuf>,
	pub sink_queue_capacity: usize,
	pub sink_worker_count: usize,
	pub shutdown_grace: Duration,
	pub max_sse_event_bytes: usize,
	/// Legacy host → current host rewrite map for clients hard-coded
	/// against an older upstream URL (spec.md §4.4, §9 "Backward-compat
	/// host rewrite" — resolved in DESIGN.md as "always rewrite; the
	/// post-rewrite host is authoritative for provider resolution").
	pub legacy_host_rewrite: Vec<(String, String)>,
}

impl Config {
	/// Resolves the config at `primary_provider_config` (package-
	/// bundled, never `None`) under `state_dir`, then layers environment
	/// overrides for every scalar on top of the defaults above.
	pub fn from_env(state_dir: PathBuf, primary_provider_config: PathBuf) -> anyhow::Result<Config> {
		Ok(Config {
			proxy_port: parse("TOKENTAP_PROXY_PORT")?.unwrap_or(DEFAULT_PROXY_PORT),
			override_provider_config: parse::<String>("TOKENTAP_PROVIDER_OVERRIDE")?.map(PathBuf::from),
			sink_queue_capacity: parse("TOKENTAP_SINK_QUEUE_CAPACITY")?.unwrap_or(DEFAULT_QUEUE_CAPACITY),
			sink_worker_count: parse("TOKENTAP_SINK_WORKERS")?.unwrap_or(DEFAULT_WORKER_COUNT),
			shutdown_grace: parse_duration("TOKENTAP_SHUTDOWN_GRACE")?.unwrap_or(DEFAULT_SHUTDOWN_GRACE),
			max_sse_event_bytes: parse("TOKENTAP_MAX_SSE_EVENT_BYTES")?.unwrap_or(DEFAULT_MAX_SSE_EVENT_BYTES),
			legacy_host_rewrite: default_legacy_host_rewrite(),
			state_dir,
			primary_provider_config,
		})
	}

	pub fn sink_config(&self) -> SinkConfig {
		SinkConfig {
			queue_capacity: self.sink_queue_capacity,
			worker_count: self.sink_worker_count,
		}
	}
}

/// The one rewrite the source carried (spec.md §9): clients built
/// against an older localhost-routed upstream URL. Kept as data rather
/// than a hardcoded branch so an operator can extend it without a code
/// change, and so `flow.rs` can apply it uniformly regardless of entry
/// count.
fn default_legacy_host_rewrite() -> Vec<(String, String)> {
	vec![("localhost.localdomain".to_string(), "api.anthropic.com".to_string())]
}

fn parse<T: FromStr>(env_var: &str) -> anyhow::Result<Option<T>>
where
	<T as FromStr>::Err: std::fmt::Display,
{
	match env::var(env_var) {
		Ok(val) => val
			.parse()
			.map(Some)
			.map_err(|e| anyhow::anyhow!("invalid env var {env_var}={val}: {e}")),
		Err(_) => Ok(None),
	}
}

fn parse_duration(env_var: &str) -> anyhow::Result<Option<Duration>> {
	match env::var(env_var) {
		Ok(val) => duration_str::parse(&val).map(Some).map_err(|e| anyhow::anyhow!("invalid env var {env_var}={val}: {e}")),
		Err(_) => Ok(None),
	}
}
