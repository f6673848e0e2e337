//! Lifecycle wiring (SPEC_FULL.md §0: "exposes the lifecycle API `start`,
//! `reload`, `shutdown`, and the addon hook trait the external MITM
//! engine drives").
//!
//! Grounded on the teacher's `app::run`/`Bound::wait_termination` shape
//! (construct the long-lived pieces once, hand back a handle that knows
//! how to reload and drain) with the XDS/gateway/tracing-exporter
//! machinery that doesn't apply to a single-process sidecar stripped out.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::diagnostics::Diagnostics;
use crate::flow::FlowController;
use crate::registry::{self, SharedRegistry};
use crate::security::SecurityGate;
use crate::sink::{self, SinkHandle};
use crate::store::EventStore;

/// Everything a flow hook needs, constructed once at startup and handed
/// to the external MITM engine as the addon state (spec.md §1: "the
/// engine supplies hooks... tokentap implements the addon").
pub struct App {
	pub flow: Arc<FlowController>,
	registry: Arc<SharedRegistry>,
	diagnostics: Arc<Diagnostics>,
	sink_handle: Option<SinkHandle>,
	config: Config,
}

impl App {
	/// Loads the provider registry and security gate, spawns the sink
	/// worker pool, and ensures the event store's indexes exist before
	/// returning (spec.md §6: "indexes created if absent" at startup).
	pub async fn start(config: Config, store: Arc<dyn EventStore>) -> anyhow::Result<Self> {
		let registry = registry::load(&config.primary_provider_config, config.override_provider_config.as_deref())?;
		let registry = Arc::new(SharedRegistry::new(registry));

		let security = Arc::new(SecurityGate::load(&config.state_dir)?);
		let diagnostics = Arc::new(Diagnostics::new());

		store
			.ensure_indexes(&crate::store::required_indexes())
			.await
			.map_err(|e| anyhow::anyhow!("failed to ensure event store indexes: {e}"))?;

		let sink_handle = sink::spawn(store, diagnostics.clone(), config.sink_config());

		let flow = Arc::new(FlowController::new(
			registry.clone(),
			security,
			sink_handle.sink.clone(),
			diagnostics.clone(),
			config.legacy_host_rewrite.clone(),
			config.max_sse_event_bytes,
		));

		Ok(App {
			flow,
			registry,
			diagnostics,
			sink_handle: Some(sink_handle),
			config,
		})
	}

	/// Recompiles the provider registry from disk and atomically swaps
	/// it in (spec.md §4.8, §5: "in-flight flows keep their resolved
	/// snapshot"). A failed reload leaves the previous snapshot serving,
	/// matching C1's load-time validation contract.
	pub fn reload(&self) -> anyhow::Result<()> {
		let fresh = registry::load(&self.config.primary_provider_config, self.config.override_provider_config.as_deref())?;
		self.registry.store(fresh);
		tracing::info!("provider registry reloaded");
		Ok(())
	}

	pub fn diagnostics(&self) -> Arc<Diagnostics> {
		self.diagnostics.clone()
	}

	/// Stops accepting new sink work and waits up to `grace` for
	/// in-flight writes to land (spec.md §4.8: "grace deadline then sink
	/// drain").
	pub async fn shutdown(mut self, grace: Duration) {
		if let Some(handle) = self.sink_handle.take() {
			handle.drain(grace).await;
		}
	}
}

/// Convenience path helper matching the teacher's `config.rs` layout:
/// state files live directly under the configured state directory.
pub fn default_state_dir() -> std::path::PathBuf {
	std::env::var_os("TOKENTAP_STATE_DIR")
		.map(std::path::PathBuf::from)
		.unwrap_or_else(|| Path::new("/var/lib/tokentap").to_path_buf())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::memory::MemoryEventStore;

	fn test_config(dir: &Path) -> Config {
		let mut cfg = Config::from_env(dir.to_path_buf(), dir.join("providers.json")).unwrap();
		std::fs::write(&cfg.primary_provider_config, crate::registry::builtin::catalog_json().to_string()).unwrap();
		cfg.override_provider_config = None;
		cfg
	}

	#[tokio::test]
	async fn start_reload_shutdown_round_trip() {
		let dir = tempfile::tempdir().unwrap();
		let config = test_config(dir.path());
		let store = Arc::new(MemoryEventStore::new());
		let app = App::start(config, store.clone()).await.unwrap();

		assert_eq!(app.flow.in_flight_count(), 0);
		app.reload().unwrap();
		app.shutdown(Duration::from_millis(500)).await;
	}
}
