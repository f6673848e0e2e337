//! Health & Control (C8, spec.md §4.8).
//!
//! `/health` is answered by the proxy itself, not a side HTTP server
//! (spec.md §4.8) — this module only builds the response and the signal
//! handling primitives; `app.rs` wires them into the addon the MITM
//! engine drives. Grounded on the teacher's `app::Bound::wait_termination`
//! (signal → drain → exit) and `management::hyper_helpers::Server`'s
//! graceful-shutdown shape.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::diagnostics::Diagnostics;
use crate::http;

/// Default grace deadline for in-flight flows on shutdown (spec.md
/// §4.8).
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// `200 {"status":"ok","proxy":true}` (spec.md §6).
pub fn health_response() -> http::Response {
	let body = json!({"status": "ok", "proxy": true}).to_string();
	::http::Response::builder()
		.status(200)
		.header("content-type", "application/json")
		.body(http::Body::from(body))
		.expect("static health response is always well-formed")
}

/// Status document for the internal admin surface (SPEC_FULL.md §"C8"):
/// the §7 counters plus the live `capture_mode`, grounded on the
/// teacher's `ConfigDumpHandler` pattern of pluggable dump handlers
/// feeding one JSON document.
pub struct StatusHandler {
	diagnostics: Arc<Diagnostics>,
}

impl StatusHandler {
	pub fn new(diagnostics: Arc<Diagnostics>) -> Self {
		StatusHandler { diagnostics }
	}

	pub fn status_json(&self) -> serde_json::Value {
		let counters = self.diagnostics.snapshot();
		json!({
			"sink_dropped": counters.sink_dropped,
			"sink_failed": counters.sink_failed,
			"extract_degraded": counters.extract_degraded,
			"stream_skipped": counters.stream_skipped,
		})
	}
}

/// Waits for `SIGHUP`, invoking `on_reload` each time (spec.md §4.8:
/// "schedules a registry reload via C1; non-blocking"). Runs until the
/// process is asked to shut down; the caller should race this against
/// [`wait_for_shutdown_signal`].
#[cfg(unix)]
pub async fn run_reload_loop(on_reload: impl Fn() + Send + 'static) {
	use tokio::signal::unix::{signal, SignalKind};
	let mut hangup = match signal(SignalKind::hangup()) {
		Ok(s) => s,
		Err(e) => {
			tracing::warn!("failed to install SIGHUP handler: {e}");
			return;
		},
	};
	loop {
		hangup.recv().await;
		tracing::info!("SIGHUP received, reloading provider registry");
		on_reload();
	}
}

#[cfg(not(unix))]
pub async fn run_reload_loop(_on_reload: impl Fn() + Send + 'static) {
	std::future::pending::<()>().await;
}

/// Resolves once `SIGTERM` or `SIGINT` is observed (spec.md §4.8).
pub async fn wait_for_shutdown_signal() {
	let ctrl_c = tokio::signal::ctrl_c();
	#[cfg(unix)]
	{
		use tokio::signal::unix::{signal, SignalKind};
		let mut terminate = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
		tokio::select! {
			_ = ctrl_c => {},
			_ = terminate.recv() => {},
		}
	}
	#[cfg(not(unix))]
	{
		let _ = ctrl_c.await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use http_body_util::BodyExt;

	#[tokio::test]
	async fn health_response_shape() {
		let resp = health_response();
		assert_eq!(resp.status(), 200);
		let body = resp.into_body().collect().await.unwrap().to_bytes();
		let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
		assert_eq!(value["status"], "ok");
		assert_eq!(value["proxy"], true);
	}

	#[test]
	fn status_json_reflects_diagnostics() {
		let diagnostics = Arc::new(Diagnostics::new());
		diagnostics.record_sink_dropped();
		diagnostics.record_extract_degraded();
		let handler = StatusHandler::new(diagnostics);
		let status = handler.status_json();
		assert_eq!(status["sink_dropped"], 1);
		assert_eq!(status["extract_degraded"], 1);
	}
}
