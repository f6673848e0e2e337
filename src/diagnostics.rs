//! Process-wide counters and log-once bookkeeping (spec.md §7: "exposed
//! via logs and an internal status endpoint").
//!
//! `control::Counters` snapshots these for the admin status surface;
//! `tracing` WARN events carry the same information for log-based
//! alerting, matching the teacher's dual metrics+log reporting in
//! `telemetry/metrics.rs` and `telemetry/log.rs`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// A single (provider, path) extraction-quality warning is logged once
/// per process lifetime, not once per request — a misconfigured provider
/// on a hot path would otherwise flood logs.
#[derive(Default)]
pub struct Diagnostics {
	logged_once: Mutex<HashSet<(crate::Strng, String)>>,
	pub sink_dropped: AtomicU64,
	pub sink_failed: AtomicU64,
	pub extract_degraded: AtomicU64,
	pub stream_skipped: AtomicU64,
}

impl Diagnostics {
	pub fn new() -> Self {
		Self::default()
	}

	/// Logs `message` at WARN via `tracing` the first time this
	/// `(provider, path)` pair is seen; a no-op afterwards.
	pub fn warn_once(&self, provider: &crate::Strng, path: &str, message: &str) {
		let key = (provider.clone(), path.to_string());
		let mut seen = self.logged_once.lock();
		if seen.insert(key) {
			tracing::warn!(provider = %provider, path, "{message}");
		}
	}

	pub fn record_sink_dropped(&self) {
		self.sink_dropped.fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_sink_failed(&self) {
		self.sink_failed.fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_extract_degraded(&self) {
		self.extract_degraded.fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_stream_skipped(&self) {
		self.stream_skipped.fetch_add(1, Ordering::Relaxed);
	}

	/// Bulk variant for folding a finished stream's `skip_counter` in one
	/// call instead of looping `record_stream_skipped`.
	pub fn record_stream_skipped_by(&self, n: u64) {
		if n > 0 {
			self.stream_skipped.fetch_add(n, Ordering::Relaxed);
		}
	}

	pub fn snapshot(&self) -> Counters {
		Counters {
			sink_dropped: self.sink_dropped.load(Ordering::Relaxed),
			sink_failed: self.sink_failed.load(Ordering::Relaxed),
			extract_degraded: self.extract_degraded.load(Ordering::Relaxed),
			stream_skipped: self.stream_skipped.load(Ordering::Relaxed),
		}
	}
}

/// Plain snapshot of the counters above, serialized into the admin
/// status document (see `control::StatusHandler`).
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct Counters {
	pub sink_dropped: u64,
	pub sink_failed: u64,
	pub extract_degraded: u64,
	pub stream_skipped: u64,
}
