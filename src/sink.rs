//! Event Sink (C6, spec.md §4.6).
//!
//! A bounded queue plus a small worker pool is the only component
//! permitted to block on I/O (spec.md §4.6 "runs disjoint from flow
//! handlers"). Grounded on Design Note §9 ("bounded single-consumer
//! queue with a dedicated worker task; do not spawn a task per event")
//! and enriched, per SPEC_FULL.md §"C6", with retry/backoff beyond what
//! the teacher's fire-and-forget logging path does — closer to the
//! bounded-queue-plus-worker-pool idiom used for durable event buses
//! elsewhere in the retrieval pack.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::diagnostics::Diagnostics;
use crate::error::ErrSink;
use crate::event::Event;
use crate::store::EventStore;

pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;
pub const DEFAULT_WORKER_COUNT: usize = 2;
const RETRY_BASE: Duration = Duration::from_millis(100);
const RETRY_CAP: Duration = Duration::from_secs(5);
const MAX_ATTEMPTS: u32 = 5;

pub struct SinkConfig {
	pub queue_capacity: usize,
	pub worker_count: usize,
}

impl Default for SinkConfig {
	fn default() -> Self {
		SinkConfig {
			queue_capacity: DEFAULT_QUEUE_CAPACITY,
			worker_count: DEFAULT_WORKER_COUNT,
		}
	}
}

/// Handle the flow controller enqueues onto; cheap to clone, safe to
/// call from any flow handler without ever suspending.
#[derive(Clone)]
pub struct Sink {
	tx: mpsc::Sender<Event>,
}

pub struct SinkHandle {
	pub sink: Sink,
	workers: Vec<JoinHandle<()>>,
	rx_closer: mpsc::Sender<Event>,
}

impl Sink {
	/// Non-blocking enqueue (spec.md §4.6): on a full queue this
	/// increments `sink.dropped` and returns immediately — it never
	/// blocks the proxy hook.
	pub fn enqueue(&self, event: Event, diagnostics: &Diagnostics) {
		if self.tx.try_send(event).is_err() {
			diagnostics.record_sink_dropped();
		}
	}
}

/// Spawns the worker pool and returns a [`SinkHandle`]. The receiver is
/// shared behind a `tokio::sync::Mutex` so each worker performs a short
/// exclusive `recv().await` and then releases it — a standard way to
/// turn `mpsc`'s single-consumer channel into a worker pool without a
/// dedicated MPMC dependency.
pub fn spawn(store: Arc<dyn EventStore>, diagnostics: Arc<Diagnostics>, config: SinkConfig) -> SinkHandle {
	let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
	let rx = Arc::new(AsyncMutex::new(rx));

	let workers = (0..config.worker_count.max(1))
		.map(|_| {
			let rx = rx.clone();
			let store = store.clone();
			let diagnostics = diagnostics.clone();
			tokio::spawn(worker_loop(rx, store, diagnostics))
		})
		.collect();

	SinkHandle {
		sink: Sink { tx: tx.clone() },
		workers,
		rx_closer: tx,
	}
}

async fn worker_loop(rx: Arc<AsyncMutex<mpsc::Receiver<Event>>>, store: Arc<dyn EventStore>, diagnostics: Arc<Diagnostics>) {
	loop {
		let event = {
			let mut rx = rx.lock().await;
			rx.recv().await
		};
		let Some(event) = event else {
			return; // channel closed: shutdown
		};
		write_with_retry(&*store, event, &diagnostics).await;
	}
}

async fn write_with_retry(store: &dyn EventStore, event: Event, diagnostics: &Diagnostics) {
	let mut delay = RETRY_BASE;
	for attempt in 1..=MAX_ATTEMPTS {
		match store.insert_one(event.clone()).await {
			Ok(()) => return,
			Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
				tracing::debug!(attempt, "transient sink write failure: {e}");
				tokio::time::sleep(delay).await;
				delay = (delay * 2).min(RETRY_CAP);
			},
			Err(e) => {
				tracing::error!(provider_id = %event.provider_id, model = ?event.model, "sink write failed permanently: {e}");
				diagnostics.record_sink_failed();
				return;
			},
		}
	}
}

impl SinkHandle {
	/// Waits up to `deadline` for the queue to drain, then stops
	/// accepting new work and joins the workers. Items still in flight
	/// when the deadline elapses are left to the worker's own retry
	/// budget, not force-completed (spec.md §5: sink retries "will not
	/// outlive process shutdown's grace deadline", enforced by the
	/// caller choosing `deadline` accordingly).
	pub async fn drain(self, deadline: Duration) {
		drop(self.rx_closer);
		let join_all = futures_util::future::join_all(self.workers);
		let _ = tokio::time::timeout(deadline, join_all).await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::context::RequestContext;
	use crate::extract::{RequestDigest, UsageDelta};
	use crate::registry::CaptureMode;
	use crate::store::memory::MemoryEventStore;
	use std::sync::atomic::{AtomicUsize, Ordering};

	fn sample_event(n: u64) -> Event {
		crate::event::assemble(crate::event::EventInputs {
			started_at: chrono::DateTime::<chrono::Utc>::from_timestamp(0, 0).unwrap(),
			duration_ms: 1,
			provider_id: crate::strng("anthropic"),
			usage: &UsageDelta {
				input_tokens: n,
				..Default::default()
			},
			digest: &RequestDigest::default(),
			response_status: 200,
			streaming: false,
			client_type: None,
			device_id: crate::strng("d1"),
			has_budget_tokens: false,
			path_matches_llm_pattern: false,
			capture_mode: CaptureMode::KnownOnly,
			context: RequestContext::default(),
			metadata: None,
			capture_full: false,
			raw_request: None,
			raw_response: None,
			truncated: false,
		})
	}

	#[tokio::test]
	async fn events_written_through_reach_the_store() {
		let store = Arc::new(MemoryEventStore::new());
		let diagnostics = Arc::new(Diagnostics::new());
		let handle = spawn(store.clone(), diagnostics.clone(), SinkConfig::default());
		for i in 0..4 {
			handle.sink.enqueue(sample_event(i), &diagnostics);
		}
		handle.drain(Duration::from_secs(2)).await;
		assert_eq!(store.count().await, 4);
		assert_eq!(diagnostics.snapshot().sink_dropped, 0);
	}

	/// Scenario 5 (spec.md §8): queue capacity 4, writer blocked, enqueue
	/// 10 events; expect first 4 persisted eventually, `sink.dropped=6`.
	#[tokio::test]
	async fn scenario_five_sink_saturation() {
		struct BlockedStore {
			writes: AtomicUsize,
		}
		impl EventStore for BlockedStore {
			fn insert_one(&self, _event: Event) -> futures_util::future::BoxFuture<'_, Result<(), ErrSink>> {
				Box::pin(async move {
					self.writes.fetch_add(1, Ordering::SeqCst);
					std::future::pending::<()>().await;
					unreachable!()
				})
			}
			fn ensure_indexes(&self, _s: &[crate::store::IndexSpec]) -> futures_util::future::BoxFuture<'_, Result<(), ErrSink>> {
				Box::pin(async { Ok(()) })
			}
			fn count(&self) -> futures_util::future::BoxFuture<'_, usize> {
				Box::pin(async move { self.writes.load(Ordering::SeqCst) })
			}
			fn delete_all(&self) -> futures_util::future::BoxFuture<'_, Result<(), ErrSink>> {
				Box::pin(async { Ok(()) })
			}
		}

		let store = Arc::new(BlockedStore { writes: AtomicUsize::new(0) });
		let diagnostics = Arc::new(Diagnostics::new());
		let config = SinkConfig {
			queue_capacity: 4,
			worker_count: 1,
		};
		let handle = spawn(store.clone(), diagnostics.clone(), config);

		// No `.await` between sends: the single worker task never gets a
		// chance to run, so the channel buffer (capacity 4) fills exactly
		// as a stalled writer would leave it.
		for i in 0..10u64 {
			handle.sink.enqueue(sample_event(i), &diagnostics);
		}

		assert_eq!(diagnostics.snapshot().sink_dropped, 6);
	}
}
