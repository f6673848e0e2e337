//! Event store / device registry contract (spec.md §6 "Event store
//! contract") and an in-memory reference implementation used by tests
//! and by `store::memory` consumers that have no real store wired up
//! yet. The production store (a document collection) is an external
//! collaborator per SPEC_FULL.md §2 — this crate only defines the trait
//! boundary it is driven through.

use std::collections::HashMap;
use std::sync::Mutex;

use futures_util::future::BoxFuture;

use crate::error::ErrSink;
use crate::event::Event;
use crate::Strng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
	Asc,
	Desc,
}

/// One index the event store must have before the sink starts writing
/// (spec.md §6: "Indexes required at startup (created if absent)").
#[derive(Debug, Clone)]
pub struct IndexSpec {
	pub fields: Vec<(&'static str, SortOrder)>,
}

fn single(field: &'static str) -> IndexSpec {
	IndexSpec {
		fields: vec![(field, SortOrder::Asc)],
	}
}

fn compound(a: &'static str, b: &'static str) -> IndexSpec {
	IndexSpec {
		fields: vec![(a, SortOrder::Asc), (b, SortOrder::Desc)],
	}
}

/// The exact index list in spec.md §6.
pub fn required_indexes() -> Vec<IndexSpec> {
	vec![
		single("timestamp"),
		compound("provider_id", "timestamp"),
		compound("model", "timestamp"),
		single("context.program"),
		single("context.project"),
		compound("program", "timestamp"),
		compound("project", "timestamp"),
		single("device_id"),
		single("is_token_consuming"),
		compound("device_id", "timestamp"),
	]
}

/// External append-only document collection (spec.md §6):
/// `insert_one`, a query surface, and index management. `find`/
/// `aggregate` are the dashboard's concern more than the sink's; this
/// trait only exposes what the core itself drives (`insert_one`,
/// `ensure_indexes`) plus the `count`/`delete_all` pair scenario 6 (§8)
/// needs for the admin-token-protected destructive endpoint.
pub trait EventStore: Send + Sync {
	fn insert_one(&self, event: Event) -> BoxFuture<'_, Result<(), ErrSink>>;
	fn ensure_indexes(&self, specs: &[IndexSpec]) -> BoxFuture<'_, Result<(), ErrSink>>;
	fn count(&self) -> BoxFuture<'_, usize>;
	fn delete_all(&self) -> BoxFuture<'_, Result<(), ErrSink>>;
}

/// Device record keyed by `device_id`, with an optional operator-
/// assigned `name` (spec.md §3 "Device record"). Upserts are off the
/// hot path — the sink worker does them opportunistically, last-write-
/// wins, no transactional coupling with the `Event` insert (spec.md §5).
#[derive(Debug, Clone, Default)]
pub struct DeviceRecord {
	pub device_id: Strng,
	pub name: Option<String>,
}

pub trait DeviceStore: Send + Sync {
	fn upsert_seen(&self, device_id: Strng) -> BoxFuture<'_, Result<(), ErrSink>>;
	fn set_name(&self, device_id: &str, name: String) -> BoxFuture<'_, Result<(), ErrSink>>;
	fn get(&self, device_id: &str) -> BoxFuture<'_, Option<DeviceRecord>>;
}

/// In-memory reference implementation (SPEC_FULL.md §2): not the
/// production store, but enough to drive the sink end-to-end in tests
/// and to exercise the scenarios in spec.md §8.
pub mod memory {
	use super::*;

	#[derive(Default)]
	pub struct MemoryEventStore {
		events: Mutex<Vec<Event>>,
	}

	impl MemoryEventStore {
		pub fn new() -> Self {
			Self::default()
		}

		pub fn snapshot(&self) -> Vec<Event> {
			self.events.lock().expect("poisoned").clone()
		}
	}

	impl EventStore for MemoryEventStore {
		fn insert_one(&self, event: Event) -> BoxFuture<'_, Result<(), ErrSink>> {
			Box::pin(async move {
				self.events.lock().expect("poisoned").push(event);
				Ok(())
			})
		}

		fn ensure_indexes(&self, _specs: &[IndexSpec]) -> BoxFuture<'_, Result<(), ErrSink>> {
			Box::pin(async { Ok(()) })
		}

		fn count(&self) -> BoxFuture<'_, usize> {
			Box::pin(async move { self.events.lock().expect("poisoned").len() })
		}

		fn delete_all(&self) -> BoxFuture<'_, Result<(), ErrSink>> {
			Box::pin(async move {
				self.events.lock().expect("poisoned").clear();
				Ok(())
			})
		}
	}

	#[derive(Default)]
	pub struct MemoryDeviceStore {
		devices: Mutex<HashMap<String, DeviceRecord>>,
	}

	impl MemoryDeviceStore {
		pub fn new() -> Self {
			Self::default()
		}
	}

	impl DeviceStore for MemoryDeviceStore {
		fn upsert_seen(&self, device_id: Strng) -> BoxFuture<'_, Result<(), ErrSink>> {
			Box::pin(async move {
				let mut devices = self.devices.lock().expect("poisoned");
				devices
					.entry(device_id.to_string())
					.or_insert_with(|| DeviceRecord {
						device_id: device_id.clone(),
						name: None,
					});
				Ok(())
			})
		}

		fn set_name(&self, device_id: &str, name: String) -> BoxFuture<'_, Result<(), ErrSink>> {
			Box::pin(async move {
				let mut devices = self.devices.lock().expect("poisoned");
				match devices.get_mut(device_id) {
					Some(rec) => rec.name = Some(name),
					None => {
						devices.insert(
							device_id.to_string(),
							DeviceRecord {
								device_id: crate::strng(device_id),
								name: Some(name),
							},
						);
					},
				}
				Ok(())
			})
		}

		fn get(&self, device_id: &str) -> BoxFuture<'_, Option<DeviceRecord>> {
			let found = self.devices.lock().expect("poisoned").get(device_id).cloned();
			Box::pin(async move { found })
		}
	}

}
