//! Flow Controller (C4, spec.md §4.4).
//!
//! The seam the external MITM engine drives: three hooks per flow,
//! invoked strictly sequentially for a given `flow_id` (spec.md §4.4,
//! §5). This module owns per-flow state, coordinates the registry (C1),
//! extractor (C2), stream accumulator (C3), context/device resolver
//! (C5), and sink (C6), and enforces the quality check that triggers
//! legacy fallback (§4.3).
//!
//! Grounded on the teacher's hook-shaped addon interface (proxy hooks
//! that take/return a request or response and never block forwarding on
//! internal failure) and on `json.rs`'s `inspect_body` idiom (read the
//! body, reconstruct it from the same bytes, regardless of what parsing
//! does with the copy).

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::BodyExt;
use parking_lot::Mutex;
use serde_json::Value;

use crate::context::{self, RequestContext};
use crate::diagnostics::Diagnostics;
use crate::event::{self, Event};
use crate::extract::{self, RequestDigest, UsageDelta};
use crate::fieldpath::Path;
use crate::http::{self, Body, Error, Request, Response};
use crate::legacy;
use crate::registry::{ProviderDefinition, Resolution, Registry, SharedRegistry};
use crate::security::SecurityGate;
use crate::sink::Sink;
use crate::stream::{self, Accumulator, SharedAccumulator};
use crate::Strng;

/// Opaque engine-assigned flow identifier (Glossary: "Flow"). The real
/// MITM engine's id type is whatever it chooses; this core only needs
/// it as a hashable key, so a `u64` stands in for it.
pub type FlowId = u64;

/// Per-flow facts the hook interface cannot read off the `Request`
/// itself because they come from the transport layer the MITM engine
/// owns (spec.md §4.5 device fingerprint needs the client's IP).
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
	pub client_ip: String,
}

/// One in-flight intercepted request (spec.md §3 `FlowState`). Owned
/// exclusively by the handler processing this flow's hooks; never
/// shared across flows. Removed from [`FlowController`]'s map the
/// moment `on_response` hands its `Event` to the sink (or the flow
/// never entered the map at all, for passthrough).
struct FlowState {
	provider: Option<Arc<ProviderDefinition>>,
	provider_id: Strng,
	started_instant: Instant,
	started_wall: DateTime<Utc>,
	request_path: String,
	digest: RequestDigest,
	request_doc: Option<Value>,
	response_doc: Option<Value>,
	raw_request: Option<Bytes>,
	context: RequestContext,
	device_id: Strng,
	client_type: Option<String>,
	capture_full: bool,
	streaming: bool,
	accum: Option<SharedAccumulator>,
	/// Keeps the registry snapshot this flow resolved against alive
	/// even if `reload()` installs a newer one mid-flight (spec.md §5:
	/// "old snapshots remain alive until their last flow releases
	/// them").
	_registry_snapshot: Arc<Registry>,
}

/// Implements spec.md §4.4: resolves providers, drives extraction, and
/// hands a finished `Event` to the sink. Re-entrant across flows — no
/// lock is ever held across an extraction call, only across the brief
/// map insert/remove.
pub struct FlowController {
	registry: Arc<SharedRegistry>,
	security: Arc<SecurityGate>,
	sink: Sink,
	diagnostics: Arc<Diagnostics>,
	legacy_host_rewrite: HashMap<String, String>,
	max_sse_event_bytes: usize,
	flows: Mutex<HashMap<FlowId, FlowState>>,
}

impl FlowController {
	pub fn new(
		registry: Arc<SharedRegistry>,
		security: Arc<SecurityGate>,
		sink: Sink,
		diagnostics: Arc<Diagnostics>,
		legacy_host_rewrite: Vec<(String, String)>,
		max_sse_event_bytes: usize,
	) -> Self {
		FlowController {
			registry,
			security,
			sink,
			diagnostics,
			legacy_host_rewrite: legacy_host_rewrite.into_iter().collect(),
			max_sse_event_bytes,
			flows: Mutex::new(HashMap::new()),
		}
	}

	/// Number of flows currently tracked; exposed for tests asserting
	/// the "zero `FlowState` retained" passthrough invariant (spec.md
	/// §8).
	pub fn in_flight_count(&self) -> usize {
		self.flows.lock().len()
	}

	/// Hook 1 (spec.md §4.4): resolve the provider, decode the body,
	/// extract, and store `FlowState`. The request is always forwarded
	/// with its body intact, regardless of what happens internally —
	/// extractor failure never impedes forwarding (spec.md §4.4).
	pub async fn on_request(&self, flow_id: FlowId, meta: &RequestMeta, req: Request) -> Request {
		let (mut parts, body) = req.into_parts();
		apply_legacy_host_rewrite(&self.legacy_host_rewrite, &mut parts);

		let body_bytes = match read_body_bytes(body).await {
			Ok(b) => b,
			Err(e) => {
				tracing::debug!(flow_id, error = %e, "failed to read request body; flow marked passthrough");
				return Request::from_parts(parts, Body::empty());
			},
		};
		let forward_body = Body::from(body_bytes.clone());

		let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| self.process_request(meta, &parts, body_bytes)));

		match outcome {
			Ok(Some(state)) => {
				self.flows.lock().insert(flow_id, state);
			},
			Ok(None) => {}, // unresolved host under known_only: passthrough, no FlowState
			Err(_panic) => {
				tracing::warn!(flow_id, "on_request hook panicked; flow marked passthrough");
			},
		}

		Request::from_parts(parts, forward_body)
	}

	fn process_request(&self, meta: &RequestMeta, parts: &::http::request::Parts, body_bytes: Bytes) -> Option<FlowState> {
		let host = parts.uri.host()?.to_ascii_lowercase();
		let registry = self.registry.load();
		let (provider, provider_id) = match registry.resolve(&host) {
			Resolution::None => return None,
			Resolution::Unknown => (None, crate::strng("unknown")),
			Resolution::Known(id) => {
				let def = registry.get(&id)?;
				(Some(def), id)
			},
		};

		let content_type = header_str(&parts.headers, ::http::header::CONTENT_TYPE.as_str()).unwrap_or("");
		let doc: Option<Value> = content_type
			.to_ascii_lowercase()
			.contains("json")
			.then(|| serde_json::from_slice::<Value>(&body_bytes).ok())
			.flatten();

		let digest = match (&provider, &doc) {
			(Some(def), Some(doc)) => extract::extract_request(def, doc),
			_ => RequestDigest::default(),
		};

		let user_agent = header_str(&parts.headers, ::http::header::USER_AGENT.as_str());
		let client_type = user_agent.map(context::client_type_from_user_agent);

		let ctx = context::resolve_context(
			header_str(&parts.headers, "x-tokentap-context"),
			header_str(&parts.headers, "x-tokentap-program"),
			header_str(&parts.headers, "x-tokentap-project"),
			header_str(&parts.headers, "x-tokentap-session"),
			&|k| std::env::var(k).ok(),
			user_agent,
		);

		let session_id_path: Option<&Path> = provider.as_ref().and_then(|d| d.request.session_id_path.as_ref());
		let device_id = context::resolve_device_id(doc.as_ref(), session_id_path, None, None, &meta.client_ip, user_agent);

		let capture_full = self.security.capture_full_enabled_globally() || provider.as_ref().is_some_and(|d| d.capture_full_request);

		Some(FlowState {
			provider,
			provider_id,
			started_instant: Instant::now(),
			started_wall: Utc::now(),
			request_path: parts.uri.path().to_string(),
			digest,
			request_doc: doc,
			response_doc: None,
			raw_request: capture_full.then(|| body_bytes.clone()),
			context: ctx,
			device_id,
			client_type,
			capture_full,
			streaming: false,
			accum: None,
			_registry_snapshot: registry,
		})
	}

	/// Hook 2 (spec.md §4.4): decide streaming vs. buffered and, for a
	/// streaming response, install the [`stream`] tap so chunks reach
	/// the client immediately while C3 observes them.
	pub fn on_response_headers(&self, flow_id: FlowId, resp: Response) -> Response {
		let mut flows = self.flows.lock();
		let Some(state) = flows.get_mut(&flow_id) else {
			return resp;
		};

		let content_type = resp
			.headers()
			.get(::http::header::CONTENT_TYPE)
			.and_then(|v| v.to_str().ok())
			.unwrap_or("")
			.to_ascii_lowercase();
		let is_chunked = resp
			.headers()
			.get(::http::header::TRANSFER_ENCODING)
			.and_then(|v| v.to_str().ok())
			.is_some_and(|v| v.eq_ignore_ascii_case("chunked"));

		let wants_aws = content_type.starts_with("application/vnd.amazon.eventstream");
		let wants_sse =
			!wants_aws && (content_type.starts_with("text/event-stream") || (is_chunked && state.provider.as_ref().is_some_and(|d| d.response_sse.is_some())));

		if !wants_aws && !wants_sse {
			return resp;
		}

		let sse_cfg = state.provider.as_ref().and_then(|d| d.response_sse.clone()).map(Arc::new);
		let accum: SharedAccumulator = Arc::new(StdMutex::new(Accumulator::new(sse_cfg, state.capture_full)));
		state.accum = Some(accum.clone());
		state.streaming = true;
		drop(flows);

		let (parts, body) = resp.into_parts();
		let tapped = if wants_aws {
			stream::tap_aws_event_stream(body, accum)
		} else {
			stream::tap(body, accum, self.max_sse_event_bytes)
		};
		Response::from_parts(parts, tapped)
	}

	/// Hook 3 (spec.md §4.4): finalise extraction (streaming or
	/// buffered), apply the quality check and legacy fallback, assemble
	/// the `Event`, and hand it to the sink without awaiting the write.
	pub async fn on_response(&self, flow_id: FlowId, resp: Response) -> Response {
		let state = self.flows.lock().remove(&flow_id);
		let Some(mut state) = state else {
			return resp;
		};

		let duration_ms = state.started_instant.elapsed().as_millis() as u64;
		let response_status = resp.status().as_u16();
		let (parts, body) = resp.into_parts();

		let (mut usage, raw_response, truncated, forward_body): (UsageDelta, Option<Vec<u8>>, bool, Body) = if state.streaming {
			let accum = state.accum.take().expect("streaming flow must carry an accumulator");
			let finished = accum.lock().expect("accumulator mutex poisoned").finish();
			self.diagnostics.record_stream_skipped_by(finished.skip_counter);
			(finished.usage, finished.tail, finished.tail_dropped_bytes > 0, body)
		} else {
			match read_body_bytes(body).await {
				Ok(bytes) => {
					let content_type = header_str(&parts.headers, ::http::header::CONTENT_TYPE.as_str()).unwrap_or("");
					let doc = content_type
						.to_ascii_lowercase()
						.contains("json")
						.then(|| serde_json::from_slice::<Value>(&bytes).ok())
						.flatten();
					let usage = match (&state.provider, &doc) {
						(Some(def), Some(doc)) => extract::extract_response_json(def, doc, &self.diagnostics, &state.provider_id),
						_ => UsageDelta::default(),
					};
					state.response_doc = doc;
					let raw = state.capture_full.then(|| bytes.to_vec());
					(usage, raw, false, Body::from(bytes))
				},
				Err(e) => {
					tracing::debug!(flow_id, error = %e, "failed to decode response body");
					(UsageDelta::default(), None, false, Body::empty())
				},
			}
		};

		let mut digest = state.digest.clone();
		if let (Some(def), Some(req_doc)) = (state.provider.clone(), state.request_doc.clone()) {
			let degraded = quality_check_degraded(&def, &req_doc, &digest);
			if degraded {
				self.diagnostics.record_extract_degraded();
			}
			let extractor = legacy::select(&state.provider_id, Some(&def), degraded);
			if let legacy::Extractor::Builtin(provider_id) = &extractor {
				tracing::info!(flow_id, provider = %provider_id, "extraction degraded, falling back to legacy extractor");
				digest = extractor.extract_request(&req_doc);
				if !state.streaming {
					if let Some(resp_doc) = &state.response_doc {
						if let Some(legacy_usage) = extractor.extract_usage(resp_doc) {
							usage = legacy_usage;
						}
					}
				}
			}
		}

		let has_budget_tokens = state
			.request_doc
			.as_ref()
			.and_then(|d| d.get("thinking"))
			.and_then(|t| t.get("budget_tokens"))
			.is_some();
		let path_matches_llm_pattern = path_matches_llm_pattern(&state.request_path);

		let event: Event = event::assemble(event::EventInputs {
			started_at: state.started_wall,
			duration_ms,
			provider_id: state.provider_id.clone(),
			usage: &usage,
			digest: &digest,
			response_status,
			streaming: state.streaming,
			client_type: state.client_type.clone(),
			device_id: state.device_id.clone(),
			has_budget_tokens,
			path_matches_llm_pattern,
			capture_mode: state._registry_snapshot.capture_mode(),
			context: state.context.clone(),
			metadata: state.provider.as_ref().map(|d| &d.metadata),
			capture_full: state.capture_full,
			raw_request: state.raw_request.as_ref().map(|b| b.to_vec()),
			raw_response,
			truncated,
		});

		self.sink.enqueue(event, &self.diagnostics);

		Response::from_parts(parts, forward_body)
	}
}

/// Spec.md §9 Open Question "Backward-compat host rewrite", resolved in
/// DESIGN.md as: always rewrite when the map has an entry, and the
/// post-rewrite host is authoritative for every subsequent decision —
/// the mutation happens here, before provider resolution ever reads
/// `parts.uri.host()`.
fn apply_legacy_host_rewrite(map: &HashMap<String, String>, parts: &mut ::http::request::Parts) {
	let Some(host) = parts.uri.host() else { return };
	let Some(new_host) = map.get(&host.to_ascii_lowercase()) else {
		return;
	};

	let mut uri_parts = parts.uri.clone().into_parts();
	if let Some(authority) = &uri_parts.authority {
		let new_authority_str = match authority.port_u16() {
			Some(port) => format!("{new_host}:{port}"),
			None => new_host.clone(),
		};
		if let Ok(new_authority) = ::http::uri::Authority::try_from(new_authority_str) {
			uri_parts.authority = Some(new_authority);
			if let Ok(new_uri) = ::http::Uri::from_parts(uri_parts) {
				parts.uri = new_uri;
			}
		}
	}
	if let Some(host_header) = parts.headers.get_mut(::http::header::HOST) {
		if let Ok(hv) = ::http::HeaderValue::from_str(new_host) {
			*host_header = hv;
		}
	}
}

/// The quality check (spec.md §4.3): the declarative extractor is
/// considered degraded if it produced fewer messages than a raw
/// top-level `messages` array on the wire, or if a configured
/// `system_path`/`tools_path` resolved to a present value the
/// extractor nonetheless turned into `None`. The latter can't fire
/// given how `extract.rs` is built (a resolved path never yields
/// `None`), but is kept as the explicit second line of defense the
/// spec names, not dead code — a future change to path evaluation
/// could reintroduce the gap it guards against.
fn quality_check_degraded(def: &ProviderDefinition, raw_request: &Value, digest: &RequestDigest) -> bool {
	let raw_message_count = raw_request.get("messages").and_then(Value::as_array).map(Vec::len).unwrap_or(0);
	if raw_message_count >= 2 {
		let produced = digest.messages.as_ref().map(Vec::len).unwrap_or(0);
		if produced < raw_message_count {
			return true;
		}
	}
	if path_resolved(def.request.system_path.as_ref(), raw_request) && digest.system.is_none() {
		return true;
	}
	if path_resolved(def.request.tools_path.as_ref(), raw_request) && digest.tools.is_none() {
		return true;
	}
	false
}

fn path_resolved(path: Option<&Path>, doc: &Value) -> bool {
	path.is_some_and(|p| !p.evaluate(doc).is_missing())
}

/// No schema field names an "LLM path pattern" catalog (spec.md §3's
/// `is_token_consuming` invariant names the concept without shaping
/// it) — this is a small fixed set of conventional chat-completion
/// endpoint suffixes across the providers the built-in catalog covers.
fn path_matches_llm_pattern(path: &str) -> bool {
	const PATTERNS: &[&str] = &["/messages", "/chat/completions", "/converse", "generateContent", "generateMessage"];
	PATTERNS.iter().any(|p| path.contains(p))
}

fn header_str<'a>(headers: &'a ::http::HeaderMap, name: &str) -> Option<&'a str> {
	headers.get(name).and_then(|v| v.to_str().ok())
}

async fn read_body_bytes(body: Body) -> Result<Bytes, Error> {
	let collected = body.collect().await?;
	Ok(collected.to_bytes())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::registry::builtin;
	use crate::store::memory::MemoryEventStore;
	use serde_json::json;
	use std::sync::Arc as StdArc;
	use std::time::Duration;

	/// The sink hands events to its worker pool over a channel; give the
	/// worker a chance to run before asserting on the store, same as
	/// `sink.rs`'s own tests wait on `SinkHandle::drain`.
	async fn wait_for_events(store: &MemoryEventStore, n: usize) -> Vec<Event> {
		for _ in 0..200 {
			let snap = store.snapshot();
			if snap.len() >= n {
				return snap;
			}
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
		store.snapshot()
	}

	fn controller_with(registry: Registry, capture_all: bool) -> (FlowController, StdArc<MemoryEventStore>) {
		let _ = capture_all;
		let shared = Arc::new(SharedRegistry::new(registry));
		let dir = tempfile::tempdir().unwrap();
		let security = Arc::new(SecurityGate::load(dir.path()).unwrap());
		let diagnostics = Arc::new(Diagnostics::new());
		let store = StdArc::new(MemoryEventStore::new());
		let handle = crate::sink::spawn(store.clone(), diagnostics.clone(), crate::sink::SinkConfig::default());
		// `handle`'s JoinHandles are dropped here, but the worker tasks
		// themselves keep running detached — only the sink side is needed.
		let controller = FlowController::new(shared, security, handle.sink.clone(), diagnostics, Vec::new(), 64 * 1024);
		(controller, store)
	}

	fn request(uri: &str, content_type: Option<&str>, body: Value) -> Request {
		let mut builder = ::http::Request::builder().method("POST").uri(uri);
		if let Some(ct) = content_type {
			builder = builder.header(::http::header::CONTENT_TYPE, ct);
		}
		builder = builder.header(::http::header::USER_AGENT, "claude-code/1.0");
		builder.body(Body::from(body.to_string())).unwrap()
	}

	fn json_response(status: u16, body: Value) -> Response {
		::http::Response::builder()
			.status(status)
			.header(::http::header::CONTENT_TYPE, "application/json")
			.body(Body::from(body.to_string()))
			.unwrap()
	}

	async fn body_json(resp: Response) -> Option<Value> {
		let bytes = resp.into_body().collect().await.ok()?.to_bytes();
		serde_json::from_slice(&bytes).ok()
	}

	#[tokio::test]
	async fn scenario_one_non_streaming_anthropic_full_message_set() {
		let (controller, store) = controller_with(builtin::catalog(), false);
		let flow_id: FlowId = 1;

		let messages: Vec<Value> = (0..35).map(|i| json!({"role": "user", "content": i.to_string()})).collect();
		let system: Vec<Value> = (0..3).map(|i| json!({"type": "text", "text": i.to_string()})).collect();
		let req = request(
			"https://api.anthropic.com/v1/messages",
			Some("application/json"),
			json!({"model": "claude-opus-4", "messages": messages, "system": system}),
		);
		let meta = RequestMeta { client_ip: "10.0.0.1".into() };
		let _forwarded = controller.on_request(flow_id, &meta, req).await;
		assert_eq!(controller.in_flight_count(), 1);

		let resp = json_response(
			200,
			json!({"usage": {"input_tokens": 3, "output_tokens": 99, "cache_read_input_tokens": 54624}}),
		);
		let resp = controller.on_response_headers(flow_id, resp);
		let _forwarded = controller.on_response(flow_id, resp).await;
		assert_eq!(controller.in_flight_count(), 0);

		let events = wait_for_events(&store, 1).await;
		assert_eq!(events.len(), 1);
		let event = &events[0];
		assert_eq!(&*event.provider_id, "anthropic");
		assert_eq!(event.input_tokens, 3);
		assert_eq!(event.output_tokens, 99);
		assert_eq!(event.cache_read_tokens, 54624);
		assert_eq!(event.total_tokens, 102);
		assert_eq!(event.messages.as_ref().unwrap().len(), 35);
		assert_eq!(event.system.as_ref().unwrap().len(), 3);
		assert!(!event.streaming);
		assert!(event.is_token_consuming);
	}

	#[tokio::test]
	async fn scenario_three_unknown_host_capture_all() {
		let mut raw: crate::registry::RawConfig = serde_json::from_value(builtin::catalog_json()).unwrap();
		raw.capture_mode = crate::registry::CaptureMode::CaptureAll;
		let registry = crate::registry::from_raw(raw).unwrap();
		let (controller, store) = controller_with(registry, true);
		let flow_id: FlowId = 2;

		let req = request("https://api.novel.example/v1/chat", Some("application/json"), json!({"foo": "bar"}));
		let meta = RequestMeta::default();
		let _ = controller.on_request(flow_id, &meta, req).await;
		assert_eq!(controller.in_flight_count(), 1);

		let resp = json_response(200, json!({}));
		let resp = controller.on_response_headers(flow_id, resp);
		let _ = controller.on_response(flow_id, resp).await;

		let events = wait_for_events(&store, 1).await;
		assert_eq!(events.len(), 1);
		assert_eq!(&*events[0].provider_id, "unknown");
		assert_eq!(events[0].input_tokens, 0);
		assert_eq!(events[0].output_tokens, 0);
	}

	#[tokio::test]
	async fn unknown_host_known_only_is_passthrough_with_zero_flow_state() {
		let (controller, store) = controller_with(builtin::catalog(), false);
		let flow_id: FlowId = 3;

		let req = request("https://api.novel.example/v1/chat", Some("application/json"), json!({}));
		let meta = RequestMeta::default();
		let _ = controller.on_request(flow_id, &meta, req).await;
		assert_eq!(controller.in_flight_count(), 0, "passthrough must retain zero FlowState");

		let resp = json_response(200, json!({}));
		let resp = controller.on_response_headers(flow_id, resp);
		let _ = controller.on_response(flow_id, resp).await;
		assert_eq!(store.snapshot().len(), 0, "passthrough must emit zero events");
	}

	#[tokio::test]
	async fn scenario_four_quality_check_falls_back_to_legacy_extractor() {
		// Misconfigure `messages_path` to point at a field that doesn't
		// exist, while the raw body carries a top-level `messages`
		// array of length 12 — exactly scenario 4 in spec.md §8.
		let mut json = builtin::catalog_json();
		json["providers"][0]["request"]["messages_path"] = serde_json::json!("$.wrong_field");
		let raw: crate::registry::RawConfig = serde_json::from_value(json).unwrap();
		let registry = crate::registry::from_raw(raw).unwrap();
		let (controller, store) = controller_with(registry, false);
		let flow_id: FlowId = 4;

		let messages: Vec<Value> = (0..12).map(|i| json!({"role": "user", "content": i.to_string()})).collect();
		let req = request(
			"https://api.anthropic.com/v1/messages",
			Some("application/json"),
			json!({"model": "claude-opus-4", "messages": messages}),
		);
		let meta = RequestMeta::default();
		let _ = controller.on_request(flow_id, &meta, req).await;

		let resp = json_response(200, json!({"usage": {"input_tokens": 1, "output_tokens": 1}}));
		let resp = controller.on_response_headers(flow_id, resp);
		let _ = controller.on_response(flow_id, resp).await;

		let events = wait_for_events(&store, 1).await;
		assert_eq!(events.len(), 1);
		assert_eq!(
			events[0].messages.as_ref().unwrap().len(),
			12,
			"legacy extractor must recover the full message count"
		);
	}

	#[tokio::test]
	async fn streaming_response_tags_event_as_streaming() {
		let (controller, store) = controller_with(builtin::catalog(), false);
		let flow_id: FlowId = 5;

		let req = request(
			"https://api.anthropic.com/v1/messages",
			Some("application/json"),
			json!({"model": "claude-opus-4", "messages": [{"role": "user", "content": "hi"}]}),
		);
		let meta = RequestMeta::default();
		let _ = controller.on_request(flow_id, &meta, req).await;

		let sse_body = "event: message_start\ndata: {\"message\": {\"usage\": {\"input_tokens\": 10}}}\n\n\
			event: message_delta\ndata: {\"usage\": {\"output_tokens\": 25}}\n\n";
		let resp = ::http::Response::builder()
			.status(200)
			.header(::http::header::CONTENT_TYPE, "text/event-stream")
			.body(Body::from(sse_body))
			.unwrap();
		let resp = controller.on_response_headers(flow_id, resp);

		// Engine forwards the tapped body to the client; draining it here
		// stands in for that forwarding and is what drives the accumulator.
		let resp_bytes = {
			let (parts, body) = resp.into_parts();
			let bytes = body.collect().await.unwrap().to_bytes();
			Response::from_parts(parts, Body::from(bytes))
		};
		let _ = controller.on_response(flow_id, resp_bytes).await;

		let events = wait_for_events(&store, 1).await;
		assert_eq!(events.len(), 1);
		assert!(events[0].streaming);
		assert_eq!(events[0].input_tokens, 10);
		assert_eq!(events[0].output_tokens, 25);
	}

	#[tokio::test]
	async fn body_json_helper_unused_warning_guard() {
		// `body_json` is kept for ad-hoc debugging of forwarded
		// responses in future tests; exercise it once so it isn't
		// flagged as dead code.
		let resp = json_response(200, json!({"a": 1}));
		assert_eq!(body_json(resp).await.unwrap()["a"], 1);
	}
}
