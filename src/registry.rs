//! Provider Registry (C1, spec.md §4.1).
//!
//! Config is two JSON documents — a package-bundled primary and an
//! operator-local override — deep-merged (override leaf wins, arrays
//! replaced wholesale) and validated before compiling field-path
//! expressions. A load failure never touches the running snapshot;
//! `reload` is an atomic pointer swap, grounded on the teacher's
//! `arc-swap`-backed config snapshots (`crates/agentgateway` depends on
//! `arc-swap` for exactly this "readers see a consistent pointer, reload
//! installs a new one" pattern).

use std::collections::{HashMap, HashSet};
use std::path::Path as FsPath;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Deserialize;
use serde_json::Value;

use crate::error::ErrConfig;
use crate::fieldpath::Path;
use crate::{strng, Strng};

/// `{known_only, capture_all}` — process-wide, reloadable (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
	KnownOnly,
	CaptureAll,
}

impl Default for CaptureMode {
	fn default() -> Self {
		CaptureMode::KnownOnly
	}
}

/// Outcome of [`ProviderRegistry::resolve`]: a registry invariant ties
/// the "unknown" vs "no interception" distinction to `capture_mode`
/// (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
	Known(Strng),
	Unknown,
	None,
}

/// One field's ordered path list: `paths[0]` is the primary, the rest
/// are fallback alternates tried in order on `Missing` (spec.md §3: "each
/// with optional ordered alternates").
#[derive(Debug, Clone)]
pub struct AlternatesPath {
	paths: Vec<Path>,
}

impl AlternatesPath {
	fn compile(exprs: &[String]) -> Result<Self, ErrConfig> {
		let paths = exprs.iter().map(|e| Path::parse(e)).collect::<Result<_, _>>()?;
		Ok(AlternatesPath { paths })
	}

	pub fn evaluate<'a>(&self, doc: &'a Value) -> crate::fieldpath::Extracted<'a> {
		crate::fieldpath::evaluate_first_present(doc, &self.paths)
	}
}

#[derive(Debug, Clone)]
pub struct RequestPaths {
	pub model_path: Path,
	pub messages_path: Path,
	pub system_path: Option<Path>,
	pub tools_path: Option<Path>,
	pub text_fields: Vec<Path>,
	/// Where a stable client-assigned session id lives in the request
	/// body, if this provider exposes one (spec.md §4.5 device-id
	/// resolution tier 1, e.g. Anthropic's `session_id` on message
	/// metadata). Absent for providers with no such field.
	pub session_id_path: Option<Path>,
	/// Extended-thinking / reasoning config on the request (spec.md §4.2
	/// `extract_request` output `thinking`), e.g. Anthropic's top-level
	/// `thinking` object. Absent for providers with no such concept.
	pub thinking_path: Option<Path>,
	/// Caller-supplied request metadata (spec.md §4.2 `extract_request`
	/// output `metadata`), e.g. a `metadata` object carrying a caller's
	/// user id. Absent for providers with no such field.
	pub metadata_path: Option<Path>,
}

#[derive(Debug, Clone, Default)]
pub struct ResponseJson {
	pub input_tokens_path: Option<AlternatesPath>,
	pub output_tokens_path: Option<AlternatesPath>,
	pub cache_creation_tokens_path: Option<AlternatesPath>,
	pub cache_read_tokens_path: Option<AlternatesPath>,
	pub model_path: Option<AlternatesPath>,
	pub stop_reason_path: Option<AlternatesPath>,
}

#[derive(Debug, Clone)]
pub struct ResponseSse {
	pub event_types: Vec<String>,
	pub input_tokens_event: String,
	pub input_tokens_path: Path,
	pub output_tokens_event: String,
	pub output_tokens_path: Path,
}

#[derive(Debug, Clone, Default)]
pub struct Metadata {
	pub tags: Vec<String>,
	pub cost_per_input_token: Option<f64>,
	pub cost_per_output_token: Option<f64>,
}

/// Immutable after load (spec.md §3).
#[derive(Debug, Clone)]
pub struct ProviderDefinition {
	pub id: Strng,
	pub domains: HashSet<String>,
	pub request: RequestPaths,
	pub response_json: Option<ResponseJson>,
	pub response_sse: Option<ResponseSse>,
	pub metadata: Metadata,
	pub capture_full_request: bool,
}

/// The loaded set of providers plus the current `capture_mode`
/// (Glossary: "Provider registry").
#[derive(Debug)]
pub struct Registry {
	providers: HashMap<Strng, Arc<ProviderDefinition>>,
	domain_index: HashMap<String, Strng>,
	capture_mode: CaptureMode,
}

impl Registry {
	/// O(1) hash lookup on the lower-cased host. The `capture_mode`
	/// distinction between "no interception" and "intercept as unknown"
	/// is folded in here rather than left to callers, matching the
	/// registry invariant in spec.md §3 directly.
	pub fn resolve(&self, host: &str) -> Resolution {
		let host = host.to_ascii_lowercase();
		match self.domain_index.get(&host) {
			Some(id) => Resolution::Known(id.clone()),
			None => match self.capture_mode {
				CaptureMode::CaptureAll => Resolution::Unknown,
				CaptureMode::KnownOnly => Resolution::None,
			},
		}
	}

	pub fn get(&self, id: &str) -> Option<Arc<ProviderDefinition>> {
		self.providers.get(id).cloned()
	}

	pub fn capture_mode(&self) -> CaptureMode {
		self.capture_mode
	}

	pub fn provider_ids(&self) -> impl Iterator<Item = &Strng> {
		self.providers.keys()
	}
}

/// Atomic-pointer-swap holder for the live registry (spec.md §4.1
/// `reload()`, §5 "immutable snapshot behind an atomic pointer"). In-
/// flight flows that already loaded a pointer keep using it; `reload`
/// only affects flows that look it up afterwards.
pub struct SharedRegistry(ArcSwap<Registry>);

impl SharedRegistry {
	pub fn new(initial: Registry) -> Self {
		SharedRegistry(ArcSwap::new(Arc::new(initial)))
	}

	pub fn load(&self) -> Arc<Registry> {
		self.0.load_full()
	}

	pub fn store(&self, new: Registry) {
		self.0.store(Arc::new(new));
	}
}

/// Reads the primary and override config files, deep-merges, validates,
/// and compiles into a [`Registry`]. On any error the previous snapshot
/// must keep serving — this function has no side effect on a running
/// `SharedRegistry`; the caller decides whether/when to `store` the
/// result (see `control::reload`).
pub fn load(primary_path: &FsPath, override_path: Option<&FsPath>) -> Result<Registry, ErrConfig> {
	let primary = read_json(primary_path)?;
	let merged = match override_path {
		Some(p) if p.exists() => {
			let over = read_json(p)?;
			let mut merged = primary;
			deep_merge(&mut merged, over);
			merged
		},
		_ => primary,
	};
	let raw: RawConfig = serde_json::from_value(merged).map_err(|e| ErrConfig::Json {
		path: primary_path.display().to_string(),
		source: e,
	})?;
	compile(raw)
}

/// Builds a [`Registry`] directly from parsed config, bypassing file I/O.
/// Used by tests and by the built-in catalog (`registry::builtin`).
pub fn from_raw(raw: RawConfig) -> Result<Registry, ErrConfig> {
	compile(raw)
}

fn read_json(path: &FsPath) -> Result<Value, ErrConfig> {
	let text = std::fs::read_to_string(path).map_err(|e| ErrConfig::Io {
		path: path.display().to_string(),
		source: e,
	})?;
	serde_json::from_str(&text).map_err(|e| ErrConfig::Json {
		path: path.display().to_string(),
		source: e,
	})
}

/// Override wins per leaf; arrays are replaced wholesale, not merged
/// element-wise (spec.md §6). Grounded on the teacher's `serdes.rs`
/// YAML-via-JSON transcode path, which relies on the same `serde_json::
/// Value` merge shape for config layering.
fn deep_merge(base: &mut Value, over: Value) {
	match (base, over) {
		(Value::Object(base_map), Value::Object(over_map)) => {
			for (k, v) in over_map {
				match base_map.get_mut(&k) {
					Some(existing) => deep_merge(existing, v),
					None => {
						base_map.insert(k, v);
					},
				}
			}
		},
		(base, over) => *base = over,
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawConfig {
	#[serde(default)]
	pub capture_mode: CaptureMode,
	#[serde(default)]
	pub providers: Vec<RawProvider>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawProvider {
	pub id: String,
	pub domains: Vec<String>,
	pub request: RawRequest,
	pub response: RawResponse,
	#[serde(default)]
	pub metadata: RawMetadata,
	#[serde(default)]
	pub capture_full_request: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawRequest {
	pub model_path: String,
	pub messages_path: String,
	#[serde(default)]
	pub system_path: Option<String>,
	#[serde(default)]
	pub tools_path: Option<String>,
	#[serde(default)]
	pub text_fields: Vec<String>,
	#[serde(default)]
	pub session_id_path: Option<String>,
	#[serde(default)]
	pub thinking_path: Option<String>,
	#[serde(default)]
	pub metadata_path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawResponse {
	#[serde(default)]
	pub json: Option<RawResponseJson>,
	#[serde(default)]
	pub sse: Option<RawResponseSse>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawResponseJson {
	#[serde(default)]
	pub input_tokens_path: Vec<String>,
	#[serde(default)]
	pub output_tokens_path: Vec<String>,
	#[serde(default)]
	pub cache_creation_tokens_path: Vec<String>,
	#[serde(default)]
	pub cache_read_tokens_path: Vec<String>,
	#[serde(default)]
	pub model_path: Vec<String>,
	#[serde(default)]
	pub stop_reason_path: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawResponseSse {
	#[serde(default)]
	pub event_types: Vec<String>,
	pub input_tokens_event: String,
	pub input_tokens_path: String,
	pub output_tokens_event: String,
	pub output_tokens_path: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMetadata {
	#[serde(default)]
	pub tags: Vec<String>,
	pub cost_per_input_token: Option<f64>,
	pub cost_per_output_token: Option<f64>,
}

fn compile(raw: RawConfig) -> Result<Registry, ErrConfig> {
	let mut providers = HashMap::new();
	let mut domain_index: HashMap<String, Strng> = HashMap::new();

	for p in raw.providers {
		let id = strng(&p.id);

		if p.response.json.is_none() && p.response.sse.is_none() {
			return Err(ErrConfig::InvalidProvider {
				id: p.id.clone(),
				reason: "at least one of response.json or response.sse must be present".into(),
			});
		}

		for domain in &p.domains {
			let lower = domain.to_ascii_lowercase();
			if let Some(existing) = domain_index.get(&lower) {
				return Err(ErrConfig::DuplicateDomain {
					domain: lower,
					first: existing.to_string(),
					second: p.id.clone(),
				});
			}
			domain_index.insert(lower, id.clone());
		}

		let request = RequestPaths {
			model_path: Path::parse(&p.request.model_path)?,
			messages_path: Path::parse(&p.request.messages_path)?,
			system_path: p.request.system_path.as_deref().map(Path::parse).transpose()?,
			tools_path: p.request.tools_path.as_deref().map(Path::parse).transpose()?,
			text_fields: p
				.request
				.text_fields
				.iter()
				.map(|e| Path::parse(e))
				.collect::<Result<_, _>>()?,
			session_id_path: p.request.session_id_path.as_deref().map(Path::parse).transpose()?,
			thinking_path: p.request.thinking_path.as_deref().map(Path::parse).transpose()?,
			metadata_path: p.request.metadata_path.as_deref().map(Path::parse).transpose()?,
		};

		let response_json = p
			.response
			.json
			.map(|j| compile_response_json(&p.id, j))
			.transpose()?;
		let response_sse = p
			.response
			.sse
			.map(|s| compile_response_sse(s))
			.transpose()?;

		let def = ProviderDefinition {
			id: id.clone(),
			domains: p.domains.iter().map(|d| d.to_ascii_lowercase()).collect(),
			request,
			response_json,
			response_sse,
			metadata: Metadata {
				tags: p.metadata.tags,
				cost_per_input_token: p.metadata.cost_per_input_token,
				cost_per_output_token: p.metadata.cost_per_output_token,
			},
			capture_full_request: p.capture_full_request,
		};

		if providers.insert(id.clone(), Arc::new(def)).is_some() {
			return Err(ErrConfig::InvalidProvider {
				id: p.id,
				reason: "duplicate provider id".into(),
			});
		}
	}

	Ok(Registry {
		providers,
		domain_index,
		capture_mode: raw.capture_mode,
	})
}

fn compile_response_json(provider_id: &str, raw: RawResponseJson) -> Result<ResponseJson, ErrConfig> {
	let compile_opt = |exprs: &[String]| -> Result<Option<AlternatesPath>, ErrConfig> {
		if exprs.is_empty() {
			Ok(None)
		} else {
			Ok(Some(AlternatesPath::compile(exprs)?))
		}
	};
	let _ = provider_id;
	Ok(ResponseJson {
		input_tokens_path: compile_opt(&raw.input_tokens_path)?,
		output_tokens_path: compile_opt(&raw.output_tokens_path)?,
		cache_creation_tokens_path: compile_opt(&raw.cache_creation_tokens_path)?,
		cache_read_tokens_path: compile_opt(&raw.cache_read_tokens_path)?,
		model_path: compile_opt(&raw.model_path)?,
		stop_reason_path: compile_opt(&raw.stop_reason_path)?,
	})
}

fn compile_response_sse(raw: RawResponseSse) -> Result<ResponseSse, ErrConfig> {
	Ok(ResponseSse {
		event_types: raw.event_types,
		input_tokens_event: raw.input_tokens_event,
		input_tokens_path: Path::parse(&raw.input_tokens_path)?,
		output_tokens_event: raw.output_tokens_event,
		output_tokens_path: Path::parse(&raw.output_tokens_path)?,
	})
}

/// Built-in default provider catalog (Anthropic, OpenAI, Gemini,
/// Bedrock), recovered from the teacher's `llm::{anthropic,openai,
/// gemini,bedrock}` wire-shape knowledge — SPEC_FULL.md §"C1": a sidecar
/// shipping with an empty registry would be useless out of the box.
/// This is the "primary (package-bundled)" layer referenced in spec.md
/// §6; operators layer an override document on top of it.
pub mod builtin {
	use super::*;

	pub fn catalog_json() -> Value {
		serde_json::json!({
			"capture_mode": "known_only",
			"providers": [
				{
					"id": "anthropic",
					"domains": ["api.anthropic.com"],
					"request": {
						"model_path": "$.model",
						"messages_path": "$.messages",
						"system_path": "$.system",
						"tools_path": "$.tools",
						"text_fields": ["$.messages[*].content[*].text"],
						"session_id_path": "$.metadata.session_id",
						"thinking_path": "$.thinking",
						"metadata_path": "$.metadata"
					},
					"response": {
						"json": {
							"input_tokens_path": ["$.usage.input_tokens"],
							"output_tokens_path": ["$.usage.output_tokens"],
							"cache_creation_tokens_path": ["$.usage.cache_creation_input_tokens"],
							"cache_read_tokens_path": ["$.usage.cache_read_input_tokens"],
							"model_path": ["$.model"],
							"stop_reason_path": ["$.stop_reason"]
						},
						"sse": {
							"event_types": ["message_start", "message_delta", "message_stop"],
							"input_tokens_event": "message_start",
							"input_tokens_path": "$.message.usage.input_tokens",
							"output_tokens_event": "message_delta",
							"output_tokens_path": "$.usage.output_tokens"
						}
					},
					"metadata": {"tags": ["anthropic"]}
				},
				{
					"id": "openai",
					"domains": ["api.openai.com"],
					"request": {
						"model_path": "$.model",
						"messages_path": "$.messages",
						"tools_path": "$.tools",
						"text_fields": ["$.messages[*].content"],
						"metadata_path": "$.metadata"
					},
					"response": {
						"json": {
							"input_tokens_path": ["$.usage.prompt_tokens"],
							"output_tokens_path": ["$.usage.completion_tokens"],
							"cache_read_tokens_path": ["$.usage.prompt_tokens_details.cached_tokens"],
							"model_path": ["$.model"],
							"stop_reason_path": ["$.choices[0].finish_reason"]
						},
						"sse": {
							"event_types": ["chunk"],
							"input_tokens_event": "chunk",
							"input_tokens_path": "$.usage.prompt_tokens",
							"output_tokens_event": "chunk",
							"output_tokens_path": "$.usage.completion_tokens"
						}
					},
					"metadata": {"tags": ["openai"]}
				},
				{
					"id": "gemini",
					"domains": ["generativelanguage.googleapis.com"],
					"request": {
						"model_path": "$.model",
						"messages_path": "$.contents",
						"system_path": "$.systemInstruction",
						"tools_path": "$.tools",
						"text_fields": ["$.contents[*].parts[*].text"]
					},
					"response": {
						"json": {
							"input_tokens_path": ["$.usageMetadata.promptTokenCount"],
							"output_tokens_path": ["$.usageMetadata.candidatesTokenCount"],
							"cache_read_tokens_path": ["$.usageMetadata.cachedContentTokenCount"],
							"model_path": ["$.modelVersion"],
							"stop_reason_path": ["$.candidates[0].finishReason"]
						}
					},
					"metadata": {"tags": ["gemini"]}
				},
				{
					"id": "bedrock",
					"domains": ["bedrock-runtime.us-east-1.amazonaws.com"],
					"request": {
						"model_path": "$.modelId",
						"messages_path": "$.messages",
						"system_path": "$.system",
						"text_fields": ["$.messages[*].content[*].text"]
					},
					"response": {
						"json": {
							"input_tokens_path": ["$.usage.inputTokens"],
							"output_tokens_path": ["$.usage.outputTokens"],
							"stop_reason_path": ["$.stopReason"]
						},
						"sse": {
							"event_types": ["metadata"],
							"input_tokens_event": "metadata",
							"input_tokens_path": "$.usage.inputTokens",
							"output_tokens_event": "metadata",
							"output_tokens_path": "$.usage.outputTokens"
						}
					},
					"metadata": {"tags": ["bedrock"]}
				}
			]
		})
	}

	pub fn catalog() -> Registry {
		let raw: RawConfig = serde_json::from_value(catalog_json()).expect("built-in catalog is valid");
		compile(raw).expect("built-in catalog compiles")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn builtin_catalog_compiles_and_resolves_known_hosts() {
		let reg = builtin::catalog();
		assert_eq!(
			reg.resolve("api.anthropic.com"),
			Resolution::Known(strng("anthropic"))
		);
		assert_eq!(
			reg.resolve("API.ANTHROPIC.COM"),
			Resolution::Known(strng("anthropic")),
			"host lookup must be case-insensitive"
		);
	}

	#[test]
	fn unknown_host_is_none_under_known_only() {
		let reg = builtin::catalog();
		assert_eq!(reg.resolve("api.novel.example"), Resolution::None);
	}

	#[test]
	fn unknown_host_is_unknown_under_capture_all() {
		let mut raw: RawConfig = serde_json::from_value(builtin::catalog_json()).unwrap();
		raw.capture_mode = CaptureMode::CaptureAll;
		let reg = compile(raw).unwrap();
		assert_eq!(reg.resolve("api.novel.example"), Resolution::Unknown);
	}

	#[test]
	fn duplicate_domain_across_providers_is_rejected() {
		let mut json = builtin::catalog_json();
		json["providers"][1]["domains"] = serde_json::json!(["api.anthropic.com"]);
		let raw: RawConfig = serde_json::from_value(json).unwrap();
		assert!(matches!(compile(raw), Err(ErrConfig::DuplicateDomain { .. })));
	}

	#[test]
	fn provider_without_any_response_shape_is_rejected() {
		let mut json = builtin::catalog_json();
		json["providers"][0]["response"] = serde_json::json!({});
		let raw: RawConfig = serde_json::from_value(json).unwrap();
		assert!(matches!(compile(raw), Err(ErrConfig::InvalidProvider { .. })));
	}

	#[test]
	fn deep_merge_overrides_leaves_and_replaces_arrays_wholesale() {
		let mut base = serde_json::json!({"a": {"b": 1, "c": [1, 2]}, "d": "keep"});
		let over = serde_json::json!({"a": {"b": 2, "c": [9]}});
		deep_merge(&mut base, over);
		assert_eq!(base["a"]["b"], 2);
		assert_eq!(base["a"]["c"], serde_json::json!([9]));
		assert_eq!(base["d"], "keep");
	}

	#[test]
	fn reload_swaps_snapshot_atomically_old_readers_unaffected() {
		let shared = SharedRegistry::new(builtin::catalog());
		let held = shared.load();
		assert!(held.get("anthropic").is_some());

		let mut raw: RawConfig = serde_json::from_value(builtin::catalog_json()).unwrap();
		raw.providers.retain(|p| p.id != "anthropic");
		shared.store(compile(raw).unwrap());

		assert!(held.get("anthropic").is_some(), "old snapshot must stay intact");
		assert!(
			shared.load().get("anthropic").is_none(),
			"new loads must see the reloaded snapshot"
		);
	}
}
