//! Context & Device Resolver (C5, spec.md §4.5).
//!
//! Two independent resolutions: free-form context (program/project/
//! session/tags/custom) for grouping events in the dashboard, and a
//! stable device id for per-device rollups. Both are pure functions over
//! headers/env/body — no I/O, no shared state, safe to call on every
//! flow's hot path.

use std::collections::BTreeMap;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::fieldpath::Path;
use crate::Strng;

/// `{program, project, session, tags, custom}` (spec.md §3 `FlowState.
/// context`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestContext {
	pub program: Option<String>,
	pub project: Option<String>,
	pub session: Option<String>,
	pub tags: Vec<String>,
	pub custom: BTreeMap<String, Value>,
}

/// Precedence, first non-empty wins *per field* (spec.md §4.5): the
/// `X-Tokentap-Context` header is a full merge source tried first, then
/// individual headers, then environment, then user-agent inference.
/// Fields are resolved independently — a request can get `program` from
/// the context header and `project` from an individual header.
pub fn resolve_context(
	context_header: Option<&str>,
	program_header: Option<&str>,
	project_header: Option<&str>,
	session_header: Option<&str>,
	env: &dyn Fn(&str) -> Option<String>,
	user_agent: Option<&str>,
) -> RequestContext {
	let mut ctx = RequestContext::default();

	let from_header: Option<RequestContext> = context_header.and_then(|raw| serde_json::from_str::<Value>(raw).ok()).map(context_from_value);
	let from_env_context: Option<RequestContext> = env("TOKENTAP_CONTEXT")
		.and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
		.map(context_from_value);

	let pick = |sources: &[Option<&str>]| -> Option<String> {
		sources.iter().flatten().find(|s| !s.is_empty()).map(|s| s.to_string())
	};

	ctx.program = from_header.as_ref().and_then(|c| c.program.clone()).or_else(|| pick(&[program_header])).or_else(|| env("TOKENTAP_PROGRAM")).or_else(|| from_env_context.as_ref().and_then(|c| c.program.clone())).or_else(|| user_agent.map(client_type_from_user_agent));

	ctx.project = from_header.as_ref().and_then(|c| c.project.clone()).or_else(|| pick(&[project_header])).or_else(|| env("TOKENTAP_PROJECT")).or_else(|| from_env_context.as_ref().and_then(|c| c.project.clone()));

	ctx.session = from_header.as_ref().and_then(|c| c.session.clone()).or_else(|| pick(&[session_header])).or_else(|| env("TOKENTAP_SESSION")).or_else(|| from_env_context.as_ref().and_then(|c| c.session.clone()));

	ctx.tags = from_header.as_ref().map(|c| c.tags.clone()).filter(|t| !t.is_empty()).or_else(|| from_env_context.as_ref().map(|c| c.tags.clone())).unwrap_or_default();

	ctx.custom = from_header.map(|c| c.custom).or_else(|| from_env_context.map(|c| c.custom)).unwrap_or_default();

	ctx
}

fn context_from_value(v: Value) -> RequestContext {
	let Value::Object(map) = v else {
		return RequestContext::default();
	};
	let get_str = |k: &str| map.get(k).and_then(Value::as_str).map(str::to_string);
	let tags = map
		.get("tags")
		.and_then(Value::as_array)
		.map(|a| a.iter().filter_map(|t| t.as_str().map(str::to_string)).collect())
		.unwrap_or_default();
	let custom = map
		.get("custom")
		.and_then(Value::as_object)
		.map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
		.unwrap_or_default();
	RequestContext {
		program: get_str("program"),
		project: get_str("project"),
		session: get_str("session"),
		tags,
		custom,
	}
}

/// Tokens recognised in the user-agent for `program` inference (spec.md
/// §4.5): `claude-code`, `kiro-cli`, `codex`, `gemini-cli`, else
/// `generic`.
pub fn client_type_from_user_agent(user_agent: &str) -> String {
	let ua = user_agent.to_ascii_lowercase();
	const KNOWN: &[&str] = &["claude-code", "kiro-cli", "codex", "gemini-cli"];
	for token in KNOWN {
		if ua.contains(token) {
			return (*token).to_string();
		}
	}
	"generic".to_string()
}

/// Device id resolution priority (spec.md §4.5):
/// 1. `session_id` at a provider-declared path in the request body.
/// 2. `device_id` from a telemetry payload at a provider-declared path.
/// 3. Fingerprint: SHA-256(first 16 bytes, hex) of
///    `client_ip || os_token || user_agent_token`.
pub fn resolve_device_id(
	request_body: Option<&Value>,
	session_id_path: Option<&Path>,
	telemetry_body: Option<&Value>,
	device_id_path: Option<&Path>,
	client_ip: &str,
	user_agent: Option<&str>,
) -> Strng {
	if let (Some(doc), Some(path)) = (request_body, session_id_path) {
		if let Some(id) = path.evaluate(doc).single().and_then(Value::as_str) {
			if !id.is_empty() {
				return crate::strng(id);
			}
		}
	}
	if let (Some(doc), Some(path)) = (telemetry_body, device_id_path) {
		if let Some(id) = path.evaluate(doc).single().and_then(Value::as_str) {
			if !id.is_empty() {
				return crate::strng(id);
			}
		}
	}
	crate::strng(fingerprint(client_ip, user_agent))
}

fn fingerprint(client_ip: &str, user_agent: Option<&str>) -> String {
	let os_token = user_agent.map(os_token_from_user_agent).unwrap_or_else(|| "other".to_string());
	let ua_token = user_agent.unwrap_or("");
	let mut hasher = Sha256::new();
	hasher.update(client_ip.as_bytes());
	hasher.update(b"||");
	hasher.update(os_token.as_bytes());
	hasher.update(b"||");
	hasher.update(ua_token.as_bytes());
	let digest = hasher.finalize();
	hex::encode(&digest[..16])
}

fn os_token_from_user_agent(ua: &str) -> String {
	let lower = ua.to_ascii_lowercase();
	if lower.contains("windows") {
		"windows".to_string()
	} else if lower.contains("mac os") || lower.contains("macos") || lower.contains("darwin") {
		"macos".to_string()
	} else if lower.contains("linux") {
		"linux".to_string()
	} else {
		"other".to_string()
	}
}
