//! The persisted `Event` record (spec.md §3) and the assembly step that
//! builds one from a finished flow (spec.md §4.4 step 3: "Assemble
//! Event; redact message content unless capture_full").

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::context::RequestContext;
use crate::extract::{RequestDigest, UsageDelta};
use crate::registry::{CaptureMode, Metadata};
use crate::Strng;

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct EventContext {
	pub program: Option<String>,
	pub project: Option<String>,
	pub session: Option<String>,
	pub tags: Vec<String>,
	pub custom: BTreeMap<String, Value>,
}

impl From<RequestContext> for EventContext {
	fn from(c: RequestContext) -> Self {
		EventContext {
			program: c.program,
			project: c.project,
			session: c.session,
			tags: c.tags,
			custom: c.custom,
		}
	}
}

/// The persisted record (spec.md §3 "Event"). `total_tokens = input +
/// output` always holds (cache counts never contribute, per the
/// invariant in §3) — there is no setter that could violate it; it is
/// computed in [`assemble`].
#[derive(Debug, Clone, Serialize)]
pub struct Event {
	pub timestamp: DateTime<Utc>,
	pub duration_ms: u64,
	pub provider_id: Strng,
	pub model: Option<String>,
	pub input_tokens: u64,
	pub output_tokens: u64,
	pub total_tokens: u64,
	pub cache_creation_tokens: u64,
	pub cache_read_tokens: u64,
	pub response_status: u16,
	pub streaming: bool,
	pub client_type: Option<String>,
	pub device_id: Strng,
	pub is_token_consuming: bool,
	pub has_budget_tokens: bool,
	pub estimated_cost: Option<f64>,
	pub capture_mode: CaptureMode,
	pub context: EventContext,
	pub program: Option<String>,
	pub project: Option<String>,
	pub messages: Option<Vec<Value>>,
	pub system: Option<Vec<Value>>,
	pub tools: Option<Vec<Value>>,
	pub thinking: Option<Value>,
	pub request_metadata: Option<Value>,
	pub raw_request: Option<String>,
	pub raw_response: Option<String>,
	pub truncated: bool,
}

/// Everything [`assemble`] needs, gathered from `FlowState` plus the
/// (possibly legacy-fallback) extraction results. Grouped into one
/// struct rather than a long parameter list, matching the teacher's
/// `telemetry::log::RequestLog` shape (one struct assembled once per
/// flow and handed to the sink).
pub struct EventInputs<'a> {
	pub started_at: DateTime<Utc>,
	pub duration_ms: u64,
	pub provider_id: Strng,
	pub usage: &'a UsageDelta,
	pub digest: &'a RequestDigest,
	pub response_status: u16,
	pub streaming: bool,
	pub client_type: Option<String>,
	pub device_id: Strng,
	pub has_budget_tokens: bool,
	pub path_matches_llm_pattern: bool,
	pub capture_mode: CaptureMode,
	pub context: RequestContext,
	pub metadata: Option<&'a Metadata>,
	pub capture_full: bool,
	pub raw_request: Option<Vec<u8>>,
	pub raw_response: Option<Vec<u8>>,
	pub truncated: bool,
}

pub fn assemble(inputs: EventInputs<'_>) -> Event {
	let EventInputs {
		started_at,
		duration_ms,
		provider_id,
		usage,
		digest,
		response_status,
		streaming,
		client_type,
		device_id,
		has_budget_tokens,
		path_matches_llm_pattern,
		capture_mode,
		context,
		metadata,
		capture_full,
		raw_request,
		raw_response,
		truncated,
	} = inputs;

	let has_messages = digest.messages.as_ref().is_some_and(|m| !m.is_empty());
	let is_token_consuming = has_messages || has_budget_tokens || path_matches_llm_pattern;

	let estimated_cost = metadata.and_then(|m| {
		let input_rate = m.cost_per_input_token?;
		let output_rate = m.cost_per_output_token?;
		Some(input_rate * usage.input_tokens as f64 + output_rate * usage.output_tokens as f64)
	});

	let messages = digest.messages.clone().map(|msgs| {
		if capture_full {
			msgs
		} else {
			msgs.into_iter().map(redact_message).collect()
		}
	});

	let model = usage.model.clone().or_else(|| digest.model.clone());
	let event_context: EventContext = context.clone().into();

	Event {
		timestamp: started_at,
		duration_ms,
		provider_id,
		model,
		input_tokens: usage.input_tokens,
		output_tokens: usage.output_tokens,
		total_tokens: usage.input_tokens + usage.output_tokens,
		cache_creation_tokens: usage.cache_creation_tokens,
		cache_read_tokens: usage.cache_read_tokens,
		response_status,
		streaming,
		client_type,
		device_id,
		is_token_consuming,
		has_budget_tokens,
		estimated_cost,
		capture_mode,
		program: event_context.program.clone(),
		project: event_context.project.clone(),
		context: event_context,
		messages,
		system: digest.system.clone(),
		tools: digest.tools.clone(),
		thinking: digest.thinking.clone(),
		request_metadata: digest.metadata.clone(),
		raw_request: capture_full.then(|| raw_request.map(lossy_utf8)).flatten(),
		raw_response: capture_full.then(|| raw_response.map(lossy_utf8)).flatten(),
		truncated,
	}
}

fn lossy_utf8(bytes: Vec<u8>) -> String {
	String::from_utf8_lossy(&bytes).into_owned()
}

/// Overwrites `content` with the literal string `[REDACTED]`, preserving
/// `role` and every other structural key (spec.md §3 invariant).
fn redact_message(mut message: Value) -> Value {
	if let Value::Object(map) = &mut message {
		if map.contains_key("content") {
			map.insert("content".to_string(), Value::String("[REDACTED]".to_string()));
		}
	}
	message
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn base_inputs<'a>(usage: &'a UsageDelta, digest: &'a RequestDigest) -> EventInputs<'a> {
		EventInputs {
			started_at: DateTime::<Utc>::from_timestamp(0, 0).unwrap(),
			duration_ms: 12,
			provider_id: crate::strng("anthropic"),
			usage,
			digest,
			response_status: 200,
			streaming: false,
			client_type: Some("claude-code".into()),
			device_id: crate::strng("device-1"),
			has_budget_tokens: false,
			path_matches_llm_pattern: false,
			capture_mode: CaptureMode::KnownOnly,
			context: RequestContext::default(),
			metadata: None,
			capture_full: false,
			raw_request: None,
			raw_response: None,
			truncated: false,
		}
	}

	#[test]
	fn total_tokens_invariant_holds() {
		let usage = UsageDelta {
			input_tokens: 3,
			output_tokens: 99,
			cache_creation_tokens: 0,
			cache_read_tokens: 54624,
			model: None,
			stop_reason: None,
		};
		let digest = RequestDigest::default();
		let event = assemble(base_inputs(&usage, &digest));
		assert_eq!(event.total_tokens, 102);
		assert_eq!(event.cache_read_tokens, 54624, "cache counts must not contribute to total");
	}

	#[test]
	fn redaction_replaces_content_but_keeps_role_and_shape() {
		let usage = UsageDelta::default();
		let mut digest = RequestDigest::default();
		digest.messages = Some(vec![json!({"role": "user", "content": "secret stuff"})]);
		let event = assemble(base_inputs(&usage, &digest));
		let msgs = event.messages.unwrap();
		assert_eq!(msgs[0]["role"], "user");
		assert_eq!(msgs[0]["content"], "[REDACTED]");
	}

	#[test]
	fn thinking_and_metadata_carry_through_from_digest() {
		let usage = UsageDelta::default();
		let mut digest = RequestDigest::default();
		digest.thinking = Some(json!({"type": "enabled", "budget_tokens": 1024}));
		digest.metadata = Some(json!({"user_id": "abc123"}));
		let event = assemble(base_inputs(&usage, &digest));
		assert_eq!(event.thinking, Some(json!({"type": "enabled", "budget_tokens": 1024})));
		assert_eq!(event.request_metadata, Some(json!({"user_id": "abc123"})));
	}

	#[test]
	fn capture_full_preserves_message_content() {
		let usage = UsageDelta::default();
		let mut digest = RequestDigest::default();
		digest.messages = Some(vec![json!({"role": "user", "content": "secret stuff"})]);
		let mut inputs = base_inputs(&usage, &digest);
		inputs.capture_full = true;
		let event = assemble(inputs);
		assert_eq!(event.messages.unwrap()[0]["content"], "secret stuff");
	}

	#[test]
	fn empty_messages_array_is_token_consuming_depends_on_budget_or_path() {
		let usage = UsageDelta::default();
		let mut digest = RequestDigest::default();
		digest.messages = Some(vec![]);
		let event = assemble(base_inputs(&usage, &digest));
		assert!(!event.is_token_consuming);

		let mut inputs = base_inputs(&usage, &digest);
		inputs.has_budget_tokens = true;
		assert!(assemble(inputs).is_token_consuming);
	}

	#[test]
	fn estimated_cost_computed_from_metadata_rates() {
		let usage = UsageDelta {
			input_tokens: 100,
			output_tokens: 50,
			..Default::default()
		};
		let digest = RequestDigest::default();
		let metadata = Metadata {
			tags: vec![],
			cost_per_input_token: Some(0.001),
			cost_per_output_token: Some(0.002),
		};
		let mut inputs = base_inputs(&usage, &digest);
		inputs.metadata = Some(&metadata);
		let event = assemble(inputs);
		assert!((event.estimated_cost.unwrap() - 0.2).abs() < 1e-9);
	}

	#[test]
	fn no_metadata_rates_leaves_cost_none() {
		let usage = UsageDelta::default();
		let digest = RequestDigest::default();
		let event = assemble(base_inputs(&usage, &digest));
		assert!(event.estimated_cost.is_none());
	}
}
