//! Extractor (C2, spec.md §4.2).
//!
//! Pure functions from `(ProviderDefinition, decoded document)` to
//! `RequestDigest` / `UsageDelta` (Glossary). Never raises on a shape
//! mismatch — missing fields become `None`/`0`, the only error kind
//! reachable from here is an upstream decode failure, which is the
//! caller's concern, not this module's.

use serde_json::Value;

use crate::diagnostics::Diagnostics;
use crate::fieldpath::Extracted;
use crate::registry::{AlternatesPath, ProviderDefinition};
use crate::Strng;

/// Default byte budget for `text_sample` (spec.md §4.2).
pub const DEFAULT_TEXT_SAMPLE_BUDGET: usize = 64 * 1024;

/// `{model, messages, system, tools, thinking, metadata, text_sample}`
/// (spec.md §4.2). `messages`/`system`/`tools` preserve the raw JSON
/// structure verbatim — no re-shaping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestDigest {
	pub model: Option<String>,
	pub messages: Option<Vec<Value>>,
	pub system: Option<Vec<Value>>,
	pub tools: Option<Vec<Value>>,
	pub thinking: Option<Value>,
	pub metadata: Option<Value>,
	pub text_sample: String,
}

/// Token-accounting quadruple plus optional `model`/`stop_reason`
/// (Glossary: "UsageDelta").
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageDelta {
	pub input_tokens: u64,
	pub output_tokens: u64,
	pub cache_creation_tokens: u64,
	pub cache_read_tokens: u64,
	pub model: Option<String>,
	pub stop_reason: Option<String>,
}

impl UsageDelta {
	pub fn total_tokens(&self) -> u64 {
		self.input_tokens + self.output_tokens
	}
}

pub fn extract_request(def: &ProviderDefinition, doc: &Value) -> RequestDigest {
	let model = def
		.request
		.model_path
		.evaluate(doc)
		.single()
		.and_then(value_as_string);

	let messages = extracted_to_array(def.request.messages_path.evaluate(doc));
	let system = def
		.request
		.system_path
		.as_ref()
		.and_then(|p| extracted_to_array(p.evaluate(doc)));
	let tools = def
		.request
		.tools_path
		.as_ref()
		.and_then(|p| extracted_to_array(p.evaluate(doc)));
	let thinking = def
		.request
		.thinking_path
		.as_ref()
		.and_then(|p| p.evaluate(doc).single())
		.cloned();
	let metadata = def
		.request
		.metadata_path
		.as_ref()
		.and_then(|p| p.evaluate(doc).single())
		.cloned();

	let mut text_sample = String::new();
	for field in &def.request.text_fields {
		for v in extracted_to_texts(field.evaluate(doc)) {
			text_sample.push_str(&v);
		}
	}
	truncate_utf8_safe(&mut text_sample, DEFAULT_TEXT_SAMPLE_BUDGET);

	RequestDigest {
		model,
		messages,
		system,
		tools,
		thinking,
		metadata,
		text_sample,
	}
}

pub fn extract_response_json(
	def: &ProviderDefinition,
	doc: &Value,
	diagnostics: &Diagnostics,
	provider_id: &Strng,
) -> UsageDelta {
	let Some(rj) = &def.response_json else {
		return UsageDelta::default();
	};

	let coerce = |path: &Option<AlternatesPath>, name: &str| -> u64 {
		let Some(path) = path else { return 0 };
		match path.evaluate(doc) {
			Extracted::Missing => 0,
			Extracted::List(_) => {
				diagnostics.warn_once(provider_id, name, "expected a scalar, found an array");
				0
			},
			Extracted::Value(v) => coerce_non_negative_int(v).unwrap_or_else(|| {
				diagnostics.warn_once(provider_id, name, "value was not a non-negative integer");
				0
			}),
		}
	};

	let coerce_str = |path: &Option<AlternatesPath>| -> Option<String> {
		path.as_ref()
			.and_then(|p| p.evaluate(doc).single())
			.and_then(value_as_string)
	};

	UsageDelta {
		input_tokens: coerce(&rj.input_tokens_path, "input_tokens_path"),
		output_tokens: coerce(&rj.output_tokens_path, "output_tokens_path"),
		cache_creation_tokens: coerce(&rj.cache_creation_tokens_path, "cache_creation_tokens_path"),
		cache_read_tokens: coerce(&rj.cache_read_tokens_path, "cache_read_tokens_path"),
		model: coerce_str(&rj.model_path),
		stop_reason: coerce_str(&rj.stop_reason_path),
	}
}

fn value_as_string(v: &Value) -> Option<String> {
	v.as_str().map(str::to_string)
}

/// Non-negative-integer coercion shared with the streaming accumulator
/// (spec.md §4.2: "values must be non-negative integers").
pub fn coerce_non_negative_int(v: &Value) -> Option<u64> {
	match v {
		Value::Number(n) => {
			if let Some(u) = n.as_u64() {
				Some(u)
			} else if let Some(i) = n.as_i64() {
				(i >= 0).then_some(i as u64)
			} else {
				None
			}
		},
		_ => None,
	}
}

/// Flattens either shape of [`Extracted`] into an owned `Vec<Value>`,
/// preserving structure verbatim (spec.md §4.2: "no re-shaping").
fn extracted_to_array(e: Extracted<'_>) -> Option<Vec<Value>> {
	match e {
		Extracted::Missing => None,
		Extracted::List(vs) => Some(vs.into_iter().cloned().collect()),
		Extracted::Value(v) => match v {
			Value::Array(arr) => Some(arr.clone()),
			other => Some(vec![other.clone()]),
		},
	}
}

fn extracted_to_texts(e: Extracted<'_>) -> Vec<String> {
	match e {
		Extracted::Missing => Vec::new(),
		Extracted::List(vs) => vs.into_iter().filter_map(|v| v.as_str()).map(str::to_string).collect(),
		Extracted::Value(v) => v.as_str().map(str::to_string).into_iter().collect(),
	}
}

/// Truncates `s` to at most `budget` bytes without splitting a UTF-8
/// codepoint. Naive byte slicing (`&s[..budget]`) panics or corrupts
/// text when `budget` lands mid-codepoint — a plain `String::len`
/// truncate is not safe here.
fn truncate_utf8_safe(s: &mut String, budget: usize) {
	if s.len() <= budget {
		return;
	}
	let mut cut = budget;
	while cut > 0 && !s.is_char_boundary(cut) {
		cut -= 1;
	}
	s.truncate(cut);
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::registry::builtin;
	use serde_json::json;

	fn anthropic() -> std::sync::Arc<ProviderDefinition> {
		builtin::catalog().get("anthropic").unwrap()
	}

	#[test]
	fn extracts_full_request_digest() {
		let def = anthropic();
		let doc = json!({
			"model": "claude-opus-4",
			"messages": [{"role": "user", "content": [{"type": "text", "text": "hi"}]}],
			"system": [{"type": "text", "text": "be nice"}],
			"tools": [{"name": "search"}],
			"thinking": {"type": "enabled", "budget_tokens": 1024},
			"metadata": {"user_id": "abc123"}
		});
		let digest = extract_request(&def, &doc);
		assert_eq!(digest.model.as_deref(), Some("claude-opus-4"));
		assert_eq!(digest.messages.unwrap().len(), 1);
		assert_eq!(digest.system.unwrap().len(), 1);
		assert_eq!(digest.tools.unwrap().len(), 1);
		assert_eq!(digest.thinking.unwrap(), json!({"type": "enabled", "budget_tokens": 1024}));
		assert_eq!(digest.metadata.unwrap(), json!({"user_id": "abc123"}));
		assert_eq!(digest.text_sample, "hi");
	}

	#[test]
	fn missing_request_fields_become_none() {
		let def = anthropic();
		let doc = json!({"model": "claude-opus-4", "messages": []});
		let digest = extract_request(&def, &doc);
		assert!(digest.system.is_none());
		assert!(digest.tools.is_none());
		assert!(digest.thinking.is_none());
		assert!(digest.metadata.is_none());
		assert_eq!(digest.messages, Some(vec![]));
	}

	#[test]
	fn usage_extraction_matches_scenario_one() {
		let def = anthropic();
		let diag = Diagnostics::new();
		let doc = json!({
			"usage": {"input_tokens": 3, "output_tokens": 99, "cache_read_input_tokens": 54624}
		});
		let usage = extract_response_json(&def, &doc, &diag, &def.id);
		assert_eq!(usage.input_tokens, 3);
		assert_eq!(usage.output_tokens, 99);
		assert_eq!(usage.cache_read_tokens, 54624);
		assert_eq!(usage.total_tokens(), 102);
	}

	#[test]
	fn negative_usage_value_is_treated_as_absent_and_logged_once() {
		let def = anthropic();
		let diag = Diagnostics::new();
		let doc = json!({"usage": {"input_tokens": -5, "output_tokens": 10}});
		let usage = extract_response_json(&def, &doc, &diag, &def.id);
		assert_eq!(usage.input_tokens, 0);
		assert_eq!(usage.output_tokens, 10);
		assert_eq!(diag.snapshot().sink_dropped, 0);
	}

	#[test]
	fn text_sample_truncation_is_utf8_safe() {
		let mut s = "a".repeat(10) + "é" + &"b".repeat(10);
		let original_len = s.len();
		truncate_utf8_safe(&mut s, 11);
		assert!(s.len() <= 11);
		assert!(s.is_char_boundary(s.len()));
		assert!(original_len > 11);
	}
}
