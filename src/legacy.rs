//! Builtin legacy extractors (spec.md §4.3, §9: "Legacy fallback").
//!
//! Declarative field-path extraction is the primary mechanism (C2); this
//! module is the compiled-in fallback invoked only when the quality
//! check (`flow::quality_check`) flags the declarative result as
//! degraded. Modelled as `Extractor = Declarative(ProviderDefinition) |
//! Builtin(ProviderId)` (spec.md §9) — a sum type, not a class hierarchy
//! (spec.md §9 "Dynamic dispatch on provider").
//!
//! Each builtin routine hardcodes one provider's wire shape, grounded on
//! the teacher's per-provider type definitions (`llm/anthropic.rs`,
//! `llm/openai.rs`, `llm/bedrock.rs`) — simplified here to usage/shape
//! extraction only, since tokentap never rewrites a request for
//! cross-provider translation the way the teacher's proxy does.

use serde::Deserialize;
use serde_json::Value;

use crate::extract::{RequestDigest, UsageDelta};
use crate::registry::ProviderDefinition;
use crate::Strng;
use std::sync::Arc;

/// The extraction strategy selected for one flow (spec.md §9): a sum
/// type, not a class hierarchy — dynamic dispatch on provider is a value
/// of `ProviderDefinition` plus a registry of builtin routines indexed by
/// `provider_id`, never an inheritance chain.
pub enum Extractor {
	Declarative(Arc<ProviderDefinition>),
	Builtin(Strng),
}

impl Extractor {
	/// Runs whichever strategy this value names. `Builtin` falls back to
	/// an empty digest when `provider_id` has no compiled-in routine — a
	/// provider with no builtin counterpart simply has no fallback to
	/// degrade into.
	pub fn extract_request(&self, doc: &Value) -> RequestDigest {
		match self {
			Extractor::Declarative(def) => crate::extract::extract_request(def, doc),
			Extractor::Builtin(provider_id) => for_provider(provider_id).map(|e| e.extract_request(doc)).unwrap_or_default(),
		}
	}

	/// Usage re-extraction only makes sense for `Builtin` — the
	/// `Declarative` case already has its usage from
	/// `extract::extract_response_json`, which needs diagnostics/
	/// provider-id context this sum type doesn't carry.
	pub fn extract_usage(&self, doc: &Value) -> Option<UsageDelta> {
		match self {
			Extractor::Declarative(_) => None,
			Extractor::Builtin(provider_id) => for_provider(provider_id).map(|e| e.extract_usage(doc)),
		}
	}
}

/// The controller's deterministic selection rule (spec.md §9: "the
/// controller selects the next extractor deterministically... exactly one
/// fallback attempt per flow"): stay declarative unless the quality check
/// flagged this flow degraded, in which case switch to the builtin
/// routine for this provider, if one exists.
pub fn select(provider_id: &Strng, declarative: Option<&Arc<ProviderDefinition>>, degraded: bool) -> Extractor {
	if !degraded {
		if let Some(def) = declarative {
			return Extractor::Declarative(def.clone());
		}
	}
	Extractor::Builtin(provider_id.clone())
}

pub trait LegacyExtractor: Send + Sync {
	fn extract_request(&self, doc: &Value) -> RequestDigest;
	fn extract_usage(&self, doc: &Value) -> UsageDelta;
}

/// Looks up the compiled-in routine for `provider_id`. Providers with no
/// known legacy routine fall back to an empty digest/usage — a provider
/// configured purely through the declarative path with no builtin
/// counterpart simply has no fallback to degrade into.
pub fn for_provider(provider_id: &str) -> Option<Arc<dyn LegacyExtractor>> {
	match provider_id {
		"anthropic" => Some(Arc::new(AnthropicLegacy)),
		"openai" => Some(Arc::new(OpenAiLegacy)),
		"bedrock" => Some(Arc::new(BedrockLegacy)),
		_ => None,
	}
}

pub struct AnthropicLegacy;

#[derive(Debug, Default, Deserialize)]
struct AnthropicRequest {
	model: Option<String>,
	#[serde(default)]
	messages: Vec<Value>,
	system: Option<Value>,
	#[serde(default)]
	tools: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
	#[serde(default)]
	input_tokens: u64,
	#[serde(default)]
	output_tokens: u64,
	#[serde(default)]
	cache_creation_input_tokens: u64,
	#[serde(default)]
	cache_read_input_tokens: u64,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicResponse {
	model: Option<String>,
	stop_reason: Option<String>,
	#[serde(default)]
	usage: AnthropicUsage,
}

impl LegacyExtractor for AnthropicLegacy {
	fn extract_request(&self, doc: &Value) -> RequestDigest {
		let req: AnthropicRequest = serde_json::from_value(doc.clone()).unwrap_or_default();
		RequestDigest {
			model: req.model,
			messages: Some(req.messages),
			system: req.system.map(as_array_verbatim),
			tools: (!req.tools.is_empty()).then_some(req.tools),
			thinking: doc.get("thinking").cloned(),
			metadata: doc.get("metadata").cloned(),
			text_sample: String::new(),
		}
	}

	fn extract_usage(&self, doc: &Value) -> UsageDelta {
		let res: AnthropicResponse = serde_json::from_value(doc.clone()).unwrap_or_default();
		UsageDelta {
			input_tokens: res.usage.input_tokens,
			output_tokens: res.usage.output_tokens,
			cache_creation_tokens: res.usage.cache_creation_input_tokens,
			cache_read_tokens: res.usage.cache_read_input_tokens,
			model: res.model,
			stop_reason: res.stop_reason,
		}
	}
}

pub struct OpenAiLegacy;

#[derive(Debug, Default, Deserialize)]
struct OpenAiRequest {
	model: Option<String>,
	#[serde(default)]
	messages: Vec<Value>,
	#[serde(default)]
	tools: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiUsage {
	#[serde(default)]
	prompt_tokens: u64,
	#[serde(default)]
	completion_tokens: u64,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiChoice {
	finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiResponse {
	model: Option<String>,
	#[serde(default)]
	choices: Vec<OpenAiChoice>,
	#[serde(default)]
	usage: OpenAiUsage,
}

impl LegacyExtractor for OpenAiLegacy {
	fn extract_request(&self, doc: &Value) -> RequestDigest {
		let req: OpenAiRequest = serde_json::from_value(doc.clone()).unwrap_or_default();
		RequestDigest {
			model: req.model,
			messages: Some(req.messages),
			system: None,
			tools: (!req.tools.is_empty()).then_some(req.tools),
			thinking: None,
			metadata: doc.get("metadata").cloned(),
			text_sample: String::new(),
		}
	}

	fn extract_usage(&self, doc: &Value) -> UsageDelta {
		let res: OpenAiResponse = serde_json::from_value(doc.clone()).unwrap_or_default();
		UsageDelta {
			input_tokens: res.usage.prompt_tokens,
			output_tokens: res.usage.completion_tokens,
			cache_creation_tokens: 0,
			cache_read_tokens: 0,
			model: res.model,
			stop_reason: res.choices.into_iter().next().and_then(|c| c.finish_reason),
		}
	}
}

pub struct BedrockLegacy;

#[derive(Debug, Default, Deserialize)]
struct BedrockRequest {
	#[serde(rename = "modelId")]
	model_id: Option<String>,
	#[serde(default)]
	messages: Vec<Value>,
	system: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct BedrockUsage {
	#[serde(rename = "inputTokens", default)]
	input_tokens: u64,
	#[serde(rename = "outputTokens", default)]
	output_tokens: u64,
}

#[derive(Debug, Default, Deserialize)]
struct BedrockResponse {
	#[serde(rename = "stopReason")]
	stop_reason: Option<String>,
	#[serde(default)]
	usage: BedrockUsage,
}

impl LegacyExtractor for BedrockLegacy {
	fn extract_request(&self, doc: &Value) -> RequestDigest {
		let req: BedrockRequest = serde_json::from_value(doc.clone()).unwrap_or_default();
		RequestDigest {
			model: req.model_id,
			messages: Some(req.messages),
			system: req.system.map(as_array_verbatim),
			tools: None,
			thinking: None,
			metadata: doc.get("metadata").cloned(),
			text_sample: String::new(),
		}
	}

	fn extract_usage(&self, doc: &Value) -> UsageDelta {
		let res: BedrockResponse = serde_json::from_value(doc.clone()).unwrap_or_default();
		UsageDelta {
			input_tokens: res.usage.input_tokens,
			output_tokens: res.usage.output_tokens,
			cache_creation_tokens: 0,
			cache_read_tokens: 0,
			model: None,
			stop_reason: res.stop_reason,
		}
	}
}

/// `system` is sometimes a bare string, sometimes an array of content
/// blocks, on the wire — normalised to an array here the way the
/// declarative extractor does, without otherwise reshaping it.
fn as_array_verbatim(v: Value) -> Vec<Value> {
	match v {
		Value::Array(arr) => arr,
		other => vec![other],
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn anthropic_legacy_recovers_full_message_count() {
		let legacy = AnthropicLegacy;
		let messages: Vec<Value> = (0..12).map(|i| json!({"role": "user", "content": i})).collect();
		let doc = json!({"model": "claude", "messages": messages, "system": "be nice"});
		let digest = legacy.extract_request(&doc);
		assert_eq!(digest.messages.unwrap().len(), 12);
		assert_eq!(digest.system.unwrap(), vec![json!("be nice")]);
	}

	#[test]
	fn anthropic_legacy_recovers_thinking_and_metadata() {
		let legacy = AnthropicLegacy;
		let doc = json!({
			"model": "claude",
			"messages": [],
			"thinking": {"type": "enabled", "budget_tokens": 2048},
			"metadata": {"user_id": "xyz"}
		});
		let digest = legacy.extract_request(&doc);
		assert_eq!(digest.thinking.unwrap(), json!({"type": "enabled", "budget_tokens": 2048}));
		assert_eq!(digest.metadata.unwrap(), json!({"user_id": "xyz"}));
	}

	#[test]
	fn openai_legacy_recovers_metadata_but_not_thinking() {
		let legacy = OpenAiLegacy;
		let doc = json!({"model": "gpt-4", "messages": [], "metadata": {"user_id": "xyz"}});
		let digest = legacy.extract_request(&doc);
		assert!(digest.thinking.is_none());
		assert_eq!(digest.metadata.unwrap(), json!({"user_id": "xyz"}));
	}

	#[test]
	fn select_prefers_declarative_unless_degraded() {
		use crate::registry::builtin;
		let provider_id: Strng = Strng::from("anthropic");
		let def = builtin::catalog().get("anthropic").unwrap();
		assert!(matches!(select(&provider_id, Some(&def), false), Extractor::Declarative(_)));
		assert!(matches!(select(&provider_id, Some(&def), true), Extractor::Builtin(_)));
		assert!(matches!(select(&provider_id, None, false), Extractor::Builtin(_)));
	}

	#[test]
	fn anthropic_legacy_usage_matches_wire_fields() {
		let legacy = AnthropicLegacy;
		let doc = json!({
			"model": "claude",
			"stop_reason": "end_turn",
			"usage": {"input_tokens": 3, "output_tokens": 99, "cache_read_input_tokens": 54624}
		});
		let usage = legacy.extract_usage(&doc);
		assert_eq!(usage.input_tokens, 3);
		assert_eq!(usage.output_tokens, 99);
		assert_eq!(usage.cache_read_tokens, 54624);
		assert_eq!(usage.stop_reason.as_deref(), Some("end_turn"));
	}

	#[test]
	fn openai_legacy_usage_matches_wire_fields() {
		let legacy = OpenAiLegacy;
		let doc = json!({
			"model": "gpt-4",
			"choices": [{"finish_reason": "stop"}],
			"usage": {"prompt_tokens": 5, "completion_tokens": 7}
		});
		let usage = legacy.extract_usage(&doc);
		assert_eq!(usage.input_tokens, 5);
		assert_eq!(usage.output_tokens, 7);
		assert_eq!(usage.stop_reason.as_deref(), Some("stop"));
	}

	#[test]
	fn unrecognized_provider_has_no_legacy_routine() {
		assert!(for_provider("some-new-provider").is_none());
	}
}
