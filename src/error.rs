//! Typed error kinds for the tokentap pipeline (spec.md §7).
//!
//! Each kind maps to one failure domain. Outer wiring (`app.rs`,
//! `config.rs`) adds context with `anyhow`, matching the teacher's split
//! between typed inner errors and `anyhow::Context` at the call sites that
//! actually report to an operator.

use thiserror::Error;

/// Provider registry / config load failures. Construction-time only; a
/// registry that fails to load never replaces the previous snapshot.
#[derive(Debug, Error)]
pub enum ErrConfig {
	#[error("failed to read config file {path}: {source}")]
	Io {
		path: String,
		#[source]
		source: std::io::Error,
	},
	#[error("invalid json in {path}: {source}")]
	Json {
		path: String,
		#[source]
		source: serde_json::Error,
	},
	#[error("invalid field path `{expr}`: {reason}")]
	InvalidPath { expr: String, reason: String },
	#[error("provider `{id}`: {reason}")]
	InvalidProvider { id: String, reason: String },
	#[error("duplicate domain `{domain}` claimed by providers `{first}` and `{second}`")]
	DuplicateDomain {
		domain: String,
		first: String,
		second: String,
	},
}

/// Decode-layer failures: malformed SSE framing, non-UTF8 where UTF-8 was
/// required, truncated chunked event-stream frames.
#[derive(Debug, Error)]
pub enum ErrDecode {
	#[error("malformed sse frame: {0}")]
	Sse(String),
	#[error("malformed aws event-stream frame: {0}")]
	AwsEventStream(String),
	#[error("body was not valid utf-8")]
	NotUtf8,
}

/// Raised by the extractor on unrecoverable shape mismatches. Most
/// extraction failures are *not* errors (they're just `None`/degraded
/// quality) — this is reserved for the cases that should abort the hook
/// rather than degrade it.
#[derive(Debug, Error)]
pub enum ErrExtract {
	#[error("request body was not a json object")]
	NotJsonObject,
	#[error("builtin extractor `{provider}` does not recognize this wire shape")]
	UnrecognizedShape { provider: String },
}

/// Raised by the stream accumulator for conditions step() cannot recover
/// from locally (the outer tap still forwards bytes regardless).
#[derive(Debug, Error)]
pub enum ErrStream {
	#[error(transparent)]
	Decode(#[from] ErrDecode),
	#[error("stream accumulator invoked after DONE")]
	AlreadyDone,
}

/// Event sink failures, split into transient (retryable) and permanent
/// (drop immediately, count, move on) per spec.md §7.
#[derive(Debug, Error)]
pub enum ErrSink {
	#[error("transient store failure: {0}")]
	Transient(String),
	#[error("permanent store failure: {0}")]
	Permanent(String),
	#[error("sink queue is full")]
	QueueFull,
}

impl ErrSink {
	pub fn is_transient(&self) -> bool {
		matches!(self, ErrSink::Transient(_))
	}
}

/// Security-gate failures. These are startup-fatal by design (spec.md
/// §4.7) — a looser-than-expected token file permission or an unreadable
/// bind-mode state file must stop the process, not degrade silently.
#[derive(Debug, Error)]
pub enum ErrSecurity {
	#[error("admin token file {path} has permissions {mode:o}, expected owner-only (0600)")]
	LoosePermissions { path: String, mode: u32 },
	#[error("failed to read state file {path}: {source}")]
	Io {
		path: String,
		#[source]
		source: std::io::Error,
	},
	#[error("admin token missing or invalid")]
	Unauthorized,
}

/// Errors surfaced from the admin/control surface (§4.8, §6).
#[derive(Debug, Error)]
pub enum AdminError {
	#[error(transparent)]
	Security(#[from] ErrSecurity),
	#[error("unknown admin route")]
	NotFound,
}

/// Umbrella error for the small set of call sites that need one type
/// across the above (e.g. `FlowHooks` return type). Most of the crate
/// returns the specific kind instead.
#[derive(Debug, Error)]
pub enum TokentapError {
	#[error(transparent)]
	Config(#[from] ErrConfig),
	#[error(transparent)]
	Decode(#[from] ErrDecode),
	#[error(transparent)]
	Extract(#[from] ErrExtract),
	#[error(transparent)]
	Stream(#[from] ErrStream),
	#[error(transparent)]
	Sink(#[from] ErrSink),
	#[error(transparent)]
	Security(#[from] ErrSecurity),
}
