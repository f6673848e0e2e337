//! Compiled field paths for the provider registry (spec.md §4.1).
//!
//! Paths are parsed once at registry load, not re-parsed per request —
//! the hot path only walks an already-compiled `Segment` tree. Grounded
//! on the teacher's `json::traverse`/`traverse_mut` (`crates/agentgateway/
//! src/json.rs`), extended here with a `Wildcard` segment so a path like
//! `$.content[*].text` collects every matching leaf instead of only the
//! first one.

use serde_json::Value;

use crate::error::ErrConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
	Key(String),
	Index(usize),
	Wildcard,
}

/// A compiled field path, e.g. `$.usage.input_tokens` or
/// `$.content[*].text`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
	raw: String,
	segments: Vec<Segment>,
}

impl Path {
	/// Parses a dotted/bracketed path expression. Accepts an optional
	/// leading `$` root reference; `$` and `$.` and `` (empty) all mean
	/// "the root value itself".
	pub fn parse(expr: &str) -> Result<Self, ErrConfig> {
		let segments = parse_segments(expr).map_err(|reason| ErrConfig::InvalidPath {
			expr: expr.to_string(),
			reason,
		})?;
		Ok(Path {
			raw: expr.to_string(),
			segments,
		})
	}

	pub fn as_str(&self) -> &str {
		&self.raw
	}

	pub fn has_wildcard(&self) -> bool {
		self.segments.iter().any(|s| matches!(s, Segment::Wildcard))
	}

	/// Evaluates this path against `root`. See [`Extracted`] for the
	/// present/missing/list distinction.
	pub fn evaluate<'a>(&self, root: &'a Value) -> Extracted<'a> {
		eval_segments(root, &self.segments)
	}
}

/// Result of evaluating a [`Path`] against a JSON value.
///
/// A non-wildcard path yields `Value` or `Missing`. A path containing a
/// wildcard collapses to `List`, which is `[]` (not `Missing`) when the
/// wildcarded collection exists but is empty — alternates fall back only
/// on `Missing`, never on an empty `List` (spec.md §4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extracted<'a> {
	Missing,
	Value(&'a Value),
	List(Vec<&'a Value>),
}

impl<'a> Extracted<'a> {
	pub fn is_missing(&self) -> bool {
		matches!(self, Extracted::Missing)
	}

	/// Returns the single leaf value, if this evaluated to one (not a
	/// list and not missing).
	pub fn single(&self) -> Option<&'a Value> {
		match self {
			Extracted::Value(v) => Some(*v),
			_ => None,
		}
	}
}

/// Evaluates `primary`; on `Missing` (not on an empty `List`), tries each
/// of `alternates` in order and returns the first non-missing result.
pub fn evaluate_with_alternates<'a>(
	root: &'a Value,
	primary: &Path,
	alternates: &[Path],
) -> Extracted<'a> {
	let first = primary.evaluate(root);
	if !first.is_missing() {
		return first;
	}
	for alt in alternates {
		let r = alt.evaluate(root);
		if !r.is_missing() {
			return r;
		}
	}
	Extracted::Missing
}

/// Evaluates an ordered list of paths (`paths[0]` is the primary, the
/// rest are alternates) and returns the first non-missing result.
/// Equivalent to [`evaluate_with_alternates`] but takes the config's
/// natural "ordered list" shape directly.
pub fn evaluate_first_present<'a>(root: &'a Value, paths: &[Path]) -> Extracted<'a> {
	match paths.split_first() {
		Some((primary, alternates)) => evaluate_with_alternates(root, primary, alternates),
		None => Extracted::Missing,
	}
}

fn eval_segments<'a>(value: &'a Value, segments: &[Segment]) -> Extracted<'a> {
	let Some((head, rest)) = segments.split_first() else {
		return Extracted::Value(value);
	};
	match head {
		Segment::Key(key) => match value.as_object().and_then(|m| m.get(key)) {
			Some(v) => eval_segments(v, rest),
			None => Extracted::Missing,
		},
		Segment::Index(idx) => match value.as_array().and_then(|a| a.get(*idx)) {
			Some(v) => eval_segments(v, rest),
			None => Extracted::Missing,
		},
		Segment::Wildcard => match value.as_array() {
			Some(arr) => {
				let mut out = Vec::new();
				for item in arr {
					match eval_segments(item, rest) {
						Extracted::Value(v) => out.push(v),
						Extracted::List(vs) => out.extend(vs),
						Extracted::Missing => {}
					}
				}
				Extracted::List(out)
			},
			None => Extracted::Missing,
		},
	}
}

fn parse_segments(expr: &str) -> Result<Vec<Segment>, String> {
	let mut s = expr.trim();
	if let Some(rest) = s.strip_prefix('$') {
		s = rest.strip_prefix('.').unwrap_or(rest);
	}
	if s.is_empty() {
		return Ok(Vec::new());
	}

	let mut segments = Vec::new();
	let mut chars = s.chars().peekable();
	let mut buf = String::new();

	macro_rules! flush_key {
		() => {
			if !buf.is_empty() {
				segments.push(Segment::Key(std::mem::take(&mut buf)));
			}
		};
	}

	while let Some(c) = chars.next() {
		match c {
			'.' => flush_key!(),
			'[' => {
				flush_key!();
				let mut inner = String::new();
				loop {
					match chars.next() {
						Some(']') => break,
						Some(c) => inner.push(c),
						None => return Err(format!("unterminated `[` in `{expr}`")),
					}
				}
				if inner == "*" {
					segments.push(Segment::Wildcard);
				} else {
					let idx: usize = inner
						.parse()
						.map_err(|_| format!("invalid index `[{inner}]` in `{expr}`"))?;
					segments.push(Segment::Index(idx));
				}
			},
			_ => buf.push(c),
		}
	}
	flush_key!();

	if segments.is_empty() {
		return Err(format!("empty path `{expr}`"));
	}
	Ok(segments)
}
