//! Stream Accumulator (C3, spec.md §4.3).
//!
//! Two layers, matching Design Note §9 ("model as a small state machine
//! with explicit INIT|STREAMING|DONE states and a pure step() function;
//! the byte pump is an outer driver"):
//! - [`Accumulator`] is the pure state machine: `step()` takes one
//!   decoded event and updates `UsageDelta` in place. No I/O, fully
//!   testable against a recorded transcript.
//! - [`tap`] is the outer driver: an `http_body::Body` wrapper that
//!   forwards every chunk to the client the instant it arrives and feeds
//!   the same bytes to the accumulator, modelled directly on the
//!   teacher's `parse::passthrough::PassthroughBody`
//!   (`crates/agentgateway/src/parse/passthrough.rs`) — the body is
//!   never buffered in full.
//! - [`tap_aws_event_stream`] is the same driver over
//!   `application/vnd.amazon.eventstream` framing (spec.md §4.4), used
//!   for Bedrock-shaped streams instead of line-delimited SSE. Grounded
//!   on the teacher's `llm::bedrock::ConverseStreamOutput::deserialize`
//!   (`crates/agentgateway/src/llm/bedrock.rs`), which reads the
//!   `:event-type` header off each `aws_event_stream_parser::Message`.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use aws_event_stream_parser::{EventStreamCodec, HeaderValue as AwsHeaderValue};
use bytes::{Bytes, BytesMut};
use http_body::Body as _;
use pin_project_lite::pin_project;
use tokio_sse_codec::{Event, Frame, SseDecoder};
use tokio_util::codec::Decoder;

use crate::extract::{coerce_non_negative_int, UsageDelta};
use crate::http::{self, Error};
use crate::registry::ResponseSse;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
	Init,
	Streaming,
	Done,
}

/// Raw-tail capture for `capture_full` flows (spec.md §4.3): bounded,
/// oldest-drop, with an overflow counter.
struct BoundedTail {
	cap: usize,
	buf: std::collections::VecDeque<u8>,
	dropped_bytes: u64,
}

impl BoundedTail {
	fn new(cap: usize) -> Self {
		BoundedTail {
			cap,
			buf: std::collections::VecDeque::with_capacity(cap.min(8192)),
			dropped_bytes: 0,
		}
	}

	fn push(&mut self, chunk: &[u8]) {
		if chunk.len() >= self.cap {
			self.dropped_bytes += (chunk.len() - self.cap) as u64 + self.buf.len() as u64;
			self.buf.clear();
			self.buf.extend(&chunk[chunk.len() - self.cap..]);
			return;
		}
		let overflow = (self.buf.len() + chunk.len()).saturating_sub(self.cap);
		if overflow > 0 {
			self.dropped_bytes += overflow as u64;
			self.buf.drain(..overflow);
		}
		self.buf.extend(chunk);
	}

	fn into_vec(self) -> (Vec<u8>, u64) {
		(self.buf.into_iter().collect(), self.dropped_bytes)
	}
}

pub const DEFAULT_TAIL_CAP: usize = 256 * 1024;

/// Pure per-stream state machine. Holds no I/O handle; `step()` is the
/// `step(event) -> (new_state, usage_delta)` function from Design Note
/// §9, expressed as in-place mutation for a cheaper hot path.
pub struct Accumulator {
	cfg: Option<Arc<ResponseSse>>,
	state: StreamState,
	usage: UsageDelta,
	skip_counter: u64,
	tail: Option<BoundedTail>,
}

impl Accumulator {
	pub fn new(cfg: Option<Arc<ResponseSse>>, capture_full: bool) -> Self {
		Accumulator {
			cfg,
			state: StreamState::Init,
			usage: UsageDelta::default(),
			skip_counter: 0,
			tail: capture_full.then(|| BoundedTail::new(DEFAULT_TAIL_CAP)),
		}
	}

	pub fn state(&self) -> StreamState {
		self.state
	}

	pub fn skip_counter(&self) -> u64 {
		self.skip_counter
	}

	/// Feeds one decoded SSE event. `event_type` is the frame's `event:`
	/// line if present; providers that omit it (and instead carry a
	/// `"type"` field in the JSON payload) are matched on that instead.
	pub fn step(&mut self, event_type: Option<&str>, data: &[u8]) {
		if self.state == StreamState::Done {
			return;
		}
		let Some(cfg) = self.cfg.clone() else {
			self.state = StreamState::Streaming;
			return;
		};

		let value: serde_json::Value = match serde_json::from_slice(data) {
			Ok(v) => v,
			Err(_) => {
				self.skip_counter += 1;
				if self.state == StreamState::Init {
					self.state = StreamState::Streaming;
				}
				return;
			},
		};
		self.state = StreamState::Streaming;

		let type_field = value.get("type").and_then(serde_json::Value::as_str);
		let matches = |want: &str| event_type == Some(want) || type_field == Some(want);

		if matches(&cfg.input_tokens_event) {
			if let Some(n) = cfg.input_tokens_path.evaluate(&value).single().and_then(coerce_non_negative_int) {
				self.usage.input_tokens = n;
			}
		}
		if matches(&cfg.output_tokens_event) {
			// Providers emit running totals, not deltas: replace, never sum.
			if let Some(n) = cfg.output_tokens_path.evaluate(&value).single().and_then(coerce_non_negative_int) {
				self.usage.output_tokens = n;
			}
		}
	}

	/// Records a raw chunk for `capture_full` tail capture. Independent
	/// of `step()` so the tap can call it before the SSE framer has even
	/// grouped a complete event.
	pub fn observe_raw(&mut self, chunk: &[u8]) {
		if let Some(tail) = &mut self.tail {
			tail.push(chunk);
		}
	}

	/// Marks the stream `DONE` (stream end or a terminal event observed
	/// upstream) and returns the final totals, skip count, and raw tail.
	/// Takes `&mut self` (not by value) so the flow controller can call
	/// it through the same `Arc<Mutex<Accumulator>>` the tap holds,
	/// without needing to prove it holds the last reference.
	pub fn finish(&mut self) -> FinishedStream {
		self.state = StreamState::Done;
		let (tail, tail_dropped_bytes) = match self.tail.take() {
			Some(t) => {
				let (buf, dropped) = t.into_vec();
				(Some(buf), dropped)
			},
			None => (None, 0),
		};
		FinishedStream {
			usage: self.usage.clone(),
			skip_counter: self.skip_counter,
			tail,
			tail_dropped_bytes,
		}
	}
}

pub struct FinishedStream {
	pub usage: UsageDelta,
	pub skip_counter: u64,
	pub tail: Option<Vec<u8>>,
	pub tail_dropped_bytes: u64,
}

/// Shared handle so the tap (running on the body-forwarding task) and
/// the flow controller (which calls `finish()` from `on_response`) can
/// both reach the same accumulator without the hook ever awaiting the
/// body itself.
pub type SharedAccumulator = Arc<Mutex<Accumulator>>;

pin_project! {
	/// Forwards every body frame to the client immediately while feeding
	/// the same bytes through an SSE decoder into the shared accumulator.
	/// Grounded on `parse::passthrough::PassthroughBody`; this is the
	/// "byte pump" Design Note §9 calls for.
	pub struct AccumulatingBody {
		#[pin]
		body: http::Body,
		decoder: SseDecoder<Bytes>,
		decode_buffer: BytesMut,
		accum: SharedAccumulator,
		finished: bool,
	}
}

pub fn tap(body: http::Body, accum: SharedAccumulator, max_event_size: usize) -> http::Body {
	http::Body::new(AccumulatingBody {
		body,
		decoder: SseDecoder::<Bytes>::with_max_size(max_event_size),
		decode_buffer: BytesMut::new(),
		accum,
		finished: false,
	})
}

impl http_body::Body for AccumulatingBody {
	type Data = Bytes;
	type Error = Error;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
		let mut this = self.project();
		if *this.finished {
			return Poll::Ready(None);
		}

		let drain = |finished: bool, buf: &mut BytesMut, decoder: &mut SseDecoder<Bytes>, accum: &SharedAccumulator| {
			loop {
				let decoded = if finished { decoder.decode_eof(buf) } else { decoder.decode(buf) };
				match decoded {
					Ok(Some(Frame::Event(Event { name, data, .. }))) => {
						let mut acc = accum.lock().expect("accumulator mutex poisoned");
						let event_name = (!name.is_empty()).then_some(name.as_ref());
						acc.step(event_name, &data);
					},
					Ok(Some(_)) => continue,
					Ok(None) => return Ok(()),
					Err(e) => return Err(Error::new(e)),
				}
			}
		};

		if let Err(e) = drain(*this.finished, this.decode_buffer, this.decoder, this.accum) {
			return Poll::Ready(Some(Err(e)));
		}

		let res = std::task::ready!(this.body.as_mut().poll_frame(cx));
		let frame_to_send = match res {
			Some(Ok(frame)) => {
				if let Some(data) = frame.data_ref() {
					this.decode_buffer.extend_from_slice(data);
					this.accum.lock().expect("accumulator mutex poisoned").observe_raw(data);
				}
				Some(Ok(frame))
			},
			Some(Err(e)) => return Poll::Ready(Some(Err(e))),
			None => {
				*this.finished = true;
				None
			},
		};

		match drain(*this.finished, this.decode_buffer, this.decoder, this.accum) {
			Ok(()) => Poll::Ready(frame_to_send),
			Err(e) => Poll::Ready(Some(Err(e))),
		}
	}
}

pin_project! {
	/// Same shape as [`AccumulatingBody`], framed with
	/// `aws_event_stream_parser::EventStreamCodec` instead of line-
	/// delimited SSE (spec.md §4.4: `application/vnd.amazon.eventstream`).
	pub struct AwsAccumulatingBody {
		#[pin]
		body: http::Body,
		decoder: EventStreamCodec,
		decode_buffer: BytesMut,
		accum: SharedAccumulator,
		finished: bool,
	}
}

pub fn tap_aws_event_stream(body: http::Body, accum: SharedAccumulator) -> http::Body {
	http::Body::new(AwsAccumulatingBody {
		body,
		decoder: EventStreamCodec,
		decode_buffer: BytesMut::new(),
		accum,
		finished: false,
	})
}

/// Pulls the `:event-type` header value off a decoded frame, mirroring
/// `ConverseStreamOutput::deserialize`'s header lookup.
fn aws_event_type(message: &aws_event_stream_parser::Message) -> Option<String> {
	message
		.headers
		.headers
		.iter()
		.find(|h| h.key.as_str() == ":event-type")
		.and_then(|h| match &h.value {
			AwsHeaderValue::String(s) => Some(s.clone()),
			_ => None,
		})
}

impl http_body::Body for AwsAccumulatingBody {
	type Data = Bytes;
	type Error = Error;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
		let mut this = self.project();
		if *this.finished {
			return Poll::Ready(None);
		}

		let drain = |buf: &mut BytesMut, decoder: &mut EventStreamCodec, accum: &SharedAccumulator| -> Result<(), Error> {
			loop {
				match decoder.decode(buf) {
					Ok(Some(message)) => {
						let event_type = aws_event_type(&message);
						let mut acc = accum.lock().expect("accumulator mutex poisoned");
						acc.step(event_type.as_deref(), &message.body);
					},
					Ok(None) => return Ok(()),
					Err(e) => return Err(Error::new(e)),
				}
			}
		};

		if let Err(e) = drain(this.decode_buffer, this.decoder, this.accum) {
			return Poll::Ready(Some(Err(e)));
		}

		let res = std::task::ready!(this.body.as_mut().poll_frame(cx));
		let frame_to_send = match res {
			Some(Ok(frame)) => {
				if let Some(data) = frame.data_ref() {
					this.decode_buffer.extend_from_slice(data);
					this.accum.lock().expect("accumulator mutex poisoned").observe_raw(data);
				}
				Some(Ok(frame))
			},
			Some(Err(e)) => return Poll::Ready(Some(Err(e))),
			None => {
				*this.finished = true;
				None
			},
		};

		match drain(this.decode_buffer, this.decoder, this.accum) {
			Ok(()) => Poll::Ready(frame_to_send),
			Err(e) => Poll::Ready(Some(Err(e))),
		}
	}
}
