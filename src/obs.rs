//! Observability helpers for the request pipeline.
//!
//! # Feature Flags
//!
//! - Enable `metrics` to increment the `chat_gateway_stage_total` counter for every stage
//!   outcome, labeled by `stage` + `outcome`, and `chat_gateway_upstream_retry_total` for every
//!   upstream retry.
//!
//! Structured JSON logging ([`init_logging`]) and the per-request span ([`RequestSpan`]) are
//! always available.

mod logging;
mod metrics;
mod tracing;

pub use logging::*;
pub use metrics::*;
pub use tracing::*;

// self
use crate::_prelude::*;

/// Pipeline stages observed by the gateway.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
	/// Bearer-token verification.
	Authenticate,
	/// Per-caller rate limiting.
	RateLimit,
	/// Body decoding and guardrail enforcement.
	Guardrails,
	/// Retrying upstream invocation.
	Upstream,
	/// Whole request, recorded once per `/chat` call.
	Request,
}
impl Stage {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			Stage::Authenticate => "authenticate",
			Stage::RateLimit => "rate_limit",
			Stage::Guardrails => "guardrails",
			Stage::Upstream => "upstream",
			Stage::Request => "request",
		}
	}
}
impl Display for Stage {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Outcome labels recorded for each stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Outcome {
	/// Stage passed.
	Success,
	/// Stage ended the request.
	Failure,
}
impl Outcome {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			Outcome::Success => "success",
			Outcome::Failure => "failure",
		}
	}
}
impl Display for Outcome {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}
