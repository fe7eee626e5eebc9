//! Upstream completion provider contract.
//!
//! The gateway treats the model provider as a [`CompletionBackend`]: a prompt and token budget
//! go in, generated text or a typed [`UpstreamFailure`] comes out. Classification of failures
//! into retryable and terminal outcomes lives in [`crate::retry`].

pub mod azure;

pub use azure::*;

// self
use crate::_prelude::*;

/// Boxed future returned by [`CompletionBackend::complete`].
pub type CompletionFuture<'a> =
	Pin<Box<dyn Future<Output = Result<Completion, UpstreamFailure>> + 'a + Send>>;

/// Generated completion returned by the provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
	/// Generated text; empty when the provider returned no content.
	pub text: String,
	/// Model or deployment that produced the text.
	pub model: String,
}

/// Failure reported by one upstream attempt.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum UpstreamFailure {
	/// Provider throttled the request.
	#[error("Upstream throttled the request.")]
	RateLimited {
		/// Parsed `Retry-After` hint, if the provider sent one.
		retry_after: Option<Duration>,
	},
	/// Provider answered with an error status or could not be reached.
	#[error("Upstream API error (status {status:?}): {message}.")]
	Api {
		/// HTTP status, absent for connection-level failures.
		status: Option<u16>,
		/// Server-side description; never returned to callers.
		message: String,
	},
	/// Attempt exceeded its time budget.
	#[error("Upstream attempt timed out.")]
	Timeout,
	/// Anything the gateway cannot classify, such as an unreadable success body.
	#[error("Unexpected upstream failure: {message}.")]
	Unexpected {
		/// Server-side description; never returned to callers.
		message: String,
	},
}

/// Model provider invoked once per attempt.
pub trait CompletionBackend
where
	Self: Send + Sync,
{
	/// Model identifier reported to callers.
	fn model(&self) -> &str;

	/// Requests a completion for `prompt` bounded by `max_tokens`.
	fn complete<'a>(&'a self, prompt: &'a str, max_tokens: u32) -> CompletionFuture<'a>;
}
