// crates.io
use tracing::{Instrument, Span, instrument::Instrumented};
// self
use crate::{_prelude::*, caller::RequestId};

/// Span wrapping one gateway request so every record it emits carries the request id.
#[derive(Clone, Debug)]
pub struct RequestSpan {
	span: Span,
}
impl RequestSpan {
	/// Creates a span named `chat_gateway.request` tagged with the request id and route.
	pub fn new(request_id: &RequestId, route: &'static str) -> Self {
		let span = tracing::info_span!(
			"chat_gateway.request",
			request_id = %request_id,
			route,
			client_key = tracing::field::Empty,
		);

		Self { span }
	}

	/// Records the caller key once it is known.
	pub fn record_client_key(&self, client_key: &str) {
		self.span.record("client_key", client_key);
	}

	/// Instruments an async block without holding a guard across `.await` points.
	pub fn instrument<Fut>(&self, fut: Fut) -> Instrumented<Fut>
	where
		Fut: Future,
	{
		fut.instrument(self.span.clone())
	}
}
