//! Request lifecycle for `/chat`.
//!
//! [`RequestPipeline::handle`] runs the admission stages in a fixed order and stops at the first
//! failure:
//!
//! 1. bearer-token verification (when a verifier is configured)
//! 2. caller key derivation (verified subject, else peer address and user agent)
//! 3. rate limiting
//! 4. body decoding and guardrails
//! 5. retrying upstream invocation
//!
//! Every call emits exactly one outcome record on the `chat_gateway::pipeline` target carrying
//! the request id, caller key, latency, and status. Prompt and completion text never reach the
//! logs.

// crates.io
use serde_json::error::Category;
// self
use crate::{
	_prelude::*,
	auth::{OidcKeySetSource, SigningKeySet, TokenVerifier},
	caller::{CallerKey, CallerMetadata, RequestId},
	config::GatewayConfig,
	error::{ConfigError, ValidationError},
	guardrails::{self, GuardrailConfig},
	obs::{self, Outcome, RequestSpan, Stage},
	rate_limit::RateLimiter,
	retry::RetryingInvoker,
	upstream::{AzureOpenAiBackend, CompletionBackend},
};

/// Route label attached to outcome records.
pub const CHAT_PATH: &str = "/chat";

const DEFAULT_MAX_TOKENS: i64 = 200;
const MAX_TOKENS_RANGE: std::ops::RangeInclusive<i64> = 1..=800;

/// Inputs of one `/chat` call as captured by the transport.
#[derive(Clone)]
pub struct ChatCommand {
	/// Correlation id for every record of this request.
	pub request_id: RequestId,
	/// Raw `Authorization` header value.
	pub authorization: Option<String>,
	/// Transport-level caller facts.
	pub caller: CallerMetadata,
	/// Undecoded request body.
	pub body: Vec<u8>,
}
impl ChatCommand {
	/// Creates a command for `body` with no credentials or caller metadata.
	pub fn new(request_id: RequestId, body: impl Into<Vec<u8>>) -> Self {
		Self {
			request_id,
			authorization: None,
			caller: CallerMetadata::default(),
			body: body.into(),
		}
	}

	/// Attaches the raw `Authorization` header value.
	pub fn with_authorization(mut self, authorization: impl Into<String>) -> Self {
		self.authorization = Some(authorization.into());

		self
	}

	/// Attaches transport-level caller facts.
	pub fn with_caller(mut self, caller: CallerMetadata) -> Self {
		self.caller = caller;

		self
	}
}
impl Debug for ChatCommand {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("ChatCommand")
			.field("request_id", &self.request_id)
			.field("authorization", &self.authorization.as_ref().map(|_| "<redacted>"))
			.field("caller", &self.caller)
			.field("body_len", &self.body.len())
			.finish()
	}
}

/// Decoded `/chat` request body.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct ChatPayload {
	/// User prompt.
	pub prompt: String,
	/// Requested completion budget.
	#[serde(default = "default_max_tokens")]
	pub max_tokens: i64,
}
impl ChatPayload {
	/// Decodes and schema-checks a request body.
	///
	/// Rejection reasons name the failing location, never the submitted values.
	pub fn from_slice(body: &[u8]) -> Result<Self, ValidationError> {
		let mut deserializer = serde_json::Deserializer::from_slice(body);
		let payload: Self =
			serde_path_to_error::deserialize(&mut deserializer).map_err(|e| {
				let inner = e.inner();
				let category = match inner.classify() {
					Category::Io => "io",
					Category::Syntax => "syntax",
					Category::Data => "data",
					Category::Eof => "eof",
				};

				ValidationError::InvalidBody {
					reason: format!(
						"{category} error at `{}` (line {}, column {})",
						e.path(),
						inner.line(),
						inner.column()
					),
				}
			})?;

		if payload.prompt.is_empty() {
			return Err(ValidationError::InvalidBody { reason: "prompt must not be empty".into() });
		}
		if !MAX_TOKENS_RANGE.contains(&payload.max_tokens) {
			return Err(ValidationError::InvalidBody {
				reason: format!(
					"max_tokens must be within {}..={}",
					MAX_TOKENS_RANGE.start(),
					MAX_TOKENS_RANGE.end()
				),
			});
		}

		Ok(payload)
	}
}
impl Debug for ChatPayload {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("ChatPayload")
			.field("prompt_chars", &self.prompt.chars().count())
			.field("max_tokens", &self.max_tokens)
			.finish()
	}
}

/// Successful `/chat` response body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatReply {
	/// Generated text.
	pub response: String,
	/// Model that produced it.
	pub model: String,
}

/// Composes verification, metering, guardrails, and the upstream call into one request.
pub struct RequestPipeline {
	verifier: Option<Arc<TokenVerifier>>,
	limiter: Arc<RateLimiter>,
	guardrails: GuardrailConfig,
	invoker: RetryingInvoker,
	backend: Arc<dyn CompletionBackend>,
}
impl RequestPipeline {
	/// Creates an unauthenticated pipeline with a fresh rate limiter sized from `guardrails`.
	pub fn new(
		guardrails: GuardrailConfig,
		invoker: RetryingInvoker,
		backend: Arc<dyn CompletionBackend>,
	) -> Self {
		Self {
			verifier: None,
			limiter: Arc::new(RateLimiter::new(guardrails.rate_limit_per_minute)),
			guardrails,
			invoker,
			backend,
		}
	}

	/// Builds the production pipeline: Azure OpenAI upstream plus OIDC-backed verification when
	/// authentication is configured.
	pub fn from_config(config: &GatewayConfig) -> Result<Self, ConfigError> {
		let backend = Arc::new(AzureOpenAiBackend::from_config(&config.upstream)?);
		let pipeline = Self::new(config.guardrails, RetryingInvoker::new(config.retry), backend);
		let Some(auth) = &config.auth else {
			return Ok(pipeline);
		};
		let source =
			Arc::new(OidcKeySetSource::with_timeout(auth.discovery_url.clone(), auth.fetch_timeout)?);
		let keys = SigningKeySet::new(source).with_refresh_cooldown(auth.refresh_cooldown);
		let verifier = TokenVerifier::new(Arc::new(keys), &auth.issuer, &auth.audience);

		Ok(pipeline.with_verifier(Arc::new(verifier)))
	}

	/// Requires a verified bearer token on every request.
	pub fn with_verifier(mut self, verifier: Arc<TokenVerifier>) -> Self {
		self.verifier = Some(verifier);

		self
	}

	/// Shares an existing rate limiter, e.g. across router instances.
	pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
		self.limiter = limiter;

		self
	}

	/// Token verifier, when authentication is enabled.
	pub fn verifier(&self) -> Option<&Arc<TokenVerifier>> {
		self.verifier.as_ref()
	}

	/// Shared rate limiter.
	pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
		&self.limiter
	}

	/// Active guardrail settings.
	pub fn guardrails(&self) -> &GuardrailConfig {
		&self.guardrails
	}

	/// Model reported by the upstream backend.
	pub fn model(&self) -> &str {
		self.backend.model()
	}

	/// Runs one `/chat` request end to end.
	pub async fn handle(&self, command: ChatCommand) -> Result<ChatReply> {
		let started = Instant::now();
		let span = RequestSpan::new(&command.request_id, CHAT_PATH);
		let mut client_key = CallerKey::from_metadata(&command.caller);
		let result = span.instrument(self.run(&command, &span, &mut client_key)).await;

		obs::record_stage_outcome(
			Stage::Request,
			if result.is_ok() { Outcome::Success } else { Outcome::Failure },
		);
		log_outcome(&command.request_id, &client_key, started.elapsed(), &result);

		result
	}

	async fn run(
		&self,
		command: &ChatCommand,
		span: &RequestSpan,
		client_key: &mut CallerKey,
	) -> Result<ChatReply> {
		let claims = match &self.verifier {
			Some(verifier) => Some(staged(
				Stage::Authenticate,
				verifier.verify(command.authorization.as_deref()).await.map_err(Error::from),
			)?),
			None => None,
		};

		if let Some(key) = claims.as_ref().and_then(CallerKey::from_claims) {
			*client_key = key;
		}

		span.record_client_key(&**client_key);
		staged(Stage::RateLimit, self.limiter.check(client_key))?;

		let (payload, max_tokens) = staged(Stage::Guardrails, self.admit(&command.body))?;
		let prompt = payload.prompt.as_str();
		let completion = staged(
			Stage::Upstream,
			self.invoker.invoke(|| self.backend.complete(prompt, max_tokens)).await,
		)?;

		Ok(ChatReply { response: completion.text, model: completion.model })
	}

	fn admit(&self, body: &[u8]) -> Result<(ChatPayload, u32)> {
		let payload = ChatPayload::from_slice(body)?;
		let max_tokens = guardrails::enforce(&payload.prompt, payload.max_tokens, &self.guardrails)?;

		Ok((payload, max_tokens))
	}
}
impl Debug for RequestPipeline {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("RequestPipeline")
			.field("auth_enabled", &self.verifier.is_some())
			.field("model", &self.backend.model())
			.field("guardrails", &self.guardrails)
			.field("invoker", &self.invoker)
			.finish_non_exhaustive()
	}
}

fn default_max_tokens() -> i64 {
	DEFAULT_MAX_TOKENS
}

fn staged<T>(stage: Stage, result: Result<T>) -> Result<T> {
	obs::record_stage_outcome(
		stage,
		if result.is_ok() { Outcome::Success } else { Outcome::Failure },
	);

	result
}

fn log_outcome(
	request_id: &RequestId,
	client_key: &CallerKey,
	latency: Duration,
	result: &Result<ChatReply>,
) {
	let latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
	let Err(err) = result else {
		tracing::info!(
			target: "chat_gateway::pipeline",
			request_id = %request_id,
			client_key = %client_key,
			latency_ms,
			path = CHAT_PATH,
			method = "POST",
			status_code = 200_u16,
			"chat_complete"
		);

		return;
	};
	let status_code = err.status();
	let exc_info = matches!(err, Error::Upstream(_) | Error::Unexpected { .. } | Error::Config(_))
		.then(|| error_chain(err));
	let exc_info = exc_info.as_deref();

	if status_code >= 500 {
		tracing::error!(
			target: "chat_gateway::pipeline",
			request_id = %request_id,
			client_key = %client_key,
			latency_ms,
			path = CHAT_PATH,
			method = "POST",
			status_code,
			exc_info,
			"{}",
			err.event()
		);
	} else {
		tracing::warn!(
			target: "chat_gateway::pipeline",
			request_id = %request_id,
			client_key = %client_key,
			latency_ms,
			path = CHAT_PATH,
			method = "POST",
			status_code,
			exc_info,
			"{}",
			err.event()
		);
	}
}

/// Formats an error and its sources as `outer: inner: root`, without sentence-ending periods.
fn error_chain(err: &(dyn StdError + 'static)) -> String {
	let mut chain = err.to_string().trim_end_matches('.').to_owned();
	let mut source = err.source();

	while let Some(cause) = source {
		chain.push_str(": ");
		chain.push_str(cause.to_string().trim_end_matches('.'));

		source = cause.source();
	}

	chain
}

#[cfg(test)]
mod tests {
	// std
	use std::net::{IpAddr, Ipv4Addr};
	// self
	use super::*;
	use crate::{
		_preludet::*,
		auth::StaticKeySetSource,
		error::{AuthError, UpstreamError},
		retry::RetryPolicy,
		upstream::UpstreamFailure,
	};

	fn pipeline(backend: Arc<ScriptedBackend>, guardrails: GuardrailConfig) -> RequestPipeline {
		let invoker =
			RetryingInvoker::new(RetryPolicy::default()).with_sleeper(Arc::new(RecordingSleeper::default()));

		RequestPipeline::new(guardrails, invoker, backend)
	}

	fn verifier() -> Arc<TokenVerifier> {
		let keys = SigningKeySet::new(Arc::new(StaticKeySetSource::new(test_jwk_set(["kid-1"]))));

		Arc::new(TokenVerifier::new(Arc::new(keys), TEST_ISSUER, TEST_AUDIENCE))
	}

	fn command(body: &str) -> ChatCommand {
		ChatCommand::new(RequestId::generate(), body).with_caller(
			CallerMetadata::new(Some(IpAddr::V4(Ipv4Addr::LOCALHOST))).with_user_agent("tests"),
		)
	}

	fn bearer(subject: &str) -> String {
		format!("Bearer {}", sign_test_token("kid-1", &test_claims(subject, 300)))
	}

	#[test]
	fn payload_defaults_and_bounds() {
		let payload = ChatPayload::from_slice(br#"{"prompt":"hi"}"#).expect("Minimal body.");

		assert_eq!(payload.max_tokens, 200);

		for body in [
			r#"{"prompt":""}"#,
			r#"{"max_tokens":5}"#,
			r#"{"prompt":"hi","max_tokens":0}"#,
			r#"{"prompt":"hi","max_tokens":801}"#,
			r#"{"prompt":"hi","max_tokens":"many"}"#,
			r#"{"prompt":"hi""#,
			"",
		] {
			assert!(
				matches!(ChatPayload::from_slice(body.as_bytes()), Err(ValidationError::InvalidBody { .. })),
				"{body} should be rejected."
			);
		}
	}

	#[test]
	fn payload_rejections_do_not_echo_values() {
		let err = ChatPayload::from_slice(br#"{"prompt":"hi","max_tokens":"top secret plan"}"#)
			.expect_err("String budgets are invalid.");
		let ValidationError::InvalidBody { reason } = err else {
			panic!("Expected an invalid body error.");
		};

		assert!(reason.contains("max_tokens"));
		assert!(!reason.contains("top secret plan"));
	}

	#[tokio::test]
	async fn successful_request_returns_completion() {
		let backend = Arc::new(ScriptedBackend::replying("gpt-test", "hello there"));
		let reply = pipeline(backend.clone(), GuardrailConfig::default())
			.handle(command(r#"{"prompt":"say hi","max_tokens":50}"#))
			.await
			.expect("Request should succeed.");

		assert_eq!(reply, ChatReply { response: "hello there".into(), model: "gpt-test".into() });
		assert_eq!(backend.calls(), 1);
	}

	#[tokio::test]
	async fn auth_failure_short_circuits_everything() {
		let backend = Arc::new(ScriptedBackend::replying("gpt-test", "unused"));
		let pipeline = pipeline(backend.clone(), GuardrailConfig::default()).with_verifier(verifier());
		let err = pipeline
			.handle(command(r#"{"prompt":"hi"}"#))
			.await
			.expect_err("Missing token should be rejected.");

		assert!(matches!(err, Error::Auth(AuthError::MissingToken)));
		assert_eq!(pipeline.rate_limiter().tracked_keys(), 0, "Auth failures must not be metered.");
		assert_eq!(backend.calls(), 0);
	}

	#[tokio::test]
	async fn verified_subjects_get_separate_budgets() {
		let backend = Arc::new(ScriptedBackend::replying("gpt-test", "ok"));
		let guardrails = GuardrailConfig { rate_limit_per_minute: 1, ..Default::default() };
		let pipeline = pipeline(backend, guardrails).with_verifier(verifier());
		let body = r#"{"prompt":"hi"}"#;

		pipeline
			.handle(command(body).with_authorization(bearer("alice")))
			.await
			.expect("Alice's first request should pass.");
		pipeline
			.handle(command(body).with_authorization(bearer("bob")))
			.await
			.expect("Bob shares the address but not the budget.");

		let err = pipeline
			.handle(command(body).with_authorization(bearer("alice")))
			.await
			.expect_err("Alice's second request should be limited.");

		assert_eq!(err.status(), 429);
	}

	#[tokio::test]
	async fn rate_limit_runs_before_body_validation() {
		let backend = Arc::new(ScriptedBackend::replying("gpt-test", "ok"));
		let guardrails = GuardrailConfig { rate_limit_per_minute: 1, ..Default::default() };
		let pipeline = pipeline(backend.clone(), guardrails);

		pipeline.handle(command(r#"{"prompt":"hi"}"#)).await.expect("First request should pass.");

		let err = pipeline.handle(command("not json")).await.expect_err("Budget is exhausted.");

		assert!(matches!(err, Error::RateLimited { .. }));
		assert_eq!(backend.calls(), 1);
	}

	#[tokio::test]
	async fn guardrail_violations_never_reach_upstream() {
		let backend = Arc::new(ScriptedBackend::replying("gpt-test", "unused"));
		let guardrails = GuardrailConfig { max_prompt_chars: 5, ..Default::default() };
		let pipeline = pipeline(backend.clone(), guardrails);
		let blank = pipeline.handle(command(r#"{"prompt":"   "}"#)).await;
		let long = pipeline.handle(command(r#"{"prompt":"too long prompt"}"#)).await;

		assert!(matches!(blank, Err(Error::Validation(ValidationError::EmptyPrompt))));
		assert!(matches!(
			long,
			Err(Error::Validation(ValidationError::PromptTooLong { max: 5, actual: 15 }))
		));
		assert_eq!(backend.calls(), 0);
	}

	#[tokio::test]
	async fn transient_upstream_failures_are_retried() {
		let backend = Arc::new(ScriptedBackend::new(
			"gpt-test",
			[
				Err(UpstreamFailure::Api { status: Some(500), message: "boom".into() }),
				Ok("recovered".into()),
			],
		));
		let reply = pipeline(backend.clone(), GuardrailConfig::default())
			.handle(command(r#"{"prompt":"hi"}"#))
			.await
			.expect("Second attempt should succeed.");

		assert_eq!(reply.response, "recovered");
		assert_eq!(backend.calls(), 2);
	}

	#[tokio::test]
	async fn upstream_auth_failures_map_to_bad_gateway() {
		let backend = Arc::new(ScriptedBackend::new(
			"gpt-test",
			[Err(UpstreamFailure::Api { status: Some(401), message: "denied".into() })],
		));
		let err = pipeline(backend.clone(), GuardrailConfig::default())
			.handle(command(r#"{"prompt":"hi"}"#))
			.await
			.expect_err("Upstream auth failures are terminal.");

		assert!(matches!(err, Error::Upstream(UpstreamError::AuthFailed { status: 401 })));
		assert_eq!(err.status(), 502);
		assert_eq!(backend.calls(), 1);
	}

	#[test]
	fn error_chain_includes_sources() {
		let err = Error::unexpected_with("upstream call failed", std::io::Error::other("reset"));

		assert_eq!(error_chain(&err), "Unexpected failure: upstream call failed: reset");

		let nested = Error::from(ConfigError::InvalidUrl {
			name: "AZURE_OPENAI_ENDPOINT",
			source: url::ParseError::RelativeUrlWithoutBase,
		});

		assert!(!error_chain(&nested).contains(".:"));
	}
}
