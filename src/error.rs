//! Gateway-level error types shared across admission stages, the upstream invoker, and the HTTP
//! surface.
//!
//! Every terminal outcome of a request is one [`Error`] value. The HTTP layer turns it into a
//! status code via [`Error::status`] and a short message via [`Error::detail`]; neither ever
//! carries token material, prompt text, or raw upstream bodies.

// std
use std::borrow::Cow;
// self
use crate::_prelude::*;

/// Gateway-wide result type alias returning [`Error`] by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Canonical gateway error exposed by public APIs.
#[derive(Debug, ThisError)]
pub enum Error {
	/// Caller authentication failed.
	#[error(transparent)]
	Auth(#[from] AuthError),
	/// Request body or guardrail violation.
	#[error(transparent)]
	Validation(#[from] ValidationError),
	/// Upstream call ended without a usable completion.
	#[error(transparent)]
	Upstream(#[from] UpstreamError),
	/// Local configuration problem.
	#[error(transparent)]
	Config(#[from] ConfigError),

	/// Caller exceeded its per-minute budget.
	#[error("Caller exceeded the rate limit; retry in {retry_after:?}.")]
	RateLimited {
		/// Time until the caller's current window resets.
		retry_after: Duration,
	},
	/// Catch-all for failures nothing else classifies.
	#[error("Unexpected failure: {message}.")]
	Unexpected {
		/// Server-side description; never returned to callers.
		message: String,
		/// Underlying failure, when one exists.
		#[source]
		source: Option<BoxError>,
	},
}
impl Error {
	/// Wraps an unclassified failure.
	pub fn unexpected(message: impl Into<String>) -> Self {
		Self::Unexpected { message: message.into(), source: None }
	}

	/// Wraps an unclassified failure together with its source.
	pub fn unexpected_with(
		message: impl Into<String>,
		source: impl 'static + Send + Sync + std::error::Error,
	) -> Self {
		Self::Unexpected { message: message.into(), source: Some(Box::new(source)) }
	}

	/// HTTP status code the error maps to at the gateway boundary.
	pub fn status(&self) -> u16 {
		match self {
			Self::Auth(_) => 401,
			Self::Validation(_) => 400,
			Self::RateLimited { .. } | Self::Upstream(UpstreamError::RateLimited { .. }) => 429,
			Self::Upstream(_) => 502,
			Self::Config(_) | Self::Unexpected { .. } => 500,
		}
	}

	/// Short caller-facing message.
	pub fn detail(&self) -> Cow<'static, str> {
		match self {
			Self::Auth(err) => Cow::Borrowed(err.detail()),
			Self::Validation(err) => err.detail(),
			Self::RateLimited { .. } => Cow::Borrowed("Rate limit exceeded. Try again soon."),
			Self::Upstream(err) => Cow::Borrowed(err.detail()),
			Self::Config(_) => Cow::Borrowed("Service is misconfigured."),
			Self::Unexpected { .. } => Cow::Borrowed("Internal server error."),
		}
	}

	/// Stable label used as the log message for the request outcome.
	pub fn event(&self) -> &'static str {
		match self {
			Self::Auth(_) => "auth_failed",
			Self::Validation(_) => "invalid_request",
			Self::RateLimited { .. } => "rate_limited",
			Self::Upstream(UpstreamError::AuthFailed { .. }) => "upstream_auth_failed",
			Self::Upstream(UpstreamError::RateLimited { .. }) => "upstream_rate_limited",
			Self::Upstream(UpstreamError::Rejected { .. }) => "upstream_rejected",
			Self::Upstream(UpstreamError::Unavailable { .. }) => "upstream_unavailable",
			Self::Config(_) => "config_error",
			Self::Unexpected { .. } => "unexpected_error",
		}
	}

	/// Retry hint callers should honor, when one is known.
	pub fn retry_after(&self) -> Option<Duration> {
		match self {
			Self::RateLimited { retry_after } => Some(*retry_after),
			Self::Upstream(UpstreamError::RateLimited { retry_after }) => *retry_after,
			_ => None,
		}
	}
}

/// Bearer-token verification failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ThisError)]
pub enum AuthError {
	/// Header absent, not a bearer credential, or empty token.
	#[error("Bearer token is missing.")]
	MissingToken,
	/// Token is malformed, signed by an unknown key, or fails signature checks.
	#[error("Bearer token is invalid.")]
	InvalidToken,
	/// Token expiry is in the past.
	#[error("Bearer token has expired.")]
	TokenExpired,
	/// Token issuer does not match the configured identity provider.
	#[error("Bearer token issuer is not trusted.")]
	InvalidIssuer,
	/// Token audience does not include this gateway.
	#[error("Bearer token audience does not match.")]
	InvalidAudience,
}
impl AuthError {
	/// Short caller-facing reason.
	pub const fn detail(self) -> &'static str {
		match self {
			Self::MissingToken => "Missing bearer token",
			Self::InvalidToken => "Invalid token",
			Self::TokenExpired => "Token expired",
			Self::InvalidIssuer => "Invalid issuer",
			Self::InvalidAudience => "Invalid audience",
		}
	}
}

/// Request-shape and guardrail failures.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum ValidationError {
	/// Body is not valid JSON or violates the request schema.
	#[error("Request body is invalid: {reason}.")]
	InvalidBody {
		/// Server-side reason; never includes prompt text.
		reason: String,
	},
	/// Prompt is empty or whitespace only.
	#[error("Prompt is empty.")]
	EmptyPrompt,
	/// Prompt exceeds the configured character ceiling.
	#[error("Prompt has {actual} characters; at most {max} are allowed.")]
	PromptTooLong {
		/// Configured ceiling in characters.
		max: usize,
		/// Observed prompt length in characters.
		actual: usize,
	},
}
impl ValidationError {
	/// Short caller-facing reason.
	pub fn detail(&self) -> Cow<'static, str> {
		match self {
			Self::InvalidBody { .. } => Cow::Borrowed("Invalid request body."),
			Self::EmptyPrompt => Cow::Borrowed("Prompt is required."),
			Self::PromptTooLong { max, .. } =>
				Cow::Owned(format!("Prompt too long. Max {max} characters.")),
		}
	}
}

/// Terminal upstream failures produced by the retrying invoker.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum UpstreamError {
	/// Upstream rejected the gateway's own credentials.
	#[error("Upstream rejected the gateway credentials with status {status}.")]
	AuthFailed {
		/// HTTP status returned upstream.
		status: u16,
	},
	/// Upstream kept rate limiting after every retry.
	#[error("Upstream rate limited the gateway.")]
	RateLimited {
		/// Retry-After hint from the final upstream response.
		retry_after: Option<Duration>,
	},
	/// Upstream rejected the request with a non-retryable client error.
	#[error("Upstream rejected the request with status {status}.")]
	Rejected {
		/// HTTP status returned upstream.
		status: u16,
	},
	/// Upstream stayed unavailable after every retry.
	#[error("Upstream is unavailable (last status {status:?}).")]
	Unavailable {
		/// Last HTTP status returned upstream, if any response arrived.
		status: Option<u16>,
	},
}
impl UpstreamError {
	/// Short caller-facing reason.
	pub const fn detail(&self) -> &'static str {
		match self {
			Self::AuthFailed { .. } => "Upstream model authentication/authorization failed.",
			Self::RateLimited { .. } => "Upstream rate limit. Try again soon.",
			Self::Rejected { .. } | Self::Unavailable { .. } => "Upstream model error.",
		}
	}
}

/// Configuration and startup failures.
#[derive(Debug, ThisError)]
pub enum ConfigError {
	/// HTTP client could not be constructed.
	#[error("HTTP client could not be constructed.")]
	HttpClientBuild {
		/// Underlying transport builder failure.
		#[source]
		source: BoxError,
	},
	/// Required setting is absent.
	#[error("Required setting `{name}` is not set.")]
	MissingSetting {
		/// Environment variable name.
		name: &'static str,
	},
	/// Setting is present but unusable.
	#[error("Setting `{name}` is invalid: {reason}.")]
	InvalidSetting {
		/// Environment variable name.
		name: &'static str,
		/// Why the value was rejected.
		reason: String,
	},
	/// Setting does not parse as a URL.
	#[error("Setting `{name}` is not a valid URL.")]
	InvalidUrl {
		/// Environment variable name.
		name: &'static str,
		/// Underlying parsing failure.
		#[source]
		source: url::ParseError,
	},
	/// Logging subscriber could not be installed.
	#[error("Logging could not be initialized: {reason}.")]
	Logging {
		/// Installer failure.
		reason: String,
	},
}
impl ConfigError {
	/// Wraps a transport's builder failure inside [`ConfigError`].
	pub fn http_client_build(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::HttpClientBuild { source: Box::new(src) }
	}
}
impl From<ReqwestError> for ConfigError {
	fn from(e: ReqwestError) -> Self {
		Self::http_client_build(e)
	}
}
