//! Startup configuration.
//!
//! Every setting is a command-line flag that falls back to an environment variable.
//! [`GatewayArgs::into_config`] validates the raw values once; anything missing or unusable is
//! a [`ConfigError`] and the process refuses to start.

// std
use std::net::SocketAddr;
// crates.io
use clap::{ArgAction, Parser, builder::BoolishValueParser};
// self
use crate::{
	_prelude::*, error::ConfigError, guardrails::GuardrailConfig, retry::RetryPolicy,
	secret::Secret,
};

/// Azure OpenAI REST API version used when none is configured.
pub const DEFAULT_API_VERSION: &str = "2024-10-21";
/// Identity provider authority used when none is configured.
pub const DEFAULT_IDENTITY_AUTHORITY: &str = "https://login.microsoftonline.com";

/// Raw command-line and environment settings.
#[derive(Clone, Parser)]
#[command(name = "chat-gateway", version, about = "Admission gateway for hosted chat-completion APIs.")]
pub struct GatewayArgs {
	/// Socket address the HTTP server binds.
	#[arg(long, env = "GATEWAY_LISTEN_ADDR", default_value = "0.0.0.0:8000")]
	pub listen_addr: String,
	/// Log level or filter directive.
	#[arg(long, env = "LOG_LEVEL", default_value = "info")]
	pub log_level: String,
	/// Require a verified bearer token on `/chat`.
	#[arg(
		long,
		env = "AUTH_ENABLED",
		default_value_t = false,
		action = ArgAction::Set,
		value_parser = BoolishValueParser::new(),
	)]
	pub auth_enabled: bool,
	/// Identity provider tenant.
	#[arg(long, env = "TENANT_ID")]
	pub tenant_id: Option<String>,
	/// Expected token audience.
	#[arg(long, env = "API_AUDIENCE")]
	pub api_audience: Option<String>,
	/// Application (client) id, used as the audience when none is set explicitly.
	#[arg(long, env = "API_CLIENT_ID")]
	pub api_client_id: Option<String>,
	/// Identity provider authority URL.
	#[arg(long, env = "IDENTITY_AUTHORITY", default_value = DEFAULT_IDENTITY_AUTHORITY)]
	pub identity_authority: String,
	/// Timeout for discovery and key set requests, in seconds.
	#[arg(long, env = "IDENTITY_TIMEOUT_SECS", default_value_t = 10)]
	pub identity_timeout_secs: u64,
	/// Minimum spacing between key set refreshes triggered by unknown key ids, in seconds.
	#[arg(long, env = "JWKS_REFRESH_COOLDOWN_SECS", default_value_t = 30)]
	pub jwks_refresh_cooldown_secs: u64,
	/// Azure OpenAI resource endpoint.
	#[arg(long = "upstream-endpoint", env = "AZURE_OPENAI_ENDPOINT")]
	pub upstream_endpoint: Option<String>,
	/// Azure OpenAI deployment name.
	#[arg(long = "upstream-deployment", env = "AZURE_OPENAI_DEPLOYMENT")]
	pub upstream_deployment: Option<String>,
	/// Azure OpenAI API key.
	#[arg(long = "upstream-api-key", env = "AZURE_OPENAI_API_KEY", hide_env_values = true)]
	pub upstream_api_key: Option<String>,
	/// Azure OpenAI REST API version.
	#[arg(long = "upstream-api-version", env = "AZURE_OPENAI_API_VERSION", default_value = DEFAULT_API_VERSION)]
	pub upstream_api_version: String,
	/// Time budget of one upstream attempt, in seconds.
	#[arg(long, env = "UPSTREAM_TIMEOUT_SECS", default_value_t = 30)]
	pub upstream_timeout_secs: u64,
	/// Longest accepted prompt, in characters.
	#[arg(long, env = "MAX_PROMPT_CHARS", default_value_t = crate::guardrails::DEFAULT_MAX_PROMPT_CHARS)]
	pub max_prompt_chars: usize,
	/// Ceiling on completion tokens.
	#[arg(long, env = "MAX_TOKENS_HARD_LIMIT", default_value_t = crate::guardrails::DEFAULT_MAX_TOKENS_HARD_LIMIT)]
	pub max_tokens_hard_limit: u32,
	/// Requests each caller may issue per minute.
	#[arg(long, env = "RATE_LIMIT_PER_MINUTE", default_value_t = crate::guardrails::DEFAULT_RATE_LIMIT_PER_MINUTE)]
	pub rate_limit_per_minute: u32,
	/// Upstream retries after the first attempt.
	#[arg(long, env = "RETRY_MAX_RETRIES", default_value_t = 3)]
	pub retry_max_retries: u32,
	/// Backoff base delay, in milliseconds.
	#[arg(long, env = "RETRY_BASE_DELAY_MS", default_value_t = 400)]
	pub retry_base_delay_ms: u64,
	/// Backoff jitter ceiling, in milliseconds.
	#[arg(long, env = "RETRY_JITTER_MS", default_value_t = 250)]
	pub retry_jitter_ms: u64,
	/// Cap on cumulative backoff per request, in milliseconds.
	#[arg(long, env = "RETRY_MAX_TOTAL_DELAY_MS", default_value_t = 5_000)]
	pub retry_max_total_delay_ms: u64,
}
impl GatewayArgs {
	/// Validates the raw settings.
	pub fn into_config(self) -> Result<GatewayConfig, ConfigError> {
		let listen_addr = self.listen_addr.trim().parse::<SocketAddr>().map_err(|e| {
			ConfigError::InvalidSetting { name: "GATEWAY_LISTEN_ADDR", reason: e.to_string() }
		})?;
		let auth = if self.auth_enabled { Some(self.auth_config()?) } else { None };
		let upstream = self.upstream_config()?;
		let guardrails = GuardrailConfig {
			max_prompt_chars: positive("MAX_PROMPT_CHARS", self.max_prompt_chars)?,
			max_tokens_hard_limit: positive("MAX_TOKENS_HARD_LIMIT", self.max_tokens_hard_limit)?,
			rate_limit_per_minute: positive("RATE_LIMIT_PER_MINUTE", self.rate_limit_per_minute)?,
		};
		let retry = RetryPolicy::default()
			.with_max_retries(self.retry_max_retries)
			.with_base_delay(Duration::from_millis(self.retry_base_delay_ms))
			.with_jitter_ceiling(Duration::from_millis(self.retry_jitter_ms))
			.with_max_total_delay(Duration::from_millis(self.retry_max_total_delay_ms))
			.with_attempt_timeout(upstream.timeout);

		Ok(GatewayConfig {
			listen_addr,
			log_level: self.log_level,
			auth,
			upstream,
			guardrails,
			retry,
		})
	}

	fn auth_config(&self) -> Result<AuthConfig, ConfigError> {
		let tenant = required("TENANT_ID", self.tenant_id.as_deref())?;
		let audience = required("API_AUDIENCE", self.api_audience.as_deref())
			.or_else(|_| required("API_CLIENT_ID", self.api_client_id.as_deref()))
			.map_err(|_| ConfigError::MissingSetting { name: "API_AUDIENCE" })?;
		let authority = self.identity_authority.trim().trim_end_matches('/');
		let issuer = format!("{authority}/{tenant}/v2.0");
		let discovery_url = Url::parse(&format!("{issuer}/.well-known/openid-configuration"))
			.map_err(|source| ConfigError::InvalidUrl { name: "IDENTITY_AUTHORITY", source })?;

		if !matches!(discovery_url.scheme(), "http" | "https") {
			return Err(ConfigError::InvalidSetting {
				name: "IDENTITY_AUTHORITY",
				reason: "authority must be an http(s) URL".into(),
			});
		}

		Ok(AuthConfig {
			issuer,
			audience,
			discovery_url,
			fetch_timeout: seconds("IDENTITY_TIMEOUT_SECS", self.identity_timeout_secs)?,
			refresh_cooldown: Duration::from_secs(self.jwks_refresh_cooldown_secs),
		})
	}

	fn upstream_config(&self) -> Result<UpstreamConfig, ConfigError> {
		let endpoint = required("AZURE_OPENAI_ENDPOINT", self.upstream_endpoint.as_deref())?;
		let endpoint = Url::parse(&endpoint)
			.map_err(|source| ConfigError::InvalidUrl { name: "AZURE_OPENAI_ENDPOINT", source })?;
		let api_version = required("AZURE_OPENAI_API_VERSION", Some(self.upstream_api_version.as_str()))?;

		Ok(UpstreamConfig {
			endpoint,
			deployment: required("AZURE_OPENAI_DEPLOYMENT", self.upstream_deployment.as_deref())?,
			api_key: self
				.upstream_api_key
				.as_deref()
				.map(str::trim)
				.filter(|key| !key.is_empty())
				.map(Secret::new),
			api_version,
			timeout: seconds("UPSTREAM_TIMEOUT_SECS", self.upstream_timeout_secs)?,
		})
	}
}

/// Validated process configuration.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
	/// Socket address the HTTP server binds.
	pub listen_addr: SocketAddr,
	/// Log level or filter directive.
	pub log_level: String,
	/// Token verification settings; `None` disables authentication.
	pub auth: Option<AuthConfig>,
	/// Upstream provider settings.
	pub upstream: UpstreamConfig,
	/// Prompt and rate ceilings.
	pub guardrails: GuardrailConfig,
	/// Upstream retry schedule.
	pub retry: RetryPolicy,
}

/// Identity provider settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthConfig {
	/// Expected `iss` claim.
	pub issuer: String,
	/// Expected `aud` claim.
	pub audience: String,
	/// OpenID Connect discovery document URL.
	pub discovery_url: Url,
	/// Timeout for discovery and key set requests.
	pub fetch_timeout: Duration,
	/// Minimum spacing between refreshes triggered by unknown key ids.
	pub refresh_cooldown: Duration,
}

/// Upstream completion provider settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstreamConfig {
	/// Resource endpoint, e.g. `https://my-resource.openai.azure.com/`.
	pub endpoint: Url,
	/// Deployment name; also reported as the model.
	pub deployment: String,
	/// API key sent in the `api-key` header, when configured.
	pub api_key: Option<Secret>,
	/// REST API version.
	pub api_version: String,
	/// Time budget of one attempt.
	pub timeout: Duration,
}

fn required(name: &'static str, value: Option<&str>) -> Result<String, ConfigError> {
	value
		.map(str::trim)
		.filter(|value| !value.is_empty())
		.map(str::to_owned)
		.ok_or(ConfigError::MissingSetting { name })
}

fn positive<T>(name: &'static str, value: T) -> Result<T, ConfigError>
where
	T: Default + PartialEq,
{
	if value == T::default() {
		return Err(ConfigError::InvalidSetting { name, reason: "must be greater than zero".into() });
	}

	Ok(value)
}

fn seconds(name: &'static str, value: u64) -> Result<Duration, ConfigError> {
	positive(name, value).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	fn parse(extra: &[&str]) -> GatewayArgs {
		let base = [
			"chat-gateway",
			"--upstream-endpoint",
			"https://example.openai.azure.com/",
			"--upstream-deployment",
			"gpt-4o-mini",
		];

		GatewayArgs::try_parse_from(base.iter().chain(extra)).expect("Arguments should parse.")
	}

	#[test]
	fn defaults_match_documented_values() {
		let config = parse(&[]).into_config().expect("Minimal configuration should validate.");

		assert_eq!(config.listen_addr, "0.0.0.0:8000".parse().expect("Socket address literal."));
		assert!(config.auth.is_none());
		assert_eq!(config.guardrails, GuardrailConfig::default());
		assert_eq!(config.upstream.api_version, DEFAULT_API_VERSION);
		assert_eq!(config.upstream.timeout, Duration::from_secs(30));
		assert_eq!(config.retry.max_retries, 3);
		assert_eq!(config.retry.base_delay, Duration::from_millis(400));
		assert_eq!(config.retry.jitter_ceiling, Duration::from_millis(250));
		assert_eq!(config.retry.attempt_timeout, Duration::from_secs(30));
	}

	#[test]
	fn auth_settings_derive_issuer_and_discovery() {
		let config = parse(&[
			"--auth-enabled",
			"true",
			"--tenant-id",
			"contoso",
			"--api-client-id",
			"client-123",
			"--identity-authority",
			"https://login.example.test/",
		])
		.into_config()
		.expect("Auth configuration should validate.");
		let auth = config.auth.expect("Auth should be enabled.");

		assert_eq!(auth.issuer, "https://login.example.test/contoso/v2.0");
		assert_eq!(
			auth.discovery_url.as_str(),
			"https://login.example.test/contoso/v2.0/.well-known/openid-configuration"
		);
		assert_eq!(auth.audience, "client-123");
		assert_eq!(auth.refresh_cooldown, Duration::from_secs(30));
	}

	#[test]
	fn explicit_audience_wins_over_client_id() {
		let config = parse(&[
			"--auth-enabled",
			"yes",
			"--tenant-id",
			"contoso",
			"--api-audience",
			"api://gateway",
			"--api-client-id",
			"client-123",
		])
		.into_config()
		.expect("Auth configuration should validate.");

		assert_eq!(config.auth.expect("Auth should be enabled.").audience, "api://gateway");
	}

	#[test]
	fn enabled_auth_requires_tenant_and_audience() {
		let err = parse(&["--auth-enabled", "true", "--api-audience", "api://gateway"])
			.into_config()
			.expect_err("Missing tenant should be rejected.");

		assert!(matches!(err, ConfigError::MissingSetting { name: "TENANT_ID" }));

		let err = parse(&["--auth-enabled", "true", "--tenant-id", "contoso"])
			.into_config()
			.expect_err("Missing audience should be rejected.");

		assert!(matches!(err, ConfigError::MissingSetting { name: "API_AUDIENCE" }));
	}

	#[test]
	fn upstream_settings_are_required() {
		let mut args = parse(&[]);

		args.upstream_deployment = Some("   ".into());

		assert!(matches!(
			args.into_config(),
			Err(ConfigError::MissingSetting { name: "AZURE_OPENAI_DEPLOYMENT" })
		));

		let mut args = parse(&[]);

		args.upstream_endpoint = Some("not a url".into());

		assert!(matches!(
			args.into_config(),
			Err(ConfigError::InvalidUrl { name: "AZURE_OPENAI_ENDPOINT", .. })
		));
	}

	#[test]
	fn zero_limits_are_rejected() {
		for flag in ["--max-prompt-chars", "--max-tokens-hard-limit", "--rate-limit-per-minute"] {
			let err = parse(&[flag, "0"]).into_config().expect_err("Zero limits should be rejected.");

			assert!(matches!(err, ConfigError::InvalidSetting { .. }), "{flag} accepted zero.");
		}
	}

	#[test]
	fn api_key_is_redacted_in_debug_output() {
		let config = parse(&["--upstream-api-key", "super-secret"])
			.into_config()
			.expect("Configuration should validate.");

		assert_eq!(config.upstream.api_key.as_ref().map(Secret::expose), Some("super-secret"));
		assert!(!format!("{config:?}").contains("super-secret"));
	}

	#[test]
	fn bad_listen_address_is_rejected() {
		let err = parse(&["--listen-addr", "localhost"])
			.into_config()
			.expect_err("Host names are not socket addresses.");

		assert!(matches!(err, ConfigError::InvalidSetting { name: "GATEWAY_LISTEN_ADDR", .. }));
	}
}
