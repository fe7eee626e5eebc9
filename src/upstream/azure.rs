//! Azure OpenAI chat-completions backend over reqwest.

// crates.io
use reqwest::{
	StatusCode,
	header::{HeaderMap, RETRY_AFTER},
};
use time::format_description::well_known::Rfc2822;
// self
use crate::{
	_prelude::*,
	config::UpstreamConfig,
	error::ConfigError,
	secret::Secret,
	upstream::{Completion, CompletionBackend, CompletionFuture, UpstreamFailure},
};

const API_KEY_HEADER: &str = "api-key";

/// [`CompletionBackend`] calling one Azure OpenAI chat deployment.
///
/// Requests never follow redirects. The deployment name is reported as the model.
#[derive(Clone)]
pub struct AzureOpenAiBackend {
	client: ReqwestClient,
	completions_url: Url,
	deployment: String,
	api_key: Option<Secret>,
}
impl AzureOpenAiBackend {
	/// Creates a backend that reuses `client`.
	pub fn new(client: ReqwestClient, config: &UpstreamConfig) -> Result<Self, ConfigError> {
		Ok(Self {
			client,
			completions_url: completions_url(
				&config.endpoint,
				&config.deployment,
				&config.api_version,
			)?,
			deployment: config.deployment.clone(),
			api_key: config.api_key.clone(),
		})
	}

	/// Creates a backend with its own client bounded by the configured timeout.
	pub fn from_config(config: &UpstreamConfig) -> Result<Self, ConfigError> {
		let client = ReqwestClient::builder()
			.timeout(config.timeout)
			.redirect(reqwest::redirect::Policy::none())
			.build()?;

		Self::new(client, config)
	}

	/// Fully-qualified chat-completions URL, including `api-version`.
	pub fn completions_url(&self) -> &Url {
		&self.completions_url
	}

	async fn send(&self, prompt: &str, max_tokens: u32) -> Result<Completion, UpstreamFailure> {
		let body = ChatCompletionRequest {
			messages: [ChatMessage { role: "user", content: prompt }],
			max_tokens,
		};
		let mut request = self.client.post(self.completions_url.clone()).json(&body);

		if let Some(key) = &self.api_key {
			request = request.header(API_KEY_HEADER, key.expose());
		}

		let response = request.send().await.map_err(transport_failure)?;
		let status = response.status();

		if status == StatusCode::TOO_MANY_REQUESTS {
			return Err(UpstreamFailure::RateLimited {
				retry_after: parse_retry_after(response.headers()),
			});
		}
		if !status.is_success() {
			return Err(UpstreamFailure::Api {
				status: Some(status.as_u16()),
				message: status.canonical_reason().unwrap_or("non-success status").to_owned(),
			});
		}

		let bytes = response.bytes().await.map_err(transport_failure)?;
		let mut deserializer = serde_json::Deserializer::from_slice(&bytes);
		let parsed: ChatCompletionResponse = serde_path_to_error::deserialize(&mut deserializer)
			.map_err(|e| UpstreamFailure::Unexpected {
				message: format!("completion body did not parse at `{}`", e.path()),
			})?;
		let choice = parsed.choices.into_iter().next().ok_or_else(|| {
			UpstreamFailure::Unexpected { message: "completion contained no choices".into() }
		})?;

		Ok(Completion {
			text: choice.message.content.unwrap_or_default(),
			model: self.deployment.clone(),
		})
	}
}
impl CompletionBackend for AzureOpenAiBackend {
	fn model(&self) -> &str {
		&self.deployment
	}

	fn complete<'a>(&'a self, prompt: &'a str, max_tokens: u32) -> CompletionFuture<'a> {
		Box::pin(self.send(prompt, max_tokens))
	}
}
impl Debug for AzureOpenAiBackend {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("AzureOpenAiBackend")
			.field("completions_url", &self.completions_url.as_str())
			.field("deployment", &self.deployment)
			.field("api_key", &self.api_key)
			.finish()
	}
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
	messages: [ChatMessage<'a>; 1],
	max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
	role: &'static str,
	content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
	choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
	message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
	#[serde(default)]
	content: Option<String>,
}

fn completions_url(endpoint: &Url, deployment: &str, api_version: &str) -> Result<Url, ConfigError> {
	let invalid = || ConfigError::InvalidSetting {
		name: "AZURE_OPENAI_ENDPOINT",
		reason: "endpoint must be a hierarchical http(s) URL".into(),
	};

	if !matches!(endpoint.scheme(), "http" | "https") {
		return Err(invalid());
	}

	let mut url = endpoint.clone();

	url.set_query(None);
	url.path_segments_mut()
		.map_err(|_| invalid())?
		.pop_if_empty()
		.extend(["openai", "deployments", deployment, "chat", "completions"]);
	url.query_pairs_mut().append_pair("api-version", api_version);

	Ok(url)
}

fn transport_failure(e: ReqwestError) -> UpstreamFailure {
	let e = e.without_url();

	if e.is_timeout() {
		UpstreamFailure::Timeout
	} else if e.is_builder() || e.is_decode() {
		UpstreamFailure::Unexpected { message: e.to_string() }
	} else {
		UpstreamFailure::Api { status: None, message: e.to_string() }
	}
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
	let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

	if let Ok(secs) = raw.parse::<u64>() {
		return Some(Duration::from_secs(secs));
	}
	if let Ok(moment) = OffsetDateTime::parse(raw, &Rfc2822) {
		let delta = moment - OffsetDateTime::now_utc();

		if delta.is_positive() {
			return Duration::try_from(delta).ok();
		}
	}

	None
}
