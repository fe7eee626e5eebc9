//! HTTP surface: `GET /health` and `POST /chat` over axum.
//!
//! A request-context middleware assigns every request an id (honoring a valid inbound
//! `x-request-id`), echoes it on the response, and writes one `request_complete` access record
//! on the `chat_gateway::access` target. Failures are answered as `{"detail": "..."}`.

// std
use std::{borrow::Cow, net::SocketAddr};
// crates.io
use axum::{
	Json, Router,
	body::to_bytes,
	extract::{ConnectInfo, Request, State},
	http::{
		HeaderMap, HeaderValue, StatusCode,
		header::{AUTHORIZATION, AsHeaderName, RETRY_AFTER, USER_AGENT, WWW_AUTHENTICATE},
	},
	middleware::{self, Next},
	response::{IntoResponse, Response},
	routing::{get, post},
};
use tokio::net::TcpListener;
// self
use crate::{
	_prelude::*,
	caller::{CallerMetadata, RequestId},
	pipeline::{CHAT_PATH, ChatCommand, RequestPipeline},
};

/// Header carrying the request correlation id in both directions.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Largest accepted `/chat` body.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Builds the gateway router around a shared pipeline.
pub fn router(pipeline: Arc<RequestPipeline>) -> Router {
	Router::new()
		.route("/health", get(health))
		.route(CHAT_PATH, post(chat))
		.fallback(not_found)
		.method_not_allowed_fallback(method_not_allowed)
		.layer(middleware::from_fn(request_context))
		.with_state(pipeline)
}

/// Serves the router on `listener` until `shutdown` resolves, then drains in-flight requests.
pub async fn serve<F>(
	listener: TcpListener,
	pipeline: Arc<RequestPipeline>,
	shutdown: F,
) -> std::io::Result<()>
where
	F: 'static + Send + Future<Output = ()>,
{
	axum::serve(listener, router(pipeline).into_make_service_with_connect_info::<SocketAddr>())
		.with_graceful_shutdown(shutdown)
		.await
}

/// Renders a gateway error as a JSON `detail` response with the matching status and headers.
pub fn error_response(err: &Error) -> Response {
	let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
	let mut response = (status, Json(ErrorBody { detail: err.detail() })).into_response();
	let headers = response.headers_mut();

	if status == StatusCode::UNAUTHORIZED {
		headers.insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
	}
	if let Some(retry_after) = err.retry_after().filter(|_| status == StatusCode::TOO_MANY_REQUESTS) {
		headers.insert(RETRY_AFTER, HeaderValue::from(retry_after_secs(retry_after)));
	}

	response
}

#[derive(Serialize)]
struct ErrorBody {
	detail: Cow<'static, str>,
}

async fn health() -> Json<serde_json::Value> {
	Json(serde_json::json!({ "status": "ok", "build": env!("CARGO_PKG_VERSION") }))
}

async fn not_found() -> Response {
	(StatusCode::NOT_FOUND, Json(ErrorBody { detail: Cow::Borrowed("Not Found") })).into_response()
}

async fn method_not_allowed() -> Response {
	(StatusCode::METHOD_NOT_ALLOWED, Json(ErrorBody { detail: Cow::Borrowed("Method Not Allowed") }))
		.into_response()
}

async fn chat(State(pipeline): State<Arc<RequestPipeline>>, request: Request) -> Response {
	let (parts, body) = request.into_parts();
	let request_id = parts
		.extensions
		.get::<RequestId>()
		.cloned()
		.unwrap_or_else(|| RequestId::from_header(header_str(&parts.headers, REQUEST_ID_HEADER)));
	let peer_ip = parts.extensions.get::<ConnectInfo<SocketAddr>>().map(|info| info.0.ip());
	let mut caller = CallerMetadata::new(peer_ip);

	if let Some(agent) = header_str(&parts.headers, USER_AGENT) {
		caller = caller.with_user_agent(agent);
	}

	// An unreadable or oversized body becomes an empty one, which the pipeline rejects as
	// invalid once authentication and metering have run.
	let body = match to_bytes(body, MAX_BODY_BYTES).await {
		Ok(bytes) => bytes.to_vec(),
		Err(e) => {
			tracing::debug!(request_id = %request_id, error = %e, "Request body could not be read.");

			Vec::new()
		},
	};
	let mut command = ChatCommand::new(request_id, body).with_caller(caller);

	if let Some(authorization) = header_str(&parts.headers, AUTHORIZATION) {
		command = command.with_authorization(authorization);
	}

	match pipeline.handle(command).await {
		Ok(reply) => Json(reply).into_response(),
		Err(e) => error_response(&e),
	}
}

async fn request_context(mut request: Request, next: Next) -> Response {
	let started = Instant::now();
	let request_id = RequestId::from_header(header_str(request.headers(), REQUEST_ID_HEADER));
	let path = request.uri().path().to_owned();
	let method = request.method().clone();

	request.extensions_mut().insert(request_id.clone());

	let mut response = next.run(request).await;

	if let Ok(value) = HeaderValue::from_str(&request_id) {
		response.headers_mut().insert(REQUEST_ID_HEADER, value);
	}

	tracing::info!(
		target: "chat_gateway::access",
		request_id = %request_id,
		path = %path,
		method = %method,
		status_code = response.status().as_u16(),
		latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
		"request_complete"
	);

	response
}

fn header_str<K>(headers: &HeaderMap, name: K) -> Option<&str>
where
	K: AsHeaderName,
{
	headers.get(name).and_then(|value| value.to_str().ok())
}

fn retry_after_secs(retry_after: Duration) -> u64 {
	let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);

	secs.max(1)
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::error::{AuthError, UpstreamError};

	#[test]
	fn retry_after_rounds_up_to_whole_seconds() {
		assert_eq!(retry_after_secs(Duration::ZERO), 1);
		assert_eq!(retry_after_secs(Duration::from_millis(200)), 1);
		assert_eq!(retry_after_secs(Duration::from_secs(2)), 2);
		assert_eq!(retry_after_secs(Duration::from_millis(2_001)), 3);
	}

	#[test]
	fn unauthorized_responses_challenge_for_bearer() {
		let response = error_response(&AuthError::TokenExpired.into());

		assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
		assert_eq!(response.headers().get(WWW_AUTHENTICATE), Some(&HeaderValue::from_static("Bearer")));
		assert!(response.headers().get(RETRY_AFTER).is_none());
	}

	#[test]
	fn throttled_responses_carry_retry_after() {
		let local = error_response(&Error::RateLimited { retry_after: Duration::from_millis(12_500) });
		let upstream = error_response(
			&UpstreamError::RateLimited { retry_after: Some(Duration::from_secs(4)) }.into(),
		);
		let hintless = error_response(&UpstreamError::RateLimited { retry_after: None }.into());

		assert_eq!(local.headers().get(RETRY_AFTER), Some(&HeaderValue::from(13_u64)));
		assert_eq!(upstream.headers().get(RETRY_AFTER), Some(&HeaderValue::from(4_u64)));
		assert!(hintless.headers().get(RETRY_AFTER).is_none());
	}

	#[tokio::test]
	async fn error_bodies_only_carry_detail() {
		let response = error_response(&Error::unexpected("secret internals"));
		let bytes = to_bytes(response.into_body(), MAX_BODY_BYTES)
			.await
			.expect("Error body should be readable.");
		let body: serde_json::Value =
			serde_json::from_slice(&bytes).expect("Error body should be JSON.");

		assert_eq!(body, serde_json::json!({ "detail": "Internal server error." }));
	}
}
