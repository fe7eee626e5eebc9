//! Bearer token verification.

// crates.io
use jsonwebtoken::{Algorithm, Validation, errors::ErrorKind};
// self
use crate::{
	_prelude::*,
	auth::{SigningKeySet, VerifiedClaims},
	error::AuthError,
};

const BEARER_PREFIX: &str = "bearer ";

/// Verifies RS256 bearer tokens issued by one identity provider for one audience.
///
/// Only RS256 is accepted regardless of what the token header claims, so `none` and HMAC
/// downgrade attempts fail before any key is consulted.
#[derive(Debug)]
pub struct TokenVerifier {
	keys: Arc<SigningKeySet>,
	issuer: String,
	audience: String,
}
impl TokenVerifier {
	/// Creates a verifier trusting `issuer` and requiring `audience`.
	pub fn new(keys: Arc<SigningKeySet>, issuer: impl Into<String>, audience: impl Into<String>) -> Self {
		Self { keys, issuer: issuer.into(), audience: audience.into() }
	}

	/// Trusted issuer.
	pub fn issuer(&self) -> &str {
		&self.issuer
	}

	/// Required audience.
	pub fn audience(&self) -> &str {
		&self.audience
	}

	/// Signing keys consulted by this verifier.
	pub fn keys(&self) -> &Arc<SigningKeySet> {
		&self.keys
	}

	/// Verifies the raw `Authorization` header value and returns the token's claims.
	///
	/// The header must use the `Bearer` scheme (case-insensitive). Nothing about the token is
	/// logged.
	pub async fn verify(&self, authorization: Option<&str>) -> Result<VerifiedClaims, AuthError> {
		let token = bearer_token(authorization).ok_or(AuthError::MissingToken)?;
		let header = jsonwebtoken::decode_header(token).map_err(|_| AuthError::InvalidToken)?;

		if header.alg != Algorithm::RS256 {
			tracing::debug!(alg = ?header.alg, "Rejected token with disallowed algorithm.");

			return Err(AuthError::InvalidToken);
		}

		let kid = header.kid.as_deref().filter(|kid| !kid.is_empty()).ok_or(AuthError::InvalidToken)?;
		let key = self.keys.resolve(kid).await.ok_or(AuthError::InvalidToken)?;
		let data = jsonwebtoken::decode::<VerifiedClaims>(token, &key, &self.validation())
			.map_err(|e| classify(e.kind()))?;
		let claims = data.claims;

		if claims.is_expired_at(OffsetDateTime::now_utc()) {
			return Err(AuthError::TokenExpired);
		}

		Ok(claims)
	}

	fn validation(&self) -> Validation {
		let mut validation = Validation::new(Algorithm::RS256);

		validation.leeway = 0;
		validation.validate_exp = true;
		validation.validate_nbf = true;
		validation.set_required_spec_claims(&["exp", "iss", "aud"]);
		validation.set_issuer(&[&self.issuer]);
		validation.set_audience(&[&self.audience]);

		validation
	}
}

fn bearer_token(authorization: Option<&str>) -> Option<&str> {
	let value = authorization?.trim();

	if value.len() < BEARER_PREFIX.len()
		|| !value.is_char_boundary(BEARER_PREFIX.len())
		|| !value[..BEARER_PREFIX.len()].eq_ignore_ascii_case(BEARER_PREFIX)
	{
		return None;
	}

	Some(value[BEARER_PREFIX.len()..].trim()).filter(|token| !token.is_empty())
}

fn classify(kind: &ErrorKind) -> AuthError {
	match kind {
		ErrorKind::ExpiredSignature => AuthError::TokenExpired,
		ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
		ErrorKind::InvalidAudience => AuthError::InvalidAudience,
		_ => AuthError::InvalidToken,
	}
}

#[cfg(test)]
mod tests {
	// crates.io
	use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
	use jsonwebtoken::{EncodingKey, Header};
	// self
	use super::*;
	use crate::{_preludet::*, auth::StaticKeySetSource};

	fn verifier() -> TokenVerifier {
		let source = Arc::new(StaticKeySetSource::new(test_jwk_set(["test-kid"])));
		let keys = Arc::new(SigningKeySet::new(source).with_refresh_cooldown(Duration::ZERO));

		TokenVerifier::new(keys, TEST_ISSUER, TEST_AUDIENCE)
	}

	fn bearer(token: &str) -> String {
		format!("Bearer {token}")
	}

	#[test]
	fn bearer_prefix_is_case_insensitive() {
		assert_eq!(bearer_token(Some("Bearer abc")), Some("abc"));
		assert_eq!(bearer_token(Some("bearer abc")), Some("abc"));
		assert_eq!(bearer_token(Some("BEARER   abc  ")), Some("abc"));
		assert_eq!(bearer_token(Some("Bearer ")), None);
		assert_eq!(bearer_token(Some("Basic abc")), None);
		assert_eq!(bearer_token(Some("Bearerabc")), None);
		assert_eq!(bearer_token(Some("béarer abc")), None);
		assert_eq!(bearer_token(None), None);
	}

	#[tokio::test]
	async fn valid_token_yields_claims() {
		let token = sign_test_token("test-kid", &test_claims("user-1", 300));
		let claims = verifier()
			.verify(Some(&bearer(&token)))
			.await
			.expect("Valid token should verify.");

		assert_eq!(claims.sub.as_deref(), Some("user-1"));
		assert_eq!(claims.iss, TEST_ISSUER);
		assert!(claims.aud.contains(TEST_AUDIENCE));
	}

	#[tokio::test]
	async fn missing_or_malformed_headers_are_rejected() {
		let verifier = verifier();

		assert_eq!(verifier.verify(None).await, Err(AuthError::MissingToken));
		assert_eq!(verifier.verify(Some("Bearer ")).await, Err(AuthError::MissingToken));
		assert_eq!(verifier.verify(Some("Token abc")).await, Err(AuthError::MissingToken));
		assert_eq!(verifier.verify(Some("Bearer not-a-jwt")).await, Err(AuthError::InvalidToken));
	}

	#[tokio::test]
	async fn expired_token_is_reported_as_expired() {
		let token = sign_test_token("test-kid", &test_claims("user-1", -60));

		assert_eq!(verifier().verify(Some(&bearer(&token))).await, Err(AuthError::TokenExpired));
	}

	#[tokio::test]
	async fn not_yet_valid_token_is_invalid() {
		let now = OffsetDateTime::now_utc().unix_timestamp();
		let mut future = test_claims("user-1", 7_200);

		future["nbf"] = (now + 3_600).into();

		let mut current = test_claims("user-1", 7_200);

		current["nbf"] = (now - 10).into();

		let verifier = verifier();
		let future_token = sign_test_token("test-kid", &future);
		let current_token = sign_test_token("test-kid", &current);

		assert_eq!(verifier.verify(Some(&bearer(&future_token))).await, Err(AuthError::InvalidToken));
		assert!(verifier.verify(Some(&bearer(&current_token))).await.is_ok());
	}

	#[tokio::test]
	async fn issuer_and_audience_mismatches_are_distinct() {
		let mut wrong_issuer = test_claims("user-1", 300);

		wrong_issuer["iss"] = "https://evil.example.test/v2.0".into();

		let mut wrong_audience = test_claims("user-1", 300);

		wrong_audience["aud"] = "api://someone-else".into();

		let verifier = verifier();
		let issuer_token = sign_test_token("test-kid", &wrong_issuer);
		let audience_token = sign_test_token("test-kid", &wrong_audience);

		assert_eq!(verifier.verify(Some(&bearer(&issuer_token))).await, Err(AuthError::InvalidIssuer));
		assert_eq!(
			verifier.verify(Some(&bearer(&audience_token))).await,
			Err(AuthError::InvalidAudience)
		);
	}

	#[tokio::test]
	async fn missing_required_claims_are_invalid() {
		let mut claims = test_claims("user-1", 300);

		claims.as_object_mut().expect("Claims fixture is an object.").remove("aud");

		let token = sign_test_token("test-kid", &claims);

		assert_eq!(verifier().verify(Some(&bearer(&token))).await, Err(AuthError::InvalidToken));
	}

	#[tokio::test]
	async fn unknown_kid_is_invalid() {
		let token = sign_test_token("rotated-away", &test_claims("user-1", 300));

		assert_eq!(verifier().verify(Some(&bearer(&token))).await, Err(AuthError::InvalidToken));
	}

	#[tokio::test]
	async fn downgraded_algorithms_are_rejected() {
		let claims = test_claims("user-1", 300);
		let mut hmac_header = Header::new(Algorithm::HS256);

		hmac_header.kid = Some("test-kid".into());

		// HMAC keyed with the public modulus: the classic RS/HS confusion attack.
		let hmac_token = jsonwebtoken::encode(
			&hmac_header,
			&claims,
			&EncodingKey::from_secret(TEST_RSA_MODULUS.as_bytes()),
		)
		.expect("HMAC token should sign.");
		let unsigned_header = URL_SAFE_NO_PAD.encode(r#"{"alg":"none","kid":"test-kid"}"#);
		let unsigned_body = URL_SAFE_NO_PAD.encode(claims.to_string());
		let unsigned_token = format!("{unsigned_header}.{unsigned_body}.");
		let verifier = verifier();

		assert_eq!(verifier.verify(Some(&bearer(&hmac_token))).await, Err(AuthError::InvalidToken));
		assert_eq!(
			verifier.verify(Some(&bearer(&unsigned_token))).await,
			Err(AuthError::InvalidToken)
		);
	}

	#[tokio::test]
	async fn tampered_payload_fails_signature_check() {
		let token = sign_test_token("test-kid", &test_claims("user-1", 300));
		let mut parts = token.split('.').map(str::to_owned).collect::<Vec<_>>();

		parts[1] = URL_SAFE_NO_PAD.encode(test_claims("admin", 300).to_string());

		let forged = parts.join(".");

		assert_eq!(verifier().verify(Some(&bearer(&forged))).await, Err(AuthError::InvalidToken));
	}
}
