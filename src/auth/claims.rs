//! Validated claim set carried for the lifetime of one request.

// crates.io
use serde_json::{Map, Value};
// self
use crate::_prelude::*;

/// `aud` claim, which identity providers emit either as a string or as an array.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
	/// Single audience.
	Single(String),
	/// Multiple audiences.
	Many(Vec<String>),
}
impl Audience {
	/// Returns true if `expected` is one of the audiences.
	pub fn contains(&self, expected: &str) -> bool {
		match self {
			Self::Single(value) => value == expected,
			Self::Many(values) => values.iter().any(|value| value == expected),
		}
	}
}

/// Claims decoded from a token whose signature, issuer, audience, and expiry were verified.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VerifiedClaims {
	/// Token issuer.
	pub iss: String,
	/// Intended audience(s).
	pub aud: Audience,
	/// Expiry as seconds since the Unix epoch.
	pub exp: i64,
	/// Subject identifier.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub sub: Option<String>,
	/// Directory object id (Entra ID); stable across applications.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub oid: Option<String>,
	/// Tenant id.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tid: Option<String>,
	/// Issued-at as seconds since the Unix epoch.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub iat: Option<i64>,
	/// Remaining claims.
	#[serde(flatten)]
	pub extra: Map<String, Value>,
}
impl VerifiedClaims {
	/// Identity used to key per-caller accounting: a non-empty `oid`, else a non-empty `sub`.
	pub fn subject(&self) -> Option<&str> {
		let present = |value: &&str| !value.is_empty();

		self.oid.as_deref().filter(present).or_else(|| self.sub.as_deref().filter(present))
	}

	/// Returns true if the token has expired at the provided instant.
	pub fn is_expired_at(&self, instant: OffsetDateTime) -> bool {
		self.exp < instant.unix_timestamp()
	}
}
