//! Per-request identifiers: correlation ids and the opaque caller keys used for rate accounting.

// std
use std::{borrow::Borrow, net::IpAddr, ops::Deref};
// crates.io
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use sha2::{Digest, Sha256};
// self
use crate::{_prelude::*, auth::VerifiedClaims};

macro_rules! def_id {
	($name:ident, $doc:literal, $kind:literal) => {
		#[doc = $doc]
		#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
		#[serde(try_from = "String", into = "String")]
		pub struct $name(String);
		impl $name {
			/// Creates a new identifier after validation.
			pub fn new(value: impl AsRef<str>) -> Result<Self, IdentifierError> {
				let view = value.as_ref();

				validate_view($kind, view)?;

				Ok(Self(view.to_owned()))
			}
		}
		impl Deref for $name {
			type Target = str;

			fn deref(&self) -> &Self::Target {
				&self.0
			}
		}
		impl AsRef<str> for $name {
			fn as_ref(&self) -> &str {
				&self.0
			}
		}
		impl From<$name> for String {
			fn from(value: $name) -> Self {
				value.0
			}
		}
		impl TryFrom<String> for $name {
			type Error = IdentifierError;

			fn try_from(value: String) -> Result<Self, Self::Error> {
				validate_view($kind, &value)?;

				Ok(Self(value))
			}
		}
		impl Borrow<str> for $name {
			fn borrow(&self) -> &str {
				&self.0
			}
		}
		impl Debug for $name {
			fn fmt(&self, f: &mut Formatter) -> FmtResult {
				write!(f, concat!($kind, "({})"), self.0)
			}
		}
		impl Display for $name {
			fn fmt(&self, f: &mut Formatter) -> FmtResult {
				f.write_str(&self.0)
			}
		}
		impl FromStr for $name {
			type Err = IdentifierError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				Self::new(s)
			}
		}
	};
}

const IDENTIFIER_MAX_LEN: usize = 128;
const CALLER_KEY_LEN: usize = 16;
const UNKNOWN: &str = "unknown";

/// Error returned when identifier validation fails.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, ThisError)]
pub enum IdentifierError {
	/// The identifier was empty.
	#[error("{kind} identifier cannot be empty.")]
	Empty {
		/// Kind of identifier (request, caller).
		kind: &'static str,
	},
	/// The identifier contains whitespace characters.
	#[error("{kind} identifier contains whitespace.")]
	ContainsWhitespace {
		/// Kind of identifier (request, caller).
		kind: &'static str,
	},
	/// The identifier exceeded the allowed character count.
	#[error("{kind} identifier exceeds {max} characters.")]
	TooLong {
		/// Kind of identifier (request, caller).
		kind: &'static str,
		/// Maximum permitted character count.
		max: usize,
	},
}

def_id! { RequestId, "Correlation identifier attached to every log record of one request.", "Request" }
def_id! { CallerKey, "Opaque key that buckets rate-limit accounting per logical caller.", "Caller" }

impl RequestId {
	/// Generates a fresh random identifier.
	pub fn generate() -> Self {
		Self(uuid::Uuid::new_v4().to_string())
	}

	/// Accepts a caller-supplied identifier, generating a fresh one when it is absent or invalid.
	pub fn from_header(value: Option<&str>) -> Self {
		value.and_then(|raw| Self::new(raw).ok()).unwrap_or_else(Self::generate)
	}
}

impl CallerKey {
	/// Derives a key from a verified identity, preferring the object id over the subject.
	///
	/// Returns `None` when the claims carry neither.
	pub fn from_claims(claims: &VerifiedClaims) -> Option<Self> {
		claims.subject().map(|subject| Self(digest(["sub", subject])))
	}

	/// Derives the coarse key used when no verified identity is available.
	pub fn from_metadata(metadata: &CallerMetadata) -> Self {
		let ip = metadata.peer_ip.map(|ip| ip.to_string());
		let ip = ip.as_deref().map(str::trim).filter(|v| !v.is_empty()).unwrap_or(UNKNOWN);
		let agent =
			metadata.user_agent.as_deref().map(str::trim).filter(|v| !v.is_empty()).unwrap_or(UNKNOWN);

		Self(digest([ip, agent]))
	}
}

/// Transport-level facts about the caller, captured before authentication.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallerMetadata {
	/// Network source address, when the transport exposes one.
	pub peer_ip: Option<IpAddr>,
	/// `User-Agent` header value.
	pub user_agent: Option<String>,
}
impl CallerMetadata {
	/// Creates metadata for the given peer address.
	pub fn new(peer_ip: Option<IpAddr>) -> Self {
		Self { peer_ip, user_agent: None }
	}

	/// Attaches the `User-Agent` header value.
	pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
		self.user_agent = Some(user_agent.into());

		self
	}
}

fn digest<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
	let mut hasher = Sha256::new();

	for (idx, part) in parts.into_iter().enumerate() {
		if idx > 0 {
			hasher.update(b"|");
		}

		hasher.update(part.as_bytes());
	}

	let mut encoded = URL_SAFE_NO_PAD.encode(hasher.finalize());

	encoded.truncate(CALLER_KEY_LEN);

	encoded
}

fn validate_view(kind: &'static str, view: &str) -> Result<(), IdentifierError> {
	if view.is_empty() {
		return Err(IdentifierError::Empty { kind });
	}
	if view.chars().any(char::is_whitespace) {
		return Err(IdentifierError::ContainsWhitespace { kind });
	}
	if view.chars().count() > IDENTIFIER_MAX_LEN {
		return Err(IdentifierError::TooLong { kind, max: IDENTIFIER_MAX_LEN });
	}

	Ok(())
}
