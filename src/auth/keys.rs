//! Signing key set cache with refresh-on-unknown-key semantics.
//!
//! [`SigningKeySet`] keeps the identity provider's RSA verification keys in a read-mostly map.
//! Lookups only take the read lock. When a token names a key id the cache does not know, the
//! set re-fetches from its [`KeySetSource`]; refreshes are singleflighted so concurrent misses
//! share one fetch, and a cooldown bounds how often forged key ids can force a fetch.

// std
use std::{
	collections::VecDeque,
	sync::atomic::{AtomicUsize, Ordering},
};
// crates.io
use jsonwebtoken::{
	DecodingKey,
	jwk::{AlgorithmParameters, Jwk, JwkSet, KeyAlgorithm, PublicKeyUse},
};
use serde::de::DeserializeOwned;
// self
use crate::{_prelude::*, error::ConfigError};

/// Boxed future returned by [`KeySetSource::fetch`].
pub type KeySetFuture<'a> = Pin<Box<dyn Future<Output = Result<JwkSet, KeySetError>> + 'a + Send>>;

/// Default minimum spacing between two key set refreshes.
pub const DEFAULT_REFRESH_COOLDOWN: Duration = Duration::from_secs(30);

/// Where published signing keys come from.
pub trait KeySetSource
where
	Self: Send + Sync,
{
	/// Fetches the current key set.
	fn fetch(&self) -> KeySetFuture<'_>;
}

/// Failures while fetching or decoding a key set.
#[derive(Debug, ThisError)]
pub enum KeySetError {
	/// Network failure talking to the identity provider.
	#[error("Network error occurred while fetching signing keys.")]
	Transport {
		/// Transport failure.
		#[source]
		source: ReqwestError,
	},
	/// Identity provider answered with a non-success status.
	#[error("Identity provider returned status {status} for {url}.")]
	Status {
		/// Requested URL.
		url: Url,
		/// HTTP status code.
		status: u16,
	},
	/// Response body was not the expected JSON document.
	#[error("Identity provider returned malformed JSON for {url}.")]
	Parse {
		/// Requested URL.
		url: Url,
		/// Structured parsing failure.
		#[source]
		source: serde_path_to_error::Error<serde_json::Error>,
	},
	/// Discovery document named an unusable `jwks_uri`.
	#[error("Discovery document contains an invalid jwks_uri.")]
	InvalidJwksUri {
		/// Underlying parsing failure.
		#[source]
		source: url::ParseError,
	},
	/// Key set contained no RSA signing keys.
	#[error("Key set contains no usable RS256 signing keys.")]
	NoUsableKeys,
	/// Source has nothing to serve.
	#[error("Key set source is unavailable: {reason}.")]
	Unavailable {
		/// Why the source cannot serve keys.
		reason: String,
	},
}

/// Read-mostly cache of decoding keys indexed by key id.
pub struct SigningKeySet {
	source: Arc<dyn KeySetSource>,
	keys: RwLock<Arc<HashMap<String, DecodingKey>>>,
	refresh_gate: AsyncMutex<Option<Instant>>,
	refresh_cooldown: Duration,
}
impl SigningKeySet {
	/// Creates an empty set backed by `source`; keys load on first use.
	pub fn new(source: Arc<dyn KeySetSource>) -> Self {
		Self {
			source,
			keys: RwLock::new(Arc::new(HashMap::new())),
			refresh_gate: AsyncMutex::new(None),
			refresh_cooldown: DEFAULT_REFRESH_COOLDOWN,
		}
	}

	/// Overrides the minimum spacing between refreshes triggered by unknown key ids.
	pub fn with_refresh_cooldown(mut self, cooldown: Duration) -> Self {
		self.refresh_cooldown = cooldown;

		self
	}

	/// Number of cached keys.
	pub fn len(&self) -> usize {
		self.keys.read().len()
	}

	/// Returns true if no keys are cached.
	pub fn is_empty(&self) -> bool {
		self.keys.read().is_empty()
	}

	/// Returns true if `kid` is cached.
	pub fn contains(&self, kid: &str) -> bool {
		self.keys.read().contains_key(kid)
	}

	/// Resolves the decoding key for `kid`, refreshing the set once if the id is unknown.
	///
	/// Returns `None` when the key is still unknown after the refresh, when the refresh fails,
	/// or when a refresh ran within the cooldown window.
	pub async fn resolve(&self, kid: &str) -> Option<DecodingKey> {
		if let Some(key) = self.lookup(kid) {
			return Some(key);
		}

		let mut last_refresh = self.refresh_gate.lock().await;

		// Another request may have refreshed while this one waited on the gate.
		if let Some(key) = self.lookup(kid) {
			return Some(key);
		}
		if let Some(at) = *last_refresh {
			if at.elapsed() < self.refresh_cooldown {
				tracing::debug!(kid, "Unknown signing key id within refresh cooldown.");

				return None;
			}
		}

		match self.refresh_locked(&mut last_refresh).await {
			Ok(count) => tracing::info!(kid, keys = count, "Signing keys refreshed."),
			Err(e) => tracing::warn!(kid, error = %e, "Signing key refresh failed."),
		}

		self.lookup(kid)
	}

	/// Fetches the key set now, ignoring the cooldown.
	///
	/// Returns the number of usable keys loaded. On failure the previous keys stay cached.
	pub async fn refresh(&self) -> Result<usize, KeySetError> {
		let mut last_refresh = self.refresh_gate.lock().await;

		self.refresh_locked(&mut last_refresh).await
	}

	fn lookup(&self, kid: &str) -> Option<DecodingKey> {
		self.keys.read().get(kid).cloned()
	}

	async fn refresh_locked(&self, last_refresh: &mut Option<Instant>) -> Result<usize, KeySetError> {
		let fetched = self.source.fetch().await;

		*last_refresh = Some(Instant::now());

		let keys = decode_key_set(&fetched?);

		if keys.is_empty() {
			return Err(KeySetError::NoUsableKeys);
		}

		let count = keys.len();

		*self.keys.write() = Arc::new(keys);

		Ok(count)
	}
}
impl Debug for SigningKeySet {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		let keys = self.keys.read();
		let mut kids = keys.keys().map(String::as_str).collect::<Vec<_>>();

		kids.sort_unstable();

		f.debug_struct("SigningKeySet")
			.field("kids", &kids)
			.field("refresh_cooldown", &self.refresh_cooldown)
			.finish()
	}
}

/// Source that discovers `jwks_uri` from an OpenID Connect discovery document.
///
/// The discovered URI is cached after the first successful discovery; the key set itself is
/// fetched on every call.
#[derive(Debug)]
pub struct OidcKeySetSource {
	client: ReqwestClient,
	discovery_url: Url,
	jwks_uri: Mutex<Option<Url>>,
}
impl OidcKeySetSource {
	/// Creates a source that reuses `client`.
	pub fn new(client: ReqwestClient, discovery_url: Url) -> Self {
		Self { client, discovery_url, jwks_uri: Mutex::new(None) }
	}

	/// Creates a source with its own client bounded by `timeout` per request.
	pub fn with_timeout(discovery_url: Url, timeout: Duration) -> Result<Self, ConfigError> {
		let client = ReqwestClient::builder()
			.timeout(timeout)
			.redirect(reqwest::redirect::Policy::none())
			.build()?;

		Ok(Self::new(client, discovery_url))
	}

	async fn jwks_uri(&self) -> Result<Url, KeySetError> {
		let cached = self.jwks_uri.lock().clone();

		if let Some(uri) = cached {
			return Ok(uri);
		}

		let document: DiscoveryDocument = self.get_json(&self.discovery_url).await?;
		let uri = Url::parse(&document.jwks_uri)
			.map_err(|source| KeySetError::InvalidJwksUri { source })?;

		*self.jwks_uri.lock() = Some(uri.clone());

		Ok(uri)
	}

	async fn get_json<T>(&self, url: &Url) -> Result<T, KeySetError>
	where
		T: DeserializeOwned,
	{
		let response = self
			.client
			.get(url.clone())
			.send()
			.await
			.map_err(|source| KeySetError::Transport { source })?;
		let status = response.status();

		if !status.is_success() {
			return Err(KeySetError::Status { url: url.clone(), status: status.as_u16() });
		}

		let body = response.bytes().await.map_err(|source| KeySetError::Transport { source })?;
		let mut deserializer = serde_json::Deserializer::from_slice(&body);

		serde_path_to_error::deserialize(&mut deserializer)
			.map_err(|source| KeySetError::Parse { url: url.clone(), source })
	}
}
impl KeySetSource for OidcKeySetSource {
	fn fetch(&self) -> KeySetFuture<'_> {
		Box::pin(async move {
			let uri = self.jwks_uri().await?;

			self.get_json(&uri).await
		})
	}
}

#[derive(Deserialize)]
struct DiscoveryDocument {
	jwks_uri: String,
}

/// Source serving pinned key sets, e.g. from configuration or tests.
///
/// Queued sets are served in order; the last one repeats once the queue drains.
#[derive(Debug, Default)]
pub struct StaticKeySetSource {
	sets: Mutex<VecDeque<JwkSet>>,
	fetches: AtomicUsize,
}
impl StaticKeySetSource {
	/// Creates a source that always serves `set`.
	pub fn new(set: JwkSet) -> Self {
		Self { sets: Mutex::new(VecDeque::from([set])), fetches: AtomicUsize::new(0) }
	}

	/// Queues `set` to be served after the ones already queued.
	pub fn then(self, set: JwkSet) -> Self {
		self.sets.lock().push_back(set);

		self
	}

	/// Number of fetches served so far.
	pub fn fetches(&self) -> usize {
		self.fetches.load(Ordering::SeqCst)
	}
}
impl KeySetSource for StaticKeySetSource {
	fn fetch(&self) -> KeySetFuture<'_> {
		self.fetches.fetch_add(1, Ordering::SeqCst);

		let next = {
			let mut sets = self.sets.lock();

			if sets.len() > 1 { sets.pop_front() } else { sets.front().cloned() }
		};

		Box::pin(async move {
			next.ok_or_else(|| KeySetError::Unavailable { reason: "no key set configured".into() })
		})
	}
}

fn decode_key_set(set: &JwkSet) -> HashMap<String, DecodingKey> {
	set.keys.iter().filter_map(decode_jwk).collect()
}

fn decode_jwk(jwk: &Jwk) -> Option<(String, DecodingKey)> {
	let kid = jwk.common.key_id.as_ref()?;

	if matches!(jwk.common.public_key_use, Some(ref usage) if *usage != PublicKeyUse::Signature) {
		tracing::debug!(kid, "Skipping non-signature key.");

		return None;
	}
	if matches!(jwk.common.key_algorithm, Some(alg) if alg != KeyAlgorithm::RS256) {
		tracing::debug!(kid, alg = ?jwk.common.key_algorithm, "Skipping key with disallowed algorithm.");

		return None;
	}

	let AlgorithmParameters::RSA(rsa) = &jwk.algorithm else {
		tracing::debug!(kid, "Skipping non-RSA key.");

		return None;
	};

	match DecodingKey::from_rsa_components(&rsa.n, &rsa.e) {
		Ok(key) => Some((kid.clone(), key)),
		Err(e) => {
			tracing::warn!(kid, error = %e, "Skipping undecodable RSA key.");

			None
		},
	}
}
