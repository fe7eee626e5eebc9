//! Bounded exponential backoff around upstream calls.
//!
//! [`RetryingInvoker`] runs one operation, classifies each [`UpstreamFailure`], and either
//! retries after `base * 2^attempt + jitter` or ends the sequence with a terminal [`Error`]:
//!
//! | Failure | Retried | Terminal form |
//! |---|---|---|
//! | throttled (429) | yes | [`UpstreamError::RateLimited`] |
//! | 401 / 403 | no | [`UpstreamError::AuthFailed`] |
//! | other 4xx | no | [`UpstreamError::Rejected`] |
//! | 5xx, no response, timeout | yes | [`UpstreamError::Unavailable`] |
//! | unclassified | no | [`Error::Unexpected`] |
//!
//! Sleeping only suspends the calling task.

// crates.io
use rand::Rng;
// self
use crate::{_prelude::*, error::UpstreamError, obs, upstream::UpstreamFailure};

/// Boxed future returned by [`Sleeper::sleep`].
pub type SleepFuture<'a> = Pin<Box<dyn Future<Output = ()> + 'a + Send>>;

/// Suspends the current task between attempts.
pub trait Sleeper
where
	Self: Send + Sync,
{
	/// Completes after `delay`.
	fn sleep(&self, delay: Duration) -> SleepFuture<'_>;
}

/// [`Sleeper`] backed by the tokio timer.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioSleeper;
impl Sleeper for TokioSleeper {
	fn sleep(&self, delay: Duration) -> SleepFuture<'_> {
		Box::pin(tokio::time::sleep(delay))
	}
}

/// Backoff schedule and ceilings for one upstream call sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
	/// Delay before the first retry; doubles on each later one.
	pub base_delay: Duration,
	/// Upper bound of the uniform jitter added to every delay.
	pub jitter_ceiling: Duration,
	/// Retries after the first attempt.
	pub max_retries: u32,
	/// Cap on cumulative sleep; a retry that would exceed it is not taken.
	pub max_total_delay: Duration,
	/// Time budget of each individual attempt.
	pub attempt_timeout: Duration,
}
impl RetryPolicy {
	/// Overrides the base delay.
	pub fn with_base_delay(mut self, delay: Duration) -> Self {
		self.base_delay = delay;

		self
	}

	/// Overrides the jitter ceiling.
	pub fn with_jitter_ceiling(mut self, ceiling: Duration) -> Self {
		self.jitter_ceiling = ceiling;

		self
	}

	/// Overrides the retry count.
	pub fn with_max_retries(mut self, retries: u32) -> Self {
		self.max_retries = retries;

		self
	}

	/// Overrides the cumulative sleep cap.
	pub fn with_max_total_delay(mut self, delay: Duration) -> Self {
		self.max_total_delay = delay;

		self
	}

	/// Overrides the per-attempt timeout.
	pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
		self.attempt_timeout = timeout;

		self
	}

	/// Delay before retrying after failed attempt `attempt` (0-indexed), without jitter.
	pub fn expected_delay_for(&self, attempt: u32) -> Duration {
		self.base_delay.saturating_mul(2_u32.saturating_pow(attempt.min(31)))
	}

	/// Delay before retrying after failed attempt `attempt` (0-indexed), jitter included.
	pub fn delay_for(&self, attempt: u32) -> Duration {
		let jitter = rand::rng().random_range(Duration::ZERO..=self.jitter_ceiling);

		self.expected_delay_for(attempt).saturating_add(jitter)
	}
}
impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			base_delay: Duration::from_millis(400),
			jitter_ceiling: Duration::from_millis(250),
			max_retries: 3,
			max_total_delay: Duration::from_secs(5),
			attempt_timeout: Duration::from_secs(30),
		}
	}
}

/// Runs upstream operations under a [`RetryPolicy`].
pub struct RetryingInvoker {
	policy: RetryPolicy,
	sleeper: Arc<dyn Sleeper>,
}
impl RetryingInvoker {
	/// Creates an invoker sleeping on the tokio timer.
	pub fn new(policy: RetryPolicy) -> Self {
		Self { policy, sleeper: Arc::new(TokioSleeper) }
	}

	/// Replaces the sleeper, e.g. to observe delays in tests.
	pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
		self.sleeper = sleeper;

		self
	}

	/// Active policy.
	pub fn policy(&self) -> &RetryPolicy {
		&self.policy
	}

	/// Runs `operation` with the policy's retry count.
	pub async fn invoke<T, F, Fut>(&self, operation: F) -> Result<T>
	where
		F: FnMut() -> Fut,
		Fut: Future<Output = Result<T, UpstreamFailure>>,
	{
		self.invoke_with_retries(operation, self.policy.max_retries).await
	}

	/// Runs `operation`, retrying transient failures up to `max_retries` times.
	pub async fn invoke_with_retries<T, F, Fut>(&self, mut operation: F, max_retries: u32) -> Result<T>
	where
		F: FnMut() -> Fut,
		Fut: Future<Output = Result<T, UpstreamFailure>>,
	{
		let mut attempt = 0_u32;
		let mut slept = Duration::ZERO;

		loop {
			let outcome = tokio::time::timeout(self.policy.attempt_timeout, operation())
				.await
				.unwrap_or(Err(UpstreamFailure::Timeout));
			let failure = match outcome {
				Ok(value) => return Ok(value),
				Err(failure) => failure,
			};
			let terminal = match classify(failure) {
				Verdict::Retry(terminal) => terminal,
				Verdict::Stop(err) => return Err(err),
			};

			if attempt >= max_retries {
				return Err(terminal.into());
			}

			let delay = self.policy.delay_for(attempt);

			if slept.saturating_add(delay) > self.policy.max_total_delay {
				tracing::debug!(
					attempt,
					slept_ms = slept.as_millis() as u64,
					"Retry budget exhausted before the next attempt."
				);

				return Err(terminal.into());
			}

			tracing::debug!(
				attempt,
				delay_ms = delay.as_millis() as u64,
				error = %terminal,
				"Retrying upstream call after transient failure."
			);
			obs::record_upstream_retry();

			self.sleeper.sleep(delay).await;

			slept += delay;
			attempt += 1;
		}
	}
}
impl Debug for RetryingInvoker {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("RetryingInvoker").field("policy", &self.policy).finish_non_exhaustive()
	}
}

enum Verdict {
	/// Transient; carries the error to report if no retry follows.
	Retry(UpstreamError),
	Stop(Error),
}

fn classify(failure: UpstreamFailure) -> Verdict {
	match failure {
		UpstreamFailure::RateLimited { retry_after } =>
			Verdict::Retry(UpstreamError::RateLimited { retry_after }),
		UpstreamFailure::Api { status: Some(status @ (401 | 403)), .. } =>
			Verdict::Stop(UpstreamError::AuthFailed { status }.into()),
		UpstreamFailure::Api { status: Some(status @ 400..=499), .. } =>
			Verdict::Stop(UpstreamError::Rejected { status }.into()),
		UpstreamFailure::Api { status, .. } => Verdict::Retry(UpstreamError::Unavailable { status }),
		UpstreamFailure::Timeout => Verdict::Retry(UpstreamError::Unavailable { status: None }),
		failure @ UpstreamFailure::Unexpected { .. } =>
			Verdict::Stop(Error::unexpected_with("Upstream call failed", failure)),
	}
}
