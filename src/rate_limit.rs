//! Per-caller request metering with fixed, reset-on-expiry windows.
//!
//! Each caller key owns one [`RateWindow`]. A window older than [`WINDOW`] resets before the
//! current request is counted, so bursts straddling a reset can admit up to twice the nominal
//! rate over a short interval. Counts live in process memory; replicas do not share them.

// self
use crate::{_prelude::*, caller::CallerKey};

/// Length of one accounting window.
pub const WINDOW: Duration = Duration::from_secs(60);

/// Tracked key count above which expired windows are pruned, at most once per [`WINDOW`].
const PRUNE_THRESHOLD: usize = 10_000;

/// Request count observed for one caller within the current window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateWindow {
	/// Requests counted in this window, including rejected ones.
	pub count: u32,
	/// When the window opened.
	pub started_at: Instant,
}
impl RateWindow {
	fn is_expired_at(&self, now: Instant) -> bool {
		now.saturating_duration_since(self.started_at) >= WINDOW
	}

	fn remaining_at(&self, now: Instant) -> Duration {
		WINDOW.saturating_sub(now.saturating_duration_since(self.started_at))
	}
}

/// Shared windowed counter keyed by [`CallerKey`].
#[derive(Debug)]
pub struct RateLimiter {
	per_minute: u32,
	table: Mutex<WindowTable>,
}
impl RateLimiter {
	/// Creates a limiter admitting `per_minute` requests per caller per window.
	///
	/// A zero limit is raised to one.
	pub fn new(per_minute: u32) -> Self {
		Self { per_minute: per_minute.max(1), table: Mutex::new(WindowTable::default()) }
	}

	/// Configured per-window budget.
	pub fn per_minute(&self) -> u32 {
		self.per_minute
	}

	/// Counts one request for `key` and rejects it when the window budget is exhausted.
	pub fn check(&self, key: &CallerKey) -> Result<()> {
		self.check_at(key, Instant::now())
	}

	/// Same as [`check`](Self::check) with an explicit clock reading.
	///
	/// The increment is recorded even when the request is rejected.
	pub fn check_at(&self, key: &CallerKey, now: Instant) -> Result<()> {
		let mut table = self.table.lock();

		table.prune_at(now);

		let window =
			table.windows.entry(key.clone()).or_insert(RateWindow { count: 0, started_at: now });

		if window.is_expired_at(now) {
			*window = RateWindow { count: 0, started_at: now };
		}

		window.count = window.count.saturating_add(1);

		if window.count > self.per_minute {
			return Err(Error::RateLimited { retry_after: window.remaining_at(now) });
		}

		Ok(())
	}

	/// Snapshot of the window currently tracked for `key`.
	pub fn window(&self, key: &CallerKey) -> Option<RateWindow> {
		self.table.lock().windows.get(key).copied()
	}

	/// Number of caller keys currently tracked.
	pub fn tracked_keys(&self) -> usize {
		self.table.lock().windows.len()
	}
}

#[derive(Debug, Default)]
struct WindowTable {
	windows: HashMap<CallerKey, RateWindow>,
	pruned_at: Option<Instant>,
}
impl WindowTable {
	fn prune_at(&mut self, now: Instant) {
		if self.windows.len() <= PRUNE_THRESHOLD {
			return;
		}
		// A map full of live windows would otherwise be rescanned on every check.
		if self.pruned_at.is_some_and(|at| now.saturating_duration_since(at) < WINDOW) {
			return;
		}

		self.windows.retain(|_, window| !window.is_expired_at(now));
		self.pruned_at = Some(now);
	}
}
