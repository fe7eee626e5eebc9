// crates.io
use tracing_subscriber::EnvFilter;
// self
use crate::error::ConfigError;

/// Installs the global JSON log subscriber writing one object per line to stdout.
///
/// `RUST_LOG` takes precedence when set; otherwise `level` (e.g. `info`, `DEBUG`, or a full
/// filter directive) selects what is emitted. Each record carries `timestamp`, `level`,
/// `target`, `message`, and the event's fields flattened to the top level.
pub fn init_logging(level: &str) -> Result<(), ConfigError> {
	let filter = log_filter(level)?;

	tracing_subscriber::fmt()
		.json()
		.flatten_event(true)
		.with_current_span(true)
		.with_span_list(false)
		.with_target(true)
		.with_env_filter(filter)
		.with_writer(std::io::stdout)
		.try_init()
		.map_err(|e| ConfigError::Logging { reason: e.to_string() })
}

fn log_filter(level: &str) -> Result<EnvFilter, ConfigError> {
	if let Ok(filter) = EnvFilter::try_from_default_env() {
		return Ok(filter);
	}

	EnvFilter::try_new(level.trim().to_ascii_lowercase())
		.map_err(|e| ConfigError::Logging { reason: e.to_string() })
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn level_names_are_case_insensitive() {
		if std::env::var_os("RUST_LOG").is_some() {
			return;
		}

		for level in ["info", "INFO", " Warn ", "chat_gateway=debug,tower=warn"] {
			assert!(log_filter(level).is_ok(), "{level} should parse.");
		}

		assert!(log_filter("chat_gateway=loud").is_err());
	}
}
