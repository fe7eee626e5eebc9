//! Pre-flight prompt and token-budget rules.

// self
use crate::{_prelude::*, error::ValidationError};

/// Default prompt ceiling in characters.
pub const DEFAULT_MAX_PROMPT_CHARS: usize = 4_000;
/// Default ceiling on completion tokens.
pub const DEFAULT_MAX_TOKENS_HARD_LIMIT: u32 = 800;
/// Default per-caller request budget per minute.
pub const DEFAULT_RATE_LIMIT_PER_MINUTE: u32 = 20;

/// Process-lifetime guardrail settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardrailConfig {
	/// Longest accepted prompt, counted in Unicode scalar values.
	pub max_prompt_chars: usize,
	/// Upper bound on completion tokens regardless of what callers request.
	pub max_tokens_hard_limit: u32,
	/// Requests each caller may issue per minute.
	pub rate_limit_per_minute: u32,
}
impl Default for GuardrailConfig {
	fn default() -> Self {
		Self {
			max_prompt_chars: DEFAULT_MAX_PROMPT_CHARS,
			max_tokens_hard_limit: DEFAULT_MAX_TOKENS_HARD_LIMIT,
			rate_limit_per_minute: DEFAULT_RATE_LIMIT_PER_MINUTE,
		}
	}
}

/// Validates `prompt` and returns the completion token budget to request upstream.
///
/// Length is measured in characters, not bytes, so multi-byte text is not penalized. The
/// returned budget always lies in `1..=max_tokens_hard_limit`.
pub fn enforce(
	prompt: &str,
	requested_max_tokens: i64,
	config: &GuardrailConfig,
) -> Result<u32, ValidationError> {
	if prompt.trim().is_empty() {
		return Err(ValidationError::EmptyPrompt);
	}

	let actual = prompt.chars().count();

	if actual > config.max_prompt_chars {
		return Err(ValidationError::PromptTooLong { max: config.max_prompt_chars, actual });
	}

	let hard_limit = i64::from(config.max_tokens_hard_limit.max(1));
	let effective = requested_max_tokens.clamp(1, hard_limit);

	Ok(u32::try_from(effective).unwrap_or(1))
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	fn config(max_prompt_chars: usize, max_tokens_hard_limit: u32) -> GuardrailConfig {
		GuardrailConfig { max_prompt_chars, max_tokens_hard_limit, ..Default::default() }
	}

	#[test]
	fn blank_prompts_are_rejected() {
		let cfg = GuardrailConfig::default();

		assert_eq!(enforce("", 10, &cfg), Err(ValidationError::EmptyPrompt));
		assert_eq!(enforce(" \n\t ", 10, &cfg), Err(ValidationError::EmptyPrompt));
	}

	#[test]
	fn prompt_ceiling_is_inclusive() {
		let cfg = config(5, 800);

		assert_eq!(enforce("abcde", 10, &cfg), Ok(10));
		assert_eq!(
			enforce("abcdef", 10, &cfg),
			Err(ValidationError::PromptTooLong { max: 5, actual: 6 })
		);
	}

	#[test]
	fn prompt_length_counts_characters() {
		let cfg = config(4, 800);

		// Four characters, twelve bytes.
		assert_eq!(enforce("日本語!", 10, &cfg).map(|_| ()), Ok(()));
		assert!(enforce("日本語!!", 10, &cfg).is_err());
	}

	#[test]
	fn token_budget_is_always_within_bounds() {
		let cfg = config(100, 800);

		for (requested, expected) in [
			(i64::MIN, 1),
			(-5, 1),
			(0, 1),
			(1, 1),
			(200, 200),
			(800, 800),
			(801, 800),
			(i64::MAX, 800),
		] {
			assert_eq!(enforce("hi", requested, &cfg), Ok(expected), "requested {requested}");
		}
	}

	#[test]
	fn degenerate_hard_limit_still_yields_one_token() {
		assert_eq!(enforce("hi", 50, &config(100, 0)), Ok(1));
	}
}
