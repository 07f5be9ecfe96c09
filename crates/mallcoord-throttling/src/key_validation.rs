//! Validation of the components that make up a window key.
//!
//! Window keys are `{prefix}{rule}:{client}`. Rule keys must not contain the
//! separator; client identities may (IPv6 addresses do), since they are
//! always the last component.

use crate::{ThrottleError, ThrottleResult};

/// Longest accepted key component
pub const MAX_KEY_COMPONENT_LEN: usize = 256;

fn check_component(kind: &str, value: &str) -> ThrottleResult<()> {
	if value.is_empty() {
		return Err(ThrottleError::InvalidKey(format!("{kind} must not be empty")));
	}
	if value.len() > MAX_KEY_COMPONENT_LEN {
		return Err(ThrottleError::InvalidKey(format!(
			"{kind} exceeds {MAX_KEY_COMPONENT_LEN} bytes"
		)));
	}
	if value.chars().any(char::is_control) {
		return Err(ThrottleError::InvalidKey(format!(
			"{kind} must not contain control characters"
		)));
	}
	Ok(())
}

/// # Errors
///
/// Returns [`ThrottleError::InvalidKey`] for empty, oversized or
/// control-character keys, and for keys containing `:`.
pub fn validate_rule_key(key: &str) -> ThrottleResult<()> {
	check_component("rule key", key)?;
	if key.contains(':') {
		return Err(ThrottleError::InvalidKey(format!(
			"rule key `{key}` must not contain ':'"
		)));
	}
	Ok(())
}

/// # Errors
///
/// Returns [`ThrottleError::InvalidKey`] for empty, oversized or
/// control-character identities.
pub fn validate_client_key(client: &str) -> ThrottleResult<()> {
	check_component("client identity", client)
}
