use tracing_subscriber::EnvFilter;

const TRUNCATED_SUFFIX: &str = "...(truncated)";
const MAX_LOGGED_LEN: usize = 16 * 1024;

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// `info` level.
pub fn setup_logging() {
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
		)
		.init();
}

/// Bound values that end up in logs. Header and query material is
/// client-controlled and a single oversized value should not blow up a log
/// pipeline.
pub fn safe_string(s: &str) -> String {
	safe_string_max(s, MAX_LOGGED_LEN)
}

pub fn safe_string_max(s: &str, max_length: usize) -> String {
	if s.len() <= max_length {
		return s.to_string();
	}
	let keep = max_length.saturating_sub(TRUNCATED_SUFFIX.len());
	let mut end = keep;
	while end > 0 && !s.is_char_boundary(end) {
		end -= 1;
	}
	format!("{}{}", &s[..end], TRUNCATED_SUFFIX)
}
