use std::collections::HashSet;

use http::HeaderMap;
use tracing::warn;

/// Hop-by-hop and SDK-injected headers that are safe to drop before
/// re-signing. `content-length` is special: once dropped the forwarded body
/// length is treated as unknown so it cannot leak into the new signature.
fn is_cleanable(name: &str) -> bool {
	if name.starts_with("x-forwarded-") {
		return true;
	}
	matches!(
		name,
		"accept-encoding"
			| "x-real-ip"
			| "amz-sdk-invocation-id"
			| "amz-sdk-request"
			| "content-length"
	)
}

/// Headers that are known-fine to leave in place without being part of the
/// new signature.
fn is_ok_to_skip(name: &str) -> bool {
	matches!(name, "user-agent" | "authorization")
}

/// Remove every header that is neither in the to-keep (signed) set nor safe
/// to skip. Cleaning is idempotent and never removes a kept header. Header
/// names in `to_keep` must be lowercase.
pub fn clean_headers_to(headers: &mut HeaderMap, to_keep: &HashSet<String>) {
	let mut cleaned: Vec<String> = Vec::new();
	let mut skipped: Vec<String> = Vec::new();
	let mut signed: Vec<String> = Vec::new();
	let mut risky_skips = 0usize;

	let all_headers: Vec<String> = headers.keys().map(|name| name.as_str().to_string()).collect();
	for header in all_headers {
		if to_keep.contains(&header) {
			signed.push(header);
			continue;
		}
		if is_cleanable(&header) {
			headers.remove(&header);
			cleaned.push(header);
		} else {
			if !is_ok_to_skip(&header) {
				risky_skips += 1;
			}
			skipped.push(header);
		}
	}

	if risky_skips > 0 {
		warn!(
			?cleaned,
			?skipped,
			to_keep = ?signed,
			"cleaning of headers done but some were skipped"
		);
	}
}

#[cfg(test)]
mod tests {
	use http::HeaderValue;

	use super::*;

	fn headers(entries: &[(&'static str, &'static str)]) -> HeaderMap {
		let mut map = HeaderMap::new();
		for (name, value) in entries {
			map.append(*name, HeaderValue::from_static(value));
		}
		map
	}

	fn keep(names: &[&str]) -> HashSet<String> {
		names.iter().map(|n| n.to_string()).collect()
	}

	#[test]
	fn cleanable_headers_are_removed() {
		let mut h = headers(&[
			("host", "proxy.local"),
			("x-forwarded-for", "10.0.0.1"),
			("x-forwarded-proto", "https"),
			("x-real-ip", "10.0.0.1"),
			("accept-encoding", "gzip"),
			("amz-sdk-invocation-id", "abc"),
			("amz-sdk-request", "attempt=1"),
			("content-length", "42"),
		]);
		clean_headers_to(&mut h, &keep(&["host"]));
		assert_eq!(h.len(), 1);
		assert!(h.contains_key("host"));
	}

	#[test]
	fn signed_headers_survive_even_when_cleanable() {
		let mut h = headers(&[("accept-encoding", "gzip"), ("host", "proxy.local")]);
		clean_headers_to(&mut h, &keep(&["accept-encoding", "host"]));
		assert!(h.contains_key("accept-encoding"));
		assert!(h.contains_key("host"));
	}

	#[test]
	fn unknown_headers_are_left_in_place() {
		let mut h = headers(&[("x-custom-header", "v"), ("user-agent", "aws-sdk")]);
		clean_headers_to(&mut h, &keep(&[]));
		assert!(h.contains_key("x-custom-header"));
		assert!(h.contains_key("user-agent"));
	}

	#[test]
	fn cleaning_is_idempotent() {
		let mut h = headers(&[
			("host", "proxy.local"),
			("x-forwarded-for", "10.0.0.1"),
			("x-custom", "v"),
		]);
		let to_keep = keep(&["host"]);
		clean_headers_to(&mut h, &to_keep);
		let after_first: Vec<String> = h.keys().map(|k| k.as_str().to_string()).collect();
		clean_headers_to(&mut h, &to_keep);
		let after_second: Vec<String> = h.keys().map(|k| k.as_str().to_string()).collect();
		assert_eq!(after_first, after_second);
	}
}
