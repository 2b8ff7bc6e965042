pub mod headers;

use std::time::{Duration, SystemTime};

use aws_credential_types::Credentials;
use aws_sigv4::http_request::{
	PercentEncodingMode, SignableBody, SignableRequest, SignatureLocation, SigningSettings,
	UriPathNormalizationMode, sign,
};
use aws_sigv4::sign::v4;
use http::request::Parts;
use http::{HeaderMap, HeaderName, Uri};

pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";
pub const SERVICE_S3: &str = "s3";

pub const X_AMZ_DATE: HeaderName = HeaderName::from_static("x-amz-date");
pub const X_AMZ_CONTENT_SHA256: HeaderName = HeaderName::from_static("x-amz-content-sha256");
pub const X_AMZ_SECURITY_TOKEN: HeaderName = HeaderName::from_static("x-amz-security-token");

/// Query parameter carrying the proxy-internal request id; it only has
/// meaning within the proxy and never participates in signatures.
pub const REQUEST_ID_QUERY_PARAM: &str = "x-request-id";

/// Signature material that must be stripped from the query string before a
/// request is (re-)signed; the signer re-adds what the new signature needs.
const SIGNATURE_QUERY_PARAMS: &[&str] = &[
	"X-Amz-Algorithm",
	"X-Amz-Credential",
	"X-Amz-Date",
	"X-Amz-Expires",
	"X-Amz-Security-Token",
	"x-amz-security-token",
	"X-Amz-SignedHeaders",
	"X-Amz-Signature",
	"Signature",
	"AWSAccessKeyId",
	REQUEST_ID_QUERY_PARAM,
];

#[derive(thiserror::Error, Debug)]
pub enum SignatureError {
	#[error("request is not signed")]
	Missing,
	#[error("malformed signature material: {0}")]
	Malformed(String),
	#[error("unsupported signing algorithm: {0}")]
	UnsupportedAlgorithm(String),
	#[error("request has expired")]
	Expired,
	#[error("signature does not match")]
	Mismatch,
	#[error("signing failed: {0}")]
	Signing(String),
}

/// The `<access key>/<yyyymmdd>/<region>/<service>/aws4_request` scope string
/// from `Credential=`. The region part names the target backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialScope {
	pub access_key_id: String,
	pub date: String,
	pub region: String,
	pub service: String,
}

impl CredentialScope {
	pub fn parse(credential: &str) -> Result<Self, SignatureError> {
		let parts: Vec<&str> = credential.split('/').collect();
		let [access_key_id, date, region, service, terminator] = parts.as_slice() else {
			return Err(SignatureError::Malformed(format!(
				"credential scope has {} parts, want 5",
				parts.len()
			)));
		};
		if *terminator != "aws4_request" {
			return Err(SignatureError::Malformed(
				"credential scope does not end in aws4_request".to_string(),
			));
		}
		Ok(CredentialScope {
			access_key_id: access_key_id.to_string(),
			date: date.to_string(),
			region: region.to_string(),
			service: service.to_string(),
		})
	}
}

/// SigV4 material parsed from either the `Authorization` header or the
/// presigned-URL query parameters.
#[derive(Debug, Clone)]
pub struct RequestSignature {
	pub scope: CredentialScope,
	/// lowercase, as they appear in `SignedHeaders`
	pub signed_headers: Vec<String>,
	pub signature: String,
	/// raw `YYYYMMDD'T'HHMMSS'Z'` timestamp the client signed with
	pub amz_date: String,
	pub security_token: Option<String>,
	/// presigned requests only
	pub expires: Option<u64>,
}

impl RequestSignature {
	pub fn is_presigned(&self) -> bool {
		self.expires.is_some()
	}

	pub fn signing_time(&self) -> Result<SystemTime, SignatureError> {
		parse_amz_date(&self.amz_date)
	}
}

/// Extract SigV4 material from a request. Header authentication wins over
/// query parameters; `Ok(None)` means the request is unsigned.
pub fn parse_request_signature(
	http_headers: &HeaderMap,
	query: &[(String, String)],
) -> Result<Option<RequestSignature>, SignatureError> {
	if let Some(auth) = http_headers.get(http::header::AUTHORIZATION) {
		let auth = auth
			.to_str()
			.map_err(|_| SignatureError::Malformed("authorization header is not ASCII".to_string()))?;
		return parse_authorization_header(auth, http_headers).map(Some);
	}
	if query.iter().any(|(k, _)| k == "X-Amz-Signature") {
		return parse_presigned_query(query).map(Some);
	}
	Ok(None)
}

fn parse_authorization_header(
	auth: &str,
	http_headers: &HeaderMap,
) -> Result<RequestSignature, SignatureError> {
	let (algorithm, rest) = auth
		.split_once(' ')
		.ok_or_else(|| SignatureError::Malformed("authorization header has no parameters".to_string()))?;
	if algorithm != ALGORITHM {
		return Err(SignatureError::UnsupportedAlgorithm(algorithm.to_string()));
	}

	let mut credential = None;
	let mut signed_headers = None;
	let mut signature = None;
	for item in rest.split(',') {
		let Some((key, value)) = item.trim().split_once('=') else {
			continue;
		};
		match key {
			"Credential" => credential = Some(value),
			"SignedHeaders" => signed_headers = Some(value),
			"Signature" => signature = Some(value),
			_ => {},
		}
	}
	let credential =
		credential.ok_or_else(|| SignatureError::Malformed("missing Credential".to_string()))?;
	let signed_headers = signed_headers
		.ok_or_else(|| SignatureError::Malformed("missing SignedHeaders".to_string()))?;
	let signature =
		signature.ok_or_else(|| SignatureError::Malformed("missing Signature".to_string()))?;

	let amz_date = http_headers
		.get(X_AMZ_DATE)
		.and_then(|v| v.to_str().ok())
		.ok_or_else(|| SignatureError::Malformed("missing x-amz-date header".to_string()))?;
	let security_token = http_headers
		.get(X_AMZ_SECURITY_TOKEN)
		.and_then(|v| v.to_str().ok())
		.map(str::to_string);

	Ok(RequestSignature {
		scope: CredentialScope::parse(credential)?,
		signed_headers: signed_headers
			.split(';')
			.map(|h| h.to_ascii_lowercase())
			.collect(),
		signature: signature.to_string(),
		amz_date: amz_date.to_string(),
		security_token,
		expires: None,
	})
}

fn parse_presigned_query(query: &[(String, String)]) -> Result<RequestSignature, SignatureError> {
	let get = |name: &str| {
		query
			.iter()
			.find(|(k, _)| k == name)
			.map(|(_, v)| v.as_str())
	};
	let algorithm = get("X-Amz-Algorithm")
		.ok_or_else(|| SignatureError::Malformed("missing X-Amz-Algorithm".to_string()))?;
	if algorithm != ALGORITHM {
		return Err(SignatureError::UnsupportedAlgorithm(algorithm.to_string()));
	}
	let credential = get("X-Amz-Credential")
		.ok_or_else(|| SignatureError::Malformed("missing X-Amz-Credential".to_string()))?;
	let amz_date = get("X-Amz-Date")
		.ok_or_else(|| SignatureError::Malformed("missing X-Amz-Date".to_string()))?;
	let expires: u64 = get("X-Amz-Expires")
		.ok_or_else(|| SignatureError::Malformed("missing X-Amz-Expires".to_string()))?
		.parse()
		.map_err(|_| SignatureError::Malformed("X-Amz-Expires is not a number".to_string()))?;
	let signed_headers = get("X-Amz-SignedHeaders")
		.ok_or_else(|| SignatureError::Malformed("missing X-Amz-SignedHeaders".to_string()))?;
	let signature = get("X-Amz-Signature")
		.ok_or_else(|| SignatureError::Malformed("missing X-Amz-Signature".to_string()))?;

	Ok(RequestSignature {
		scope: CredentialScope::parse(credential)?,
		signed_headers: signed_headers
			.split(';')
			.map(|h| h.to_ascii_lowercase())
			.collect(),
		signature: signature.to_string(),
		amz_date: amz_date.to_string(),
		security_token: get("X-Amz-Security-Token").map(str::to_string),
		expires: Some(expires),
	})
}

pub fn parse_amz_date(value: &str) -> Result<SystemTime, SignatureError> {
	let naive = chrono::NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%SZ")
		.map_err(|e| SignatureError::Malformed(format!("bad X-Amz-Date {value}: {e}")))?;
	Ok(SystemTime::from(naive.and_utc()))
}

pub fn parse_query(uri: &Uri) -> Vec<(String, String)> {
	url::form_urlencoded::parse(uri.query().unwrap_or_default().as_bytes())
		.into_owned()
		.collect()
}

/// Filter signature material (and the internal request id) out of a raw
/// query string, preserving the original encoding of everything kept.
pub fn strip_signature_query(query: Option<&str>) -> String {
	let Some(query) = query else {
		return String::new();
	};
	query
		.split('&')
		.filter(|pair| {
			let key = pair.split('=').next().unwrap_or(pair);
			!SIGNATURE_QUERY_PARAMS.iter().any(|p| key.eq_ignore_ascii_case(p))
		})
		.collect::<Vec<_>>()
		.join("&")
}

/// Payload hash to sign: the client-declared `x-amz-content-sha256` or
/// `UNSIGNED-PAYLOAD` when absent.
pub fn payload_hash(http_headers: &HeaderMap) -> String {
	http_headers
		.get(X_AMZ_CONTENT_SHA256)
		.and_then(|v| v.to_str().ok())
		.unwrap_or(UNSIGNED_PAYLOAD)
		.to_string()
}

/// Settings that reproduce what S3 clients sign: single percent-encoding,
/// no path normalization, the usual unsigned hop headers excluded.
fn s3_signing_settings() -> SigningSettings {
	let mut settings = SigningSettings::default();
	settings.percent_encoding_mode = PercentEncodingMode::Single;
	settings.uri_path_normalization_mode = UriPathNormalizationMode::Disabled;
	settings.excluded_headers = Some(vec![
		"authorization".into(),
		"user-agent".into(),
		"x-amzn-trace-id".into(),
	]);
	settings
}

fn apply_instructions(
	parts: &mut Parts,
	instructions: aws_sigv4::http_request::SigningInstructions,
) {
	let mut tmp = http::Request::from_parts(parts.clone(), ());
	instructions.apply_to_request_http1x(&mut tmp);
	let (new_parts, _) = tmp.into_parts();
	*parts = new_parts;
}

/// Sign request head in place with header-based SigV4 (service `s3`). All
/// remaining headers become part of the signature; the body is covered by the
/// declared payload hash.
pub fn sign_request(
	parts: &mut Parts,
	creds: &Credentials,
	region: &str,
	signing_time: SystemTime,
) -> Result<(), SignatureError> {
	let settings = s3_signing_settings();
	let identity = creds.clone().into();
	let params = v4::SigningParams::builder()
		.identity(&identity)
		.region(region)
		.name(SERVICE_S3)
		.time(signing_time)
		.settings(settings)
		.build()
		.map_err(|e| SignatureError::Signing(e.to_string()))?
		.into();

	let uri = parts.uri.to_string();
	let signable = SignableRequest::new(
		parts.method.as_str(),
		uri.as_str(),
		parts
			.headers
			.iter()
			.filter_map(|(k, v)| v.to_str().ok().map(|value| (k.as_str(), value))),
		SignableBody::Precomputed(payload_hash(&parts.headers)),
	)
	.map_err(|e| SignatureError::Signing(e.to_string()))?;

	let (instructions, _signature) = sign(signable, &params)
		.map_err(|e| SignatureError::Signing(e.to_string()))?
		.into_parts();
	apply_instructions(parts, instructions);
	Ok(())
}

/// Presign request head in place: signature material moves into `X-Amz-*`
/// query parameters and the URL is valid for `expires`.
pub fn presign_request(
	parts: &mut Parts,
	creds: &Credentials,
	region: &str,
	expires: Duration,
	signing_time: SystemTime,
) -> Result<(), SignatureError> {
	let mut settings = s3_signing_settings();
	settings.signature_location = SignatureLocation::QueryParams;
	settings.expires_in = Some(expires);

	let identity = creds.clone().into();
	let params = v4::SigningParams::builder()
		.identity(&identity)
		.region(region)
		.name(SERVICE_S3)
		.time(signing_time)
		.settings(settings)
		.build()
		.map_err(|e| SignatureError::Signing(e.to_string()))?
		.into();

	let authority = request_authority(parts)?;
	let uri = build_uri_for_signing(parts, &authority);
	let signable = SignableRequest::new(
		parts.method.as_str(),
		uri.as_str(),
		std::iter::once(("host", authority.as_str())),
		SignableBody::Precomputed(UNSIGNED_PAYLOAD.to_string()),
	)
	.map_err(|e| SignatureError::Signing(e.to_string()))?;

	let (instructions, _signature) = sign(signable, &params)
		.map_err(|e| SignatureError::Signing(e.to_string()))?
		.into_parts();
	apply_instructions(parts, instructions);
	Ok(())
}

/// Recompute the signature for an inbound request and compare it in constant
/// time with what the client sent.
pub fn verify_request(
	parts: &Parts,
	request_signature: &RequestSignature,
	creds: &Credentials,
) -> Result<(), SignatureError> {
	let computed = compute_signature(parts, request_signature, creds)?;
	ring::constant_time::verify_slices_are_equal(
		computed.as_bytes(),
		request_signature.signature.as_bytes(),
	)
	.map_err(|_| SignatureError::Mismatch)
}

/// Presigned URLs carry an explicit lifetime; reject before doing signature
/// work when it has lapsed.
pub fn check_presign_expiry(
	request_signature: &RequestSignature,
	now: SystemTime,
) -> Result<(), SignatureError> {
	let Some(expires) = request_signature.expires else {
		return Ok(());
	};
	let signed_at = request_signature.signing_time()?;
	if now > signed_at + Duration::from_secs(expires) {
		return Err(SignatureError::Expired);
	}
	Ok(())
}

fn compute_signature(
	parts: &Parts,
	request_signature: &RequestSignature,
	creds: &Credentials,
) -> Result<String, SignatureError> {
	let signing_time = request_signature.signing_time()?;
	let mut settings = s3_signing_settings();
	if let Some(expires) = request_signature.expires {
		settings.signature_location = SignatureLocation::QueryParams;
		settings.expires_in = Some(Duration::from_secs(expires));
	}

	// The signer folds the session token from the identity into the canonical
	// request; only do that when the client actually signed one.
	let signed_token = request_signature.is_presigned()
		|| request_signature
			.signed_headers
			.iter()
			.any(|h| h == "x-amz-security-token");
	let effective_creds = if signed_token {
		creds.clone()
	} else {
		Credentials::new(
			creds.access_key_id(),
			creds.secret_access_key(),
			None,
			creds.expiry(),
			"verification",
		)
	};
	let identity = effective_creds.into();
	let params = v4::SigningParams::builder()
		.identity(&identity)
		.region(&request_signature.scope.region)
		.name(&request_signature.scope.service)
		.time(signing_time)
		.settings(settings)
		.build()
		.map_err(|e| SignatureError::Signing(e.to_string()))?
		.into();

	let authority = request_authority(parts)?;
	let uri = build_uri_for_signing(parts, &authority);

	// Only the headers the client declared in SignedHeaders take part; the
	// signer re-adds the security token from the credentials.
	let mut signable_headers: Vec<(&str, &str)> = Vec::new();
	for name in &request_signature.signed_headers {
		if name == "x-amz-security-token" {
			continue;
		}
		if name == "host" {
			signable_headers.push(("host", authority.as_str()));
			continue;
		}
		for value in parts.headers.get_all(name.as_str()) {
			if let Ok(value) = value.to_str() {
				signable_headers.push((name.as_str(), value));
			}
		}
	}

	let signable = SignableRequest::new(
		parts.method.as_str(),
		uri.as_str(),
		signable_headers.into_iter(),
		SignableBody::Precomputed(payload_hash(&parts.headers)),
	)
	.map_err(|e| SignatureError::Signing(e.to_string()))?;

	let (_instructions, signature) = sign(signable, &params)
		.map_err(|e| SignatureError::Signing(e.to_string()))?
		.into_parts();
	Ok(signature)
}

fn request_authority(parts: &Parts) -> Result<String, SignatureError> {
	if let Some(host) = parts.headers.get(http::header::HOST)
		&& let Ok(host) = host.to_str()
	{
		return Ok(host.to_string());
	}
	parts
		.uri
		.authority()
		.map(|a| a.to_string())
		.ok_or_else(|| SignatureError::Malformed("request has no host".to_string()))
}

/// Absolute-form URI with signature query material stripped. The scheme is
/// not part of the canonical request, so `http` is fine for both.
fn build_uri_for_signing(parts: &Parts, authority: &str) -> String {
	let path = parts.uri.path();
	let query = strip_signature_query(parts.uri.query());
	if query.is_empty() {
		format!("http://{authority}{path}")
	} else {
		format!("http://{authority}{path}?{query}")
	}
}
