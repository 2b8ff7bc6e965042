use std::sync::Arc;
use std::time::{Duration, SystemTime};

use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::Response;
use http::{StatusCode, header};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::ProxyState;
use crate::context::{RequestCtx, track_response};
use crate::errors::{MIME_XML, XML_HEADER, capitalize_first_letter};
use crate::token::WebIdentityClaims;

pub const ACTION_ASSUME_ROLE_WITH_WEB_IDENTITY: &str = "AssumeRoleWithWebIdentity";
const STS_XMLNS: &str = "https://sts.amazonaws.com/doc/2011-06-15/";
const MAX_FORM_BYTES: usize = 64 * 1024;
const DEFAULT_DURATION: Duration = Duration::from_secs(3600);
const MIN_DURATION: Duration = Duration::from_secs(900);

pub fn router(state: Arc<ProxyState>) -> axum::Router {
	axum::Router::new()
		.route("/", axum::routing::post(handle))
		.with_state(state)
}

async fn handle(State(state): State<Arc<ProxyState>>, req: Request) -> Response {
	let mut ctx = RequestCtx::new(req.method(), req.uri().path());
	let response = match assume_role_with_web_identity(&state, &mut ctx, req).await {
		Ok(response) => response,
		Err(err) => err.into_response(&ctx.request_id),
	};
	track_response(response, ctx)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StsErrorCode {
	MissingParameter,
	InvalidParameterValue,
	InvalidClientTokenId,
	ExpiredToken,
	InternalFailure,
}

impl StsErrorCode {
	fn code(&self) -> &'static str {
		match self {
			StsErrorCode::MissingParameter => "MissingParameter",
			StsErrorCode::InvalidParameterValue => "InvalidParameterValue",
			StsErrorCode::InvalidClientTokenId => "InvalidClientTokenId",
			StsErrorCode::ExpiredToken => "ExpiredToken",
			StsErrorCode::InternalFailure => "InternalFailure",
		}
	}

	fn http_status(&self) -> StatusCode {
		match self {
			StsErrorCode::InternalFailure => StatusCode::INTERNAL_SERVER_ERROR,
			_ => StatusCode::BAD_REQUEST,
		}
	}
}

#[derive(Debug)]
struct StsError {
	code: StsErrorCode,
	message: String,
}

impl StsError {
	fn new(code: StsErrorCode, message: impl Into<String>) -> Self {
		StsError {
			code,
			message: message.into(),
		}
	}

	fn missing(parameter: &str) -> Self {
		StsError::new(
			StsErrorCode::MissingParameter,
			format!("Missing required parameter {parameter}"),
		)
	}

	fn into_response(self, request_id: &str) -> Response {
		if self.code == StsErrorCode::InternalFailure {
			error!(code = self.code.code(), message = %self.message, "STS error");
		} else {
			debug!(code = self.code.code(), message = %self.message, "STS request rejected");
		}
		let body = StsErrorResponse {
			xmlns: STS_XMLNS,
			error: StsErrorDetail {
				error_type: "Sender",
				code: self.code.code(),
				message: capitalize_first_letter(&self.message),
			},
			request_id,
		};
		let xml = quick_xml::se::to_string(&body).unwrap_or_default();
		Response::builder()
			.status(self.code.http_status())
			.header(header::CONTENT_TYPE, MIME_XML)
			.body(Body::from(format!("{XML_HEADER}{xml}")))
			.expect("static response parts")
	}
}

#[derive(Serialize)]
#[serde(rename = "ErrorResponse")]
struct StsErrorResponse<'a> {
	#[serde(rename = "@xmlns")]
	xmlns: &'static str,
	#[serde(rename = "Error")]
	error: StsErrorDetail,
	#[serde(rename = "RequestId")]
	request_id: &'a str,
}

#[derive(Serialize)]
struct StsErrorDetail {
	#[serde(rename = "Type")]
	error_type: &'static str,
	#[serde(rename = "Code")]
	code: &'static str,
	#[serde(rename = "Message")]
	message: String,
}

#[derive(Serialize)]
#[serde(rename = "AssumeRoleWithWebIdentityResponse")]
struct AssumeRoleWithWebIdentityResponse {
	#[serde(rename = "@xmlns")]
	xmlns: &'static str,
	#[serde(rename = "AssumeRoleWithWebIdentityResult")]
	result: WebIdentityResult,
	#[serde(rename = "ResponseMetadata")]
	response_metadata: ResponseMetadata,
}

#[derive(Serialize)]
struct WebIdentityResult {
	#[serde(rename = "AssumedRoleUser")]
	assumed_role_user: AssumedRoleUser,
	#[serde(rename = "Audience")]
	audience: String,
	#[serde(rename = "Credentials")]
	credentials: CredentialsXml,
	#[serde(rename = "SubjectFromWebIdentityToken")]
	subject_from_web_identity_token: String,
	#[serde(rename = "Provider")]
	provider: String,
}

#[derive(Serialize)]
struct AssumedRoleUser {
	#[serde(rename = "Arn")]
	arn: String,
	#[serde(rename = "AssumeRoleId")]
	assume_role_id: String,
}

#[derive(Serialize)]
struct CredentialsXml {
	#[serde(rename = "AccessKeyId")]
	access_key_id: String,
	#[serde(rename = "SecretAccessKey")]
	secret_access_key: String,
	#[serde(rename = "SessionToken")]
	session_token: String,
	#[serde(rename = "Expiration")]
	expiration: String,
}

#[derive(Serialize)]
struct ResponseMetadata {
	#[serde(rename = "RequestId")]
	request_id: String,
}

/// The AssumeRoleWithWebIdentity form body. Every field is optional at the
/// decode layer so a missing parameter reports `MissingParameter` instead of
/// a generic deserialization failure.
#[derive(Debug, Default, Deserialize)]
struct AssumeRoleForm {
	#[serde(rename = "Action")]
	action: Option<String>,
	#[serde(rename = "Version")]
	_version: Option<String>,
	#[serde(rename = "WebIdentityToken")]
	web_identity_token: Option<String>,
	#[serde(rename = "RoleArn")]
	role_arn: Option<String>,
	#[serde(rename = "RoleSessionName")]
	role_session_name: Option<String>,
	#[serde(rename = "DurationSeconds")]
	duration_seconds: Option<String>,
}

async fn assume_role_with_web_identity(
	state: &ProxyState,
	ctx: &mut RequestCtx,
	req: Request,
) -> Result<Response, StsError> {
	let body = axum::body::to_bytes(req.into_body(), MAX_FORM_BYTES)
		.await
		.map_err(|e| StsError::new(StsErrorCode::InvalidParameterValue, e.to_string()))?;
	let form: AssumeRoleForm = serde_urlencoded::from_bytes(&body)
		.map_err(|e| StsError::new(StsErrorCode::InvalidParameterValue, e.to_string()))?;

	let action = form.action.ok_or_else(|| StsError::missing("Action"))?;
	if action != ACTION_ASSUME_ROLE_WITH_WEB_IDENTITY {
		return Err(StsError::new(
			StsErrorCode::InvalidParameterValue,
			format!("unsupported action {action}"),
		));
	}
	let web_identity_token = form
		.web_identity_token
		.ok_or_else(|| StsError::missing("WebIdentityToken"))?;
	let role_arn = form.role_arn.ok_or_else(|| StsError::missing("RoleArn"))?;
	let session_name = form
		.role_session_name
		.ok_or_else(|| StsError::missing("RoleSessionName"))?;
	if !valid_session_name(&session_name) {
		return Err(StsError::new(
			StsErrorCode::InvalidParameterValue,
			"roleSessionName must be 2-64 characters of [a-zA-Z0-9+=,.@_-]",
		));
	}
	let duration = match form.duration_seconds {
		None => DEFAULT_DURATION,
		Some(raw) => {
			let seconds: u64 = raw.parse().map_err(|_| {
				StsError::new(
					StsErrorCode::InvalidParameterValue,
					"durationSeconds must be a positive integer",
				)
			})?;
			if seconds < MIN_DURATION.as_secs() {
				return Err(StsError::new(
					StsErrorCode::InvalidParameterValue,
					"durationSeconds is below the minimum of 900",
				));
			}
			// clamp to the configured ceiling rather than reject
			Duration::from_secs(seconds.min(state.max_duration.as_secs()))
		},
	};

	if state.policies.get_policy(&role_arn).is_none() {
		return Err(StsError::new(
			StsErrorCode::InvalidParameterValue,
			format!("role {role_arn} cannot be assumed"),
		));
	}

	let web_identity = state.tokens.verify_web_identity(&web_identity_token).map_err(|e| {
		let code = if e.is_expired() {
			StsErrorCode::ExpiredToken
		} else {
			StsErrorCode::InvalidClientTokenId
		};
		StsError::new(code, e.to_string())
	})?;

	let (claims, session_token) = state
		.tokens
		.mint_session(&web_identity, &role_arn, duration, SystemTime::now())
		.map_err(|e| StsError::new(StsErrorCode::InternalFailure, e.to_string()))?;
	let credentials = state
		.tokens
		.credentials_for(&claims, &session_token)
		.map_err(|e| StsError::new(StsErrorCode::InternalFailure, e.to_string()))?;

	ctx.subject = Some(claims.sub.clone());
	ctx.role_arn = Some(claims.role_arn.clone());

	let response = AssumeRoleWithWebIdentityResponse {
		xmlns: STS_XMLNS,
		result: WebIdentityResult {
			assumed_role_user: AssumedRoleUser {
				arn: format!("{role_arn}/{session_name}"),
				assume_role_id: format!("{}:{}", claims.jti, session_name),
			},
			audience: audience_of(&web_identity),
			credentials: CredentialsXml {
				access_key_id: credentials.access_key_id().to_string(),
				secret_access_key: credentials.secret_access_key().to_string(),
				session_token,
				expiration: iso8601(claims.expiration()),
			},
			subject_from_web_identity_token: claims.sub.clone(),
			provider: claims.initial_issuer.clone(),
		},
		response_metadata: ResponseMetadata {
			request_id: ctx.request_id.clone(),
		},
	};
	let xml = quick_xml::se::to_string(&response)
		.map_err(|e| StsError::new(StsErrorCode::InternalFailure, e.to_string()))?;
	Ok(
		Response::builder()
			.status(StatusCode::OK)
			.header(header::CONTENT_TYPE, MIME_XML)
			.body(Body::from(format!("{XML_HEADER}{xml}")))
			.expect("static response parts"),
	)
}

fn audience_of(web_identity: &WebIdentityClaims) -> String {
	match &web_identity.aud {
		Some(serde_json::Value::String(s)) => s.clone(),
		Some(serde_json::Value::Array(values)) => values
			.first()
			.and_then(|v| v.as_str())
			.unwrap_or_default()
			.to_string(),
		_ => String::new(),
	}
}

fn valid_session_name(name: &str) -> bool {
	(2..=64).contains(&name.len())
		&& name
			.chars()
			.all(|c| c.is_ascii_alphanumeric() || "+=,.@_-".contains(c))
}

fn iso8601(t: SystemTime) -> String {
	chrono::DateTime::<chrono::Utc>::from(t)
		.format("%Y-%m-%dT%H:%M:%SZ")
		.to_string()
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap as StdHashMap;

	use http::Method;
	use http_body_util::BodyExt;
	use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
	use serde_json::json;
	use tower::ServiceExt;

	use super::*;
	use crate::backend::{Backend, BackendRegistry};
	use crate::iam::StaticPolicyManager;
	use crate::token::{OidcProvider, SESSION_TAGS_CLAIM, TokenService};

	const PROXY_KEY: &str = include_str!("../tests/testdata/proxy_key.pem");
	const PROXY_PUB: &str = include_str!("../tests/testdata/proxy_pub.pem");
	const OIDC_KEY: &str = include_str!("../tests/testdata/oidc_key.pem");
	const OIDC_PUB: &str = include_str!("../tests/testdata/oidc_pub.pem");

	const TEST_ISSUER: &str = "https://fake-testing/auth/realms/testing";
	const TEST_ROLE: &str = "arn:aws:iam::000000000000:role/allow-all";

	fn test_state() -> Arc<ProxyState> {
		let provider = OidcProvider {
			iss: TEST_ISSUER.to_string(),
			realm: "testing".to_string(),
			token_service: None,
			tokens_not_before: 0,
			decoding_key: jsonwebtoken::DecodingKey::from_rsa_pem(OIDC_PUB.as_bytes()).unwrap(),
		};
		let tokens = TokenService::new(
			"s3gate",
			PROXY_KEY.as_bytes(),
			PROXY_PUB.as_bytes(),
			vec![provider],
		)
		.unwrap();
		let backends = BackendRegistry::new(
			vec![Backend {
				region: "tst-1".to_string(),
				endpoint: "http://localhost:5000".parse().unwrap(),
				credentials: aws_credential_types::Credentials::new("AK", "SK", None, None, "test"),
			}],
			"tst-1".to_string(),
		)
		.unwrap();
		let policy = crate::iam::parse_policy(
			r#"{"Statement":[{"Effect":"Allow","Action":"s3:*","Resource":"*"}]}"#,
		)
		.unwrap();
		let mut policies = StdHashMap::new();
		policies.insert(TEST_ROLE.to_string(), Arc::new(policy));
		Arc::new(ProxyState {
			tokens,
			backends,
			policies: Arc::new(StaticPolicyManager::new(policies)),
			header_processor: None,
			client: crate::new_http_client().unwrap(),
			max_duration: Duration::from_secs(3600),
		})
	}

	fn now_secs() -> u64 {
		SystemTime::now()
			.duration_since(SystemTime::UNIX_EPOCH)
			.unwrap()
			.as_secs()
	}

	fn web_identity_token(key_pem: &str) -> String {
		let claims = json!({
			"iss": TEST_ISSUER,
			"sub": "my-subject",
			"aud": "s3gate-client",
			"iat": now_secs(),
			"exp": now_secs() + 600,
			SESSION_TAGS_CLAIM: {"principal_tags": {"org": ["a"]}},
		});
		encode(
			&Header::new(Algorithm::RS256),
			&claims,
			&EncodingKey::from_rsa_pem(key_pem.as_bytes()).unwrap(),
		)
		.unwrap()
	}

	async fn call(state: Arc<ProxyState>, form: &[(&str, &str)]) -> (StatusCode, String) {
		let body = serde_urlencoded::to_string(form).unwrap();
		let request = http::Request::builder()
			.method(Method::POST)
			.uri("/")
			.header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
			.body(Body::from(body))
			.unwrap();
		let response = router(state).oneshot(request).await.unwrap();
		let status = response.status();
		let bytes = response.into_body().collect().await.unwrap().to_bytes();
		(status, String::from_utf8_lossy(&bytes).to_string())
	}

	#[tokio::test]
	async fn assume_role_returns_credentials() {
		let state = test_state();
		let token = web_identity_token(OIDC_KEY);
		let (status, body) = call(
			state.clone(),
			&[
				("Action", ACTION_ASSUME_ROLE_WITH_WEB_IDENTITY),
				("Version", "2011-06-15"),
				("WebIdentityToken", &token),
				("RoleArn", TEST_ROLE),
				("RoleSessionName", "my-session"),
				("DurationSeconds", "1200"),
			],
		)
		.await;
		assert_eq!(status, StatusCode::OK, "{body}");
		assert!(body.contains("<AccessKeyId>"));
		assert!(body.contains("<SecretAccessKey>"));
		assert!(body.contains("<SessionToken>"));
		assert!(body.contains("<SubjectFromWebIdentityToken>my-subject</SubjectFromWebIdentityToken>"));
		assert!(body.contains("<Audience>s3gate-client</Audience>"));
		assert!(body.contains(TEST_ISSUER));

		// the session token in the body must verify against the proxy key
		let token_start = body.find("<SessionToken>").unwrap() + "<SessionToken>".len();
		let token_end = body.find("</SessionToken>").unwrap();
		let session_token = &body[token_start..token_end];
		let claims = state.tokens.verify_session_token(session_token).unwrap();
		assert_eq!(claims.role_arn, TEST_ROLE);
		assert_eq!(claims.exp - claims.iat, 1200);
	}

	#[tokio::test]
	async fn token_signed_by_wrong_key_mints_nothing() {
		let state = test_state();
		let token = web_identity_token(PROXY_KEY);
		let (status, body) = call(
			state,
			&[
				("Action", ACTION_ASSUME_ROLE_WITH_WEB_IDENTITY),
				("WebIdentityToken", &token),
				("RoleArn", TEST_ROLE),
				("RoleSessionName", "my-session"),
			],
		)
		.await;
		assert_eq!(status, StatusCode::BAD_REQUEST);
		assert!(body.contains("<Code>InvalidClientTokenId</Code>"), "{body}");
		assert!(!body.contains("<AccessKeyId>"));
	}

	#[tokio::test]
	async fn missing_parameter_is_reported() {
		let state = test_state();
		let (status, body) = call(
			state,
			&[
				("Action", ACTION_ASSUME_ROLE_WITH_WEB_IDENTITY),
				("RoleArn", TEST_ROLE),
				("RoleSessionName", "my-session"),
			],
		)
		.await;
		assert_eq!(status, StatusCode::BAD_REQUEST);
		assert!(body.contains("<Code>MissingParameter</Code>"));
		assert!(body.contains("WebIdentityToken"));
	}

	#[tokio::test]
	async fn unknown_role_is_rejected() {
		let state = test_state();
		let token = web_identity_token(OIDC_KEY);
		let (status, body) = call(
			state,
			&[
				("Action", ACTION_ASSUME_ROLE_WITH_WEB_IDENTITY),
				("WebIdentityToken", &token),
				("RoleArn", "arn:aws:iam::000000000000:role/unknown"),
				("RoleSessionName", "my-session"),
			],
		)
		.await;
		assert_eq!(status, StatusCode::BAD_REQUEST);
		assert!(body.contains("<Code>InvalidParameterValue</Code>"));
		assert!(!body.contains("<AccessKeyId>"));
	}

	#[tokio::test]
	async fn duration_is_clamped_to_the_configured_maximum() {
		let state = test_state();
		let token = web_identity_token(OIDC_KEY);
		let (status, body) = call(
			state.clone(),
			&[
				("Action", ACTION_ASSUME_ROLE_WITH_WEB_IDENTITY),
				("WebIdentityToken", &token),
				("RoleArn", TEST_ROLE),
				("RoleSessionName", "my-session"),
				("DurationSeconds", "86400"),
			],
		)
		.await;
		assert_eq!(status, StatusCode::OK, "{body}");
		let token_start = body.find("<SessionToken>").unwrap() + "<SessionToken>".len();
		let token_end = body.find("</SessionToken>").unwrap();
		let claims = state
			.tokens
			.verify_session_token(&body[token_start..token_end])
			.unwrap();
		assert_eq!(claims.exp - claims.iat, 3600);
	}
}
