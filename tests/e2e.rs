use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use axum::Router;
use axum::extract::State;
use http::{Method, StatusCode, Uri, header};
use http_body_util::BodyExt;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, encode};
use s3gate::backend::{Backend, BackendRegistry};
use s3gate::iam::StaticPolicyManager;
use s3gate::token::{OidcProvider, SESSION_TAGS_CLAIM, TokenService};
use s3gate::{HttpClient, ProxyState, new_http_client, proxy, sigv4, sts};
use serde_json::json;
use tower::ServiceExt;

const PROXY_KEY: &str = include_str!("testdata/proxy_key.pem");
const PROXY_PUB: &str = include_str!("testdata/proxy_pub.pem");
const OIDC_KEY: &str = include_str!("testdata/oidc_key.pem");
const OIDC_PUB: &str = include_str!("testdata/oidc_pub.pem");

const TEST_ISSUER: &str = "https://fake-testing/auth/realms/testing";
const ROLE_ALLOW_ALL: &str = "arn:aws:iam::000000000000:role/allow-all";
const ROLE_REGION1_ONLY: &str = "arn:aws:iam::000000000000:role/region1-only";

const REGION_1: &str = "tst-1";
const REGION_2: &str = "eu-test-2";

/// Each fake backend answers every request with its own region name, which
/// lets the tests assert which backend a request was routed to.
async fn spawn_backend(region: &'static str) -> SocketAddr {
	let app = Router::new()
		.fallback(|State(region): State<String>| async move { region })
		.with_state(region.to_string());
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		axum::serve(listener, app).await.unwrap();
	});
	addr
}

struct Fixture {
	state: Arc<ProxyState>,
	proxy_url: String,
	client: HttpClient,
}

async fn fixture() -> Fixture {
	let backend1 = spawn_backend(REGION_1).await;
	let backend2 = spawn_backend(REGION_2).await;

	let provider = OidcProvider {
		iss: TEST_ISSUER.to_string(),
		realm: "testing".to_string(),
		token_service: None,
		tokens_not_before: 0,
		decoding_key: DecodingKey::from_rsa_pem(OIDC_PUB.as_bytes()).unwrap(),
	};
	let tokens = TokenService::new(
		"s3gate",
		PROXY_KEY.as_bytes(),
		PROXY_PUB.as_bytes(),
		vec![provider],
	)
	.unwrap();

	let backends = BackendRegistry::new(
		vec![
			Backend {
				region: REGION_1.to_string(),
				endpoint: format!("http://{backend1}").parse().unwrap(),
				credentials: aws_credential_types::Credentials::new(
					"AKIDBACKEND1",
					"backend1-secret",
					None,
					None,
					"test",
				),
			},
			Backend {
				region: REGION_2.to_string(),
				endpoint: format!("http://{backend2}").parse().unwrap(),
				credentials: aws_credential_types::Credentials::new(
					"AKIDBACKEND2",
					"backend2-secret",
					None,
					None,
					"test",
				),
			},
		],
		REGION_2.to_string(),
	)
	.unwrap();

	let allow_all = s3gate::iam::parse_policy(
		r#"{"Statement":[{"Effect":"Allow","Action":"s3:*","Resource":"arn:aws:s3:::*"}]}"#,
	)
	.unwrap();
	let region1_only = s3gate::iam::parse_policy(
		r#"{
			"Statement": [
				{"Effect": "Allow", "Action": "s3:*", "Resource": "arn:aws:s3:::*"},
				{
					"Effect": "Deny",
					"Action": "s3:*",
					"Resource": "arn:aws:s3:::*",
					"Condition": {"StringNotLike": {"aws:RequestedRegion": "tst-1"}}
				}
			]
		}"#,
	)
	.unwrap();
	let mut policies = HashMap::new();
	policies.insert(ROLE_ALLOW_ALL.to_string(), Arc::new(allow_all));
	policies.insert(ROLE_REGION1_ONLY.to_string(), Arc::new(region1_only));

	let state = Arc::new(ProxyState {
		tokens,
		backends,
		policies: Arc::new(StaticPolicyManager::new(policies)),
		header_processor: None,
		client: new_http_client().unwrap(),
		max_duration: Duration::from_secs(3600),
	});

	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let proxy_addr = listener.local_addr().unwrap();
	let app = proxy::router(state.clone());
	tokio::spawn(async move {
		axum::serve(listener, app).await.unwrap();
	});

	Fixture {
		state,
		proxy_url: format!("http://{proxy_addr}"),
		client: new_http_client().unwrap(),
	}
}

fn now_secs() -> u64 {
	SystemTime::now()
		.duration_since(SystemTime::UNIX_EPOCH)
		.unwrap()
		.as_secs()
}

fn web_identity_token(subject: &str) -> String {
	let claims = json!({
		"iss": TEST_ISSUER,
		"sub": subject,
		"iat": now_secs(),
		"exp": now_secs() + 1200,
		SESSION_TAGS_CLAIM: {"principal_tags": {"org": ["a"]}},
	});
	encode(
		&Header::new(Algorithm::RS256),
		&claims,
		&EncodingKey::from_rsa_pem(OIDC_KEY.as_bytes()).unwrap(),
	)
	.unwrap()
}

fn xml_field<'a>(body: &'a str, tag: &str) -> &'a str {
	let open = format!("<{tag}>");
	let close = format!("</{tag}>");
	let start = body.find(&open).unwrap_or_else(|| panic!("no {tag} in {body}")) + open.len();
	let end = body.find(&close).unwrap();
	&body[start..end]
}

/// Exchange a web-identity token for proxy credentials through the STS
/// router, like an SDK would.
async fn get_credentials(state: &Arc<ProxyState>, role_arn: &str) -> aws_credential_types::Credentials {
	let token = web_identity_token("my-subject");
	let form = serde_urlencoded::to_string([
		("Action", "AssumeRoleWithWebIdentity"),
		("Version", "2011-06-15"),
		("WebIdentityToken", token.as_str()),
		("RoleArn", role_arn),
		("RoleSessionName", "my-session"),
		("DurationSeconds", "1200"),
	])
	.unwrap();
	let request = http::Request::builder()
		.method(Method::POST)
		.uri("/")
		.header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
		.body(axum::body::Body::from(form))
		.unwrap();
	let response = sts::router(state.clone()).oneshot(request).await.unwrap();
	assert_eq!(response.status(), StatusCode::OK);
	let body = response.into_body().collect().await.unwrap().to_bytes();
	let body = String::from_utf8_lossy(&body).to_string();
	aws_credential_types::Credentials::new(
		xml_field(&body, "AccessKeyId").to_string(),
		xml_field(&body, "SecretAccessKey").to_string(),
		Some(xml_field(&body, "SessionToken").to_string()),
		None,
		"test",
	)
}

async fn send(
	client: &HttpClient,
	parts: http::request::Parts,
) -> (StatusCode, String) {
	let request = http::Request::from_parts(parts, axum::body::Body::empty());
	let response = client.request(request).await.unwrap();
	let status = response.status();
	let body = response.into_body().collect().await.unwrap().to_bytes();
	(status, String::from_utf8_lossy(&body).to_string())
}

fn base_parts(proxy_url: &str, path: &str) -> http::request::Parts {
	let uri: Uri = format!("{proxy_url}{path}").parse().unwrap();
	let authority = uri.authority().unwrap().to_string();
	let request = http::Request::builder()
		.method(Method::GET)
		.uri(uri)
		.header(header::HOST, authority)
		.body(())
		.unwrap();
	request.into_parts().0
}

async fn signed_get(
	fixture: &Fixture,
	path: &str,
	region: &str,
	creds: &aws_credential_types::Credentials,
) -> (StatusCode, String) {
	let mut parts = base_parts(&fixture.proxy_url, path);
	parts.headers.insert(
		sigv4::X_AMZ_CONTENT_SHA256,
		header::HeaderValue::from_static(sigv4::UNSIGNED_PAYLOAD),
	);
	sigv4::sign_request(&mut parts, creds, region, SystemTime::now()).unwrap();
	send(&fixture.client, parts).await
}

#[tokio::test]
async fn the_region_selects_the_backend() {
	let fixture = fixture().await;
	let creds = get_credentials(&fixture.state, ROLE_ALLOW_ALL).await;

	for region in [REGION_1, REGION_2] {
		let (status, body) =
			signed_get(&fixture, "/backenddetails/region.txt", region, &creds).await;
		assert_eq!(status, StatusCode::OK, "{body}");
		assert_eq!(body, region);
	}
}

#[tokio::test]
async fn presigned_urls_work_until_they_expire() {
	let fixture = fixture().await;
	let creds = get_credentials(&fixture.state, ROLE_ALLOW_ALL).await;

	let mut parts = base_parts(&fixture.proxy_url, "/backenddetails/region.txt");
	sigv4::presign_request(
		&mut parts,
		&creds,
		REGION_1,
		Duration::from_secs(300),
		SystemTime::now(),
	)
	.unwrap();
	let (status, body) = send(&fixture.client, parts).await;
	assert_eq!(status, StatusCode::OK, "{body}");
	assert_eq!(body, REGION_1);

	// the same URL aged past X-Amz-Expires is rejected
	let mut parts = base_parts(&fixture.proxy_url, "/backenddetails/region.txt");
	sigv4::presign_request(
		&mut parts,
		&creds,
		REGION_1,
		Duration::from_secs(300),
		SystemTime::now() - Duration::from_secs(600),
	)
	.unwrap();
	let (status, body) = send(&fixture.client, parts).await;
	assert_eq!(status, StatusCode::FORBIDDEN, "{body}");
	assert!(body.contains("<Code>AccessDenied</Code>"), "{body}");
}

#[tokio::test]
async fn policy_conditions_deny_other_regions() {
	let fixture = fixture().await;
	let creds = get_credentials(&fixture.state, ROLE_REGION1_ONLY).await;

	let (status, body) =
		signed_get(&fixture, "/backenddetails/region.txt", REGION_1, &creds).await;
	assert_eq!(status, StatusCode::OK, "{body}");
	assert_eq!(body, REGION_1);

	let (status, body) =
		signed_get(&fixture, "/backenddetails/region.txt", REGION_2, &creds).await;
	assert_eq!(status, StatusCode::FORBIDDEN, "{body}");
	assert!(body.contains("<Code>AccessDenied</Code>"), "{body}");
}

#[tokio::test]
async fn unknown_regions_are_rejected() {
	let fixture = fixture().await;
	let creds = get_credentials(&fixture.state, ROLE_ALLOW_ALL).await;

	let (status, body) =
		signed_get(&fixture, "/backenddetails/region.txt", "mars-1", &creds).await;
	assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
	assert!(body.contains("<Code>InvalidRegion</Code>"), "{body}");
}

#[tokio::test]
async fn foreign_access_keys_are_rejected() {
	let fixture = fixture().await;
	let creds = get_credentials(&fixture.state, ROLE_ALLOW_ALL).await;
	let forged = aws_credential_types::Credentials::new(
		"ABCDEFGHIJKLMNOPQRSTUVWXYZ",
		creds.secret_access_key(),
		creds.session_token().map(str::to_string),
		None,
		"test",
	);

	let (status, body) =
		signed_get(&fixture, "/backenddetails/region.txt", REGION_1, &forged).await;
	assert_eq!(status, StatusCode::FORBIDDEN, "{body}");
	assert!(body.contains("<Code>InvalidAccessKeyId</Code>"), "{body}");
}

#[tokio::test]
async fn tampered_secrets_fail_signature_verification() {
	let fixture = fixture().await;
	let creds = get_credentials(&fixture.state, ROLE_ALLOW_ALL).await;
	let wrong_secret = aws_credential_types::Credentials::new(
		creds.access_key_id(),
		"not-the-derived-secret",
		creds.session_token().map(str::to_string),
		None,
		"test",
	);

	let (status, body) =
		signed_get(&fixture, "/backenddetails/region.txt", REGION_1, &wrong_secret).await;
	assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
	assert!(body.contains("<Code>InvalidSignature</Code>"), "{body}");
}

#[tokio::test]
async fn unsigned_requests_are_denied() {
	let fixture = fixture().await;
	let parts = base_parts(&fixture.proxy_url, "/backenddetails/region.txt");
	let (status, body) = send(&fixture.client, parts).await;
	assert_eq!(status, StatusCode::FORBIDDEN, "{body}");
	assert!(body.contains("<Code>AccessDenied</Code>"), "{body}");
}

#[tokio::test]
async fn expired_sessions_are_rejected() {
	let fixture = fixture().await;
	let token = web_identity_token("my-subject");
	let web_identity = fixture.state.tokens.verify_web_identity(&token).unwrap();
	let two_hours_ago = SystemTime::now() - Duration::from_secs(7200);
	let (claims, session_token) = fixture
		.state
		.tokens
		.mint_session(&web_identity, ROLE_ALLOW_ALL, Duration::from_secs(3600), two_hours_ago)
		.unwrap();
	let creds = fixture
		.state
		.tokens
		.credentials_for(&claims, &session_token)
		.unwrap();

	let (status, body) =
		signed_get(&fixture, "/backenddetails/region.txt", REGION_1, &creds).await;
	assert_eq!(status, StatusCode::FORBIDDEN, "{body}");
	assert!(body.contains("<Code>InvalidSecurity</Code>"), "{body}");
}
