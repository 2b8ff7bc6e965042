use std::collections::HashSet;
use std::sync::Arc;
use std::time::SystemTime;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::Response;
use bytes::Buf;
use http::request::Parts;
use http::{HeaderValue, Uri, header};
use http_body::Body as HttpBody;
use http_body_util::BodyExt;
use tracing::{debug, error, warn};

use crate::ProxyState;
use crate::backend::Backend;
use crate::context::{RequestCtx, track_response};
use crate::errors::{S3ErrorCode, s3_error_response};
use crate::iam::action::{ActionError, action_for_request};
use crate::iam::{EvalError, PolicyEvaluator};
use crate::sigv4::{self, RequestSignature, SignatureError};
use crate::token::TokenError;

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("{0}")]
	Signature(#[from] SignatureError),
	#[error("{0}")]
	Token(#[from] TokenError),
	#[error("access denied")]
	AccessDenied,
	#[error("{0}")]
	UnsupportedOperation(#[from] ActionError),
	#[error("no policy attached to role {0}")]
	UnknownRole(String),
	#[error("policy evaluation failed: {0}")]
	Evaluation(#[from] EvalError),
	#[error("unknown region {0}")]
	InvalidRegion(String),
	#[error("upstream call failed: {0}")]
	Upstream(String),
	#[error("internal error: {0}")]
	Internal(String),
}

impl ProxyError {
	pub fn code(&self) -> S3ErrorCode {
		match self {
			ProxyError::Signature(SignatureError::Mismatch) => S3ErrorCode::InvalidSignature,
			ProxyError::Signature(SignatureError::Malformed(_)) => S3ErrorCode::InvalidSignature,
			ProxyError::Signature(SignatureError::UnsupportedAlgorithm(_)) => {
				S3ErrorCode::InvalidSignature
			},
			ProxyError::Signature(SignatureError::Missing) => S3ErrorCode::AccessDenied,
			ProxyError::Signature(SignatureError::Expired) => S3ErrorCode::AccessDenied,
			ProxyError::Signature(SignatureError::Signing(_)) => S3ErrorCode::InternalError,
			ProxyError::Token(TokenError::InvalidAccessKeyId | TokenError::MissingSessionToken) => {
				S3ErrorCode::InvalidAccessKeyId
			},
			ProxyError::Token(_) => S3ErrorCode::InvalidSecurity,
			ProxyError::AccessDenied
			| ProxyError::UnsupportedOperation(_)
			| ProxyError::UnknownRole(_)
			| ProxyError::Evaluation(_) => S3ErrorCode::AccessDenied,
			ProxyError::InvalidRegion(_) => S3ErrorCode::InvalidRegion,
			ProxyError::Upstream(_) => S3ErrorCode::UpstreamError,
			ProxyError::Internal(_) => S3ErrorCode::InternalError,
		}
	}
}

pub fn router(state: Arc<ProxyState>) -> axum::Router {
	axum::Router::new().fallback(handle).with_state(state)
}

async fn handle(State(state): State<Arc<ProxyState>>, req: Request) -> Response {
	let mut ctx = RequestCtx::new(req.method(), req.uri().path());
	match pipeline(&state, &mut ctx, req).await {
		Ok(response) => track_response(response, ctx),
		Err((err, leftover_body)) => {
			let code = err.code();
			match code {
				S3ErrorCode::InternalError | S3ErrorCode::UpstreamError => {
					error!(request_id = %ctx.request_id, error = %err, "S3 request failed");
				},
				_ => {
					debug!(request_id = %ctx.request_id, error = %err, "S3 request rejected");
				},
			}
			// Drain before answering so the client connection stays reusable.
			if let Some(body) = leftover_body {
				drain_body(body, &ctx.request_id).await;
			}
			let response = s3_error_response(code, &ctx.request_id, Some(&err.to_string()));
			track_response(response, ctx)
		},
	}
}

type PipelineError = (ProxyError, Option<Body>);

async fn pipeline(
	state: &ProxyState,
	ctx: &mut RequestCtx,
	req: Request,
) -> Result<Response, PipelineError> {
	let (mut parts, body) = req.into_parts();
	let query = sigv4::parse_query(&parts.uri);

	// AUTHENTICATE: parse signature material, recover the session, recompute.
	let signature = match sigv4::parse_request_signature(&parts.headers, &query) {
		Ok(Some(signature)) => signature,
		Ok(None) => return Err((SignatureError::Missing.into(), Some(body))),
		Err(e) => return Err((e.into(), Some(body))),
	};
	let region = if signature.scope.region.is_empty() {
		state.backends.default_region().to_string()
	} else {
		signature.scope.region.clone()
	};
	ctx.region = Some(region.clone());

	if let Err(e) = sigv4::check_presign_expiry(&signature, SystemTime::now()) {
		return Err((e.into(), Some(body)));
	}

	let (claims, creds) = match state.tokens.authenticate(
		&signature.scope.access_key_id,
		signature.security_token.as_deref(),
	) {
		Ok(authenticated) => authenticated,
		Err(e) => return Err((e.into(), Some(body))),
	};
	ctx.subject = Some(claims.sub.clone());
	ctx.role_arn = Some(claims.role_arn.clone());

	if let Err(e) = sigv4::verify_request(&parts, &signature, &creds) {
		return Err((e.into(), Some(body)));
	}

	// AUTHORISE: derive the IAM action and evaluate the role policy.
	let action = match action_for_request(
		&parts.method,
		parts.uri.path(),
		&query,
		&region,
		&claims.principal_tags(),
	) {
		Ok(action) => action,
		Err(e) => return Err((e.into(), Some(body))),
	};
	ctx.action = Some(action.action.clone());
	ctx.resource = Some(action.resource.clone());

	let Some(policy) = state.policies.get_policy(&claims.role_arn) else {
		ctx.decision = Some("deny");
		return Err((ProxyError::UnknownRole(claims.role_arn.clone()), Some(body)));
	};
	let evaluator = PolicyEvaluator::new(policy);
	match evaluator.evaluate_all(std::slice::from_ref(&action)) {
		Ok(verdict) if verdict.allowed => {
			ctx.decision = Some("allow");
		},
		Ok(verdict) => {
			ctx.decision = Some("deny");
			debug!(
				request_id = %ctx.request_id,
				reason = %verdict.reason,
				action = %action.action,
				resource = %action.resource,
				"policy denied request"
			);
			return Err((ProxyError::AccessDenied, Some(body)));
		},
		Err(e) => {
			ctx.decision = Some("deny");
			error!(request_id = %ctx.request_id, error = %e, "policy evaluation failed");
			return Err((e.into(), Some(body)));
		},
	}

	// REWRITE: point the request at the backend for the scope region.
	let Some(backend) = state.backends.lookup(&region) else {
		return Err((ProxyError::InvalidRegion(region), Some(body)));
	};
	if let Err(e) = rewrite_for_backend(&mut parts, &signature, &backend) {
		return Err((e, Some(body)));
	}

	// FORWARD: re-sign with backend credentials, same timestamp if possible.
	let signing_time = parts
		.headers
		.get(sigv4::X_AMZ_DATE)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| sigv4::parse_amz_date(v).ok())
		.unwrap_or_else(SystemTime::now);
	if let Err(e) = sigv4::sign_request(&mut parts, &backend.credentials, &backend.region, signing_time)
	{
		return Err((ProxyError::Internal(e.to_string()), Some(body)));
	}

	let upstream_response = forward(state, Request::from_parts(parts, body)).await?;
	if upstream_response.status().is_server_error() {
		return Err((
			ProxyError::Upstream(format!("backend answered {}", upstream_response.status())),
			None,
		));
	}

	// STREAM: response headers pass the optional processor, the body streams
	// through the tracking writer attached by the caller.
	let mut response = upstream_response.map(Body::new);
	if let Some(processor) = &state.header_processor {
		let names: Vec<http::HeaderName> = response.headers().keys().cloned().collect();
		for name in names {
			let values: Vec<String> = response
				.headers()
				.get_all(&name)
				.iter()
				.filter_map(|v| v.to_str().ok().map(str::to_string))
				.collect();
			processor.process_header(ctx, name.as_str(), &values);
		}
	}
	Ok(response)
}

/// Swap the target host for the backend endpoint, drop signature material
/// and cleanable headers, leave path and remaining headers untouched.
fn rewrite_for_backend(
	parts: &mut Parts,
	signature: &RequestSignature,
	backend: &Backend,
) -> Result<(), ProxyError> {
	let authority = backend
		.endpoint
		.authority()
		.ok_or_else(|| ProxyError::Internal("backend endpoint has no authority".to_string()))?
		.clone();
	let scheme = backend.endpoint.scheme_str().unwrap_or("http");

	let stripped_query = sigv4::strip_signature_query(parts.uri.query());
	let path_and_query = if stripped_query.is_empty() {
		parts.uri.path().to_string()
	} else {
		format!("{}?{}", parts.uri.path(), stripped_query)
	};
	parts.uri = Uri::builder()
		.scheme(scheme)
		.authority(authority.as_str())
		.path_and_query(path_and_query)
		.build()
		.map_err(|e| ProxyError::Internal(format!("rewriting uri: {e}")))?;

	parts.headers.remove(header::AUTHORIZATION);
	parts.headers.remove(sigv4::X_AMZ_SECURITY_TOKEN);

	let to_keep: HashSet<String> = signature
		.signed_headers
		.iter()
		.filter(|h| h.as_str() != "authorization" && h.as_str() != "x-amz-security-token")
		.cloned()
		.collect();
	sigv4::headers::clean_headers_to(&mut parts.headers, &to_keep);

	let host = HeaderValue::from_str(authority.as_str())
		.map_err(|e| ProxyError::Internal(format!("backend host header: {e}")))?;
	parts.headers.insert(header::HOST, host);
	Ok(())
}

/// One upstream round trip, with a single transparent retry for connect-level
/// failures on requests whose body is empty (anything else cannot be
/// replayed).
async fn forward(
	state: &ProxyState,
	req: Request,
) -> Result<http::Response<hyper::body::Incoming>, PipelineError> {
	let replayable = req.body().size_hint().exact() == Some(0);
	if !replayable {
		return state
			.client
			.request(req)
			.await
			.map_err(|e| (ProxyError::Upstream(e.to_string()), None));
	}

	let (parts, body) = req.into_parts();
	match state
		.client
		.request(Request::from_parts(parts.clone(), Body::empty()))
		.await
	{
		Ok(response) => Ok(response),
		Err(e) if e.is_connect() => {
			warn!(error = %e, "upstream connect failed, retrying once");
			state
				.client
				.request(Request::from_parts(parts, body))
				.await
				.map_err(|e| (ProxyError::Upstream(e.to_string()), None))
		},
		Err(e) => Err((ProxyError::Upstream(e.to_string()), None)),
	}
}

async fn drain_body(mut body: Body, request_id: &str) {
	let mut drained: u64 = 0;
	while let Some(frame) = body.frame().await {
		match frame {
			Ok(frame) => {
				if let Some(data) = frame.data_ref() {
					drained = drained.saturating_add(data.remaining() as u64);
				}
			},
			Err(e) => {
				debug!(request_id, error = %e, "request body drain ended early");
				return;
			},
		}
	}
	if drained > 0 {
		debug!(request_id, bytes = drained, "drained request body before error response");
	}
}
