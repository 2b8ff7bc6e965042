use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::Instant;

use axum::body::Body;
use axum::response::Response;
use bytes::Buf;
use http_body::{Body as HttpBody, Frame, SizeHint};
use pin_project_lite::pin_project;
use tracing::{Level, debug, event};
use uuid::Uuid;

use crate::telemetry::safe_string;

/// Per-request scratchpad. Created on ingress, owned by the handler, and
/// finally moved into the response body wrapper so the access log carries the
/// true streamed byte count.
#[derive(Debug)]
pub struct RequestCtx {
	pub request_id: String,
	pub start: Instant,
	pub method: String,
	pub path: String,
	pub subject: Option<String>,
	pub role_arn: Option<String>,
	pub action: Option<String>,
	pub resource: Option<String>,
	pub decision: Option<&'static str>,
	pub region: Option<String>,
	pub status: u16,
	pub bytes_sent: u64,
	/// ordered access-log attributes appended along the pipeline
	pub attributes: Vec<(String, String)>,
}

impl RequestCtx {
	pub fn new(method: &http::Method, path: &str) -> Self {
		RequestCtx {
			request_id: Uuid::new_v4().to_string(),
			start: Instant::now(),
			method: method.to_string(),
			path: path.to_string(),
			subject: None,
			role_arn: None,
			action: None,
			resource: None,
			decision: None,
			region: None,
			status: 0,
			bytes_sent: 0,
			attributes: Vec::new(),
		}
	}

	pub fn add_access_log_info(&mut self, key: impl Into<String>, value: impl Into<String>) {
		self.attributes.push((key.into(), value.into()));
	}
}

/// Emits the access log exactly once, when dropped. Wrapping the response
/// body with this attached means streamed responses log after their last
/// byte went out, not when the handler returned.
#[derive(Debug)]
pub struct AccessLog {
	ctx: Option<RequestCtx>,
}

impl From<RequestCtx> for AccessLog {
	fn from(ctx: RequestCtx) -> Self {
		AccessLog { ctx: Some(ctx) }
	}
}

impl AccessLog {
	fn add_bytes(&mut self, n: usize) {
		if let Some(ctx) = self.ctx.as_mut() {
			ctx.bytes_sent = ctx.bytes_sent.saturating_add(n as u64);
		}
	}
}

impl Drop for AccessLog {
	fn drop(&mut self) {
		let Some(ctx) = self.ctx.take() else {
			return;
		};
		let attributes = if ctx.attributes.is_empty() {
			None
		} else {
			Some(
				ctx
					.attributes
					.iter()
					.map(|(k, v)| format!("{k}={v}"))
					.collect::<Vec<_>>()
					.join(" "),
			)
		};
		event!(
			target: "access",
			Level::INFO,
			request_id = %ctx.request_id,
			http.method = %ctx.method,
			http.path = %ctx.path,
			http.status = ctx.status,
			bytes = ctx.bytes_sent,
			subject = ctx.subject.as_deref().unwrap_or("-"),
			role = ctx.role_arn.as_deref().unwrap_or("-"),
			action = ctx.action.as_deref().unwrap_or("-"),
			resource = ctx.resource.as_deref().unwrap_or("-"),
			decision = ctx.decision.unwrap_or("-"),
			region = ctx.region.as_deref().unwrap_or("-"),
			duration_ms = ctx.start.elapsed().as_millis() as u64,
			attributes = attributes.as_deref().unwrap_or(""),
		);
	}
}

pin_project! {
	/// Response body wrapper that tracks bytes written into the request
	/// context and owns the access-log emission.
	pub struct CountingBody<B> {
		#[pin]
		body: B,
		log: AccessLog,
	}
}

impl<B> CountingBody<B> {
	pub fn new(body: B, ctx: RequestCtx) -> Self {
		CountingBody {
			body,
			log: ctx.into(),
		}
	}

	pub fn bytes_sent(&self) -> u64 {
		self.log.ctx.as_ref().map(|c| c.bytes_sent).unwrap_or(0)
	}
}

impl<B> HttpBody for CountingBody<B>
where
	B: HttpBody,
{
	type Data = B::Data;
	type Error = B::Error;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
		let this = self.project();
		match ready!(this.body.poll_frame(cx)) {
			Some(Ok(frame)) => {
				if let Some(data) = frame.data_ref() {
					this.log.add_bytes(data.remaining());
				}
				Poll::Ready(Some(Ok(frame)))
			},
			other => Poll::Ready(other),
		}
	}

	fn is_end_stream(&self) -> bool {
		self.body.is_end_stream()
	}

	fn size_hint(&self) -> SizeHint {
		self.body.size_hint()
	}
}

/// Record the response status in the context and attach the counting body.
pub fn track_response(response: Response, mut ctx: RequestCtx) -> Response {
	ctx.status = response.status().as_u16();
	response.map(|body| Body::new(CountingBody::new(body, ctx)))
}

/// Optional hook over upstream response headers, before they are streamed to
/// the client.
pub trait HeaderProcessor: Send + Sync {
	fn process_header(&self, ctx: &mut RequestCtx, name: &str, values: &[String]);
}

/// Copies configured response headers into the access-log attribute list.
pub struct HeaderToAccessLog {
	headers: HashSet<String>,
}

impl HeaderToAccessLog {
	/// No configured headers means no processor at all.
	pub fn new(names: &[String]) -> Option<Arc<Self>> {
		if names.is_empty() {
			return None;
		}
		Some(Arc::new(HeaderToAccessLog {
			headers: names.iter().map(|n| n.to_ascii_lowercase()).collect(),
		}))
	}
}

impl HeaderProcessor for HeaderToAccessLog {
	fn process_header(&self, ctx: &mut RequestCtx, name: &str, values: &[String]) {
		if !self.headers.contains(&name.to_ascii_lowercase()) {
			return;
		}
		match values.first() {
			None => debug!(header = name, "encountered header with no values"),
			Some(first) => ctx.add_access_log_info(name.to_string(), safe_string(first)),
		}
	}
}
