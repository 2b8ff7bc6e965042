use axum::body::Body;
use axum::response::Response;
use http::{StatusCode, header};
use serde::Serialize;

pub const XML_HEADER: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n";
pub const MIME_XML: &str = "application/xml";

/// Error codes surfaced to S3 clients. The wire `Code`, default message and
/// HTTP status follow the AWS S3 error responses document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S3ErrorCode {
	AccessDenied,
	InternalError,
	UpstreamError,
	InvalidAccessKeyId,
	InvalidSignature,
	InvalidSecurity,
	InvalidRegion,
}

impl S3ErrorCode {
	pub fn code(&self) -> &'static str {
		match self {
			S3ErrorCode::AccessDenied => "AccessDenied",
			S3ErrorCode::InternalError | S3ErrorCode::UpstreamError => "InternalError",
			S3ErrorCode::InvalidAccessKeyId => "InvalidAccessKeyId",
			S3ErrorCode::InvalidSignature => "InvalidSignature",
			S3ErrorCode::InvalidSecurity => "InvalidSecurity",
			S3ErrorCode::InvalidRegion => "InvalidRegion",
		}
	}

	pub fn http_status(&self) -> StatusCode {
		match self {
			S3ErrorCode::AccessDenied => StatusCode::FORBIDDEN,
			S3ErrorCode::InternalError | S3ErrorCode::UpstreamError => StatusCode::INTERNAL_SERVER_ERROR,
			S3ErrorCode::InvalidAccessKeyId => StatusCode::FORBIDDEN,
			S3ErrorCode::InvalidSignature => StatusCode::BAD_REQUEST,
			S3ErrorCode::InvalidSecurity => StatusCode::FORBIDDEN,
			S3ErrorCode::InvalidRegion => StatusCode::BAD_REQUEST,
		}
	}

	pub fn description(&self) -> &'static str {
		match self {
			S3ErrorCode::AccessDenied => "Credentials did not allow the request.",
			S3ErrorCode::UpstreamError => {
				"An upstream service required for this operation failed - please try again or contact an administrator."
			},
			S3ErrorCode::InternalError => "We encountered an internal error, please try again.",
			S3ErrorCode::InvalidAccessKeyId => {
				"The AWS Access Key Id you provided does not exist in our records."
			},
			S3ErrorCode::InvalidSignature => {
				"The request signature that the server calculated does not match the signature that you provided. Check your AWS secret access key and signing method."
			},
			S3ErrorCode::InvalidSecurity => "The provided security credentials are not valid.",
			S3ErrorCode::InvalidRegion => "The provided region is not valid.",
		}
	}
}

#[derive(Debug, Serialize)]
#[serde(rename = "Error")]
struct S3ErrorBody<'a> {
	#[serde(rename = "Code")]
	code: &'a str,
	#[serde(rename = "Message")]
	message: String,
	#[serde(rename = "RequestId")]
	request_id: &'a str,
	#[serde(rename = "HostId")]
	host_id: &'a str,
}

/// Render the S3 `<Error>` envelope for an error code. A detail message, when
/// present, replaces the canned description and gets its first letter
/// capitalized since AWS SDKs expect capitalized error messages.
pub fn s3_error_response(code: S3ErrorCode, request_id: &str, detail: Option<&str>) -> Response {
	let message = match detail {
		Some(d) => capitalize_first_letter(d),
		None => code.description().to_string(),
	};
	let body = S3ErrorBody {
		code: code.code(),
		message,
		request_id,
		host_id: "",
	};
	let xml = quick_xml::se::to_string(&body).unwrap_or_default();
	Response::builder()
		.status(code.http_status())
		.header(header::CONTENT_TYPE, MIME_XML)
		.body(Body::from(format!("{XML_HEADER}{xml}")))
		.expect("static response parts")
}

pub fn capitalize_first_letter(s: &str) -> String {
	let mut chars = s.chars();
	match chars.next() {
		Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
		None => String::new(),
	}
}
