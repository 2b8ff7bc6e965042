use std::collections::BTreeMap;

use http::Method;

use super::ConditionValue;

pub const CONTEXT_KEY_REQUESTED_REGION: &str = "aws:RequestedRegion";
pub const CONTEXT_KEY_PRINCIPAL_TAG_PREFIX: &str = "aws:PrincipalTag/";

/// The (action, resource, context) tuple a policy is evaluated against.
/// Built fresh per request and not mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct IamAction {
	pub action: String,
	pub resource: String,
	pub context: BTreeMap<String, ConditionValue>,
}

impl IamAction {
	pub fn new(action: impl Into<String>, resource: impl Into<String>) -> Self {
		IamAction {
			action: action.into(),
			resource: resource.into(),
			context: BTreeMap::new(),
		}
	}

	pub fn insert_context(&mut self, key: impl Into<String>, value: ConditionValue) {
		self.context.insert(key.into(), value);
	}
}

#[derive(thiserror::Error, Debug)]
pub enum ActionError {
	#[error("unsupported S3 operation: {method} {path}")]
	UnsupportedOperation { method: Method, path: String },
}

/// Derive the IAM action for a path-style S3 request. The query parameters
/// disambiguate the multipart operations that share a method with the plain
/// object operations.
pub fn action_for_request(
	method: &Method,
	path: &str,
	query: &[(String, String)],
	region: &str,
	principal_tags: &BTreeMap<String, Vec<String>>,
) -> Result<IamAction, ActionError> {
	let (bucket, key) = split_bucket_key(path);
	let has_param = |name: &str| query.iter().any(|(k, _)| k == name);
	let is_read = *method == Method::GET || *method == Method::HEAD;

	let action = if is_read && bucket.is_none() {
		"s3:ListAllMyBuckets"
	} else if is_read && key.is_none() {
		"s3:ListBucket"
	} else if is_read {
		"s3:GetObject"
	} else if *method == Method::PUT && key.is_some() {
		"s3:PutObject"
	} else if *method == Method::POST
		&& key.is_some()
		&& (has_param("uploads") || has_param("uploadId"))
	{
		"s3:PutObject"
	} else if *method == Method::DELETE && key.is_some() && has_param("uploadId") {
		"s3:AbortMultipartUpload"
	} else if *method == Method::DELETE && key.is_some() {
		"s3:DeleteObject"
	} else {
		return Err(ActionError::UnsupportedOperation {
			method: method.clone(),
			path: path.to_string(),
		});
	};

	let resource = match (bucket, key) {
		(Some(bucket), Some(key)) => format!("arn:aws:s3:::{bucket}/{key}"),
		(Some(bucket), None) => format!("arn:aws:s3:::{bucket}"),
		(None, _) => "arn:aws:s3:::*".to_string(),
	};

	let mut action = IamAction::new(action, resource);
	action.insert_context(
		CONTEXT_KEY_REQUESTED_REGION,
		ConditionValue::single(region),
	);
	for (tag, values) in principal_tags {
		let value = if values.len() == 1 {
			ConditionValue::single(values[0].clone())
		} else {
			ConditionValue::multi(values.clone())
		};
		action.insert_context(format!("{CONTEXT_KEY_PRINCIPAL_TAG_PREFIX}{tag}"), value);
	}
	Ok(action)
}

fn split_bucket_key(path: &str) -> (Option<&str>, Option<&str>) {
	let trimmed = path.trim_start_matches('/');
	if trimmed.is_empty() {
		return (None, None);
	}
	match trimmed.split_once('/') {
		Some((bucket, "")) => (Some(bucket), None),
		Some((bucket, key)) => (Some(bucket), Some(key)),
		None => (Some(trimmed), None),
	}
}
