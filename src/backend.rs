use std::collections::HashMap;
use std::sync::Arc;

use aws_credential_types::Credentials;
use http::Uri;

/// One S3 backend: where to reach it and what to sign with.
#[derive(Debug, Clone)]
pub struct Backend {
	pub region: String,
	pub endpoint: Uri,
	pub credentials: Credentials,
}

/// Region-keyed backend lookup. Built once at startup, read-only afterwards.
#[derive(Debug, Clone)]
pub struct BackendRegistry {
	backends: HashMap<String, Arc<Backend>>,
	default_region: String,
}

impl BackendRegistry {
	pub fn new(backends: Vec<Backend>, default_region: String) -> anyhow::Result<Self> {
		let mut by_region = HashMap::new();
		for backend in backends {
			if by_region
				.insert(backend.region.clone(), Arc::new(backend))
				.is_some()
			{
				anyhow::bail!("duplicate backend region");
			}
		}
		if !by_region.contains_key(&default_region) {
			anyhow::bail!("default region {default_region} is not a defined backend");
		}
		Ok(BackendRegistry {
			backends: by_region,
			default_region,
		})
	}

	pub fn lookup(&self, region: &str) -> Option<Arc<Backend>> {
		self.backends.get(region).cloned()
	}

	pub fn default_region(&self) -> &str {
		&self.default_region
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn backend(region: &str, endpoint: &str) -> Backend {
		Backend {
			region: region.to_string(),
			endpoint: endpoint.parse().unwrap(),
			credentials: Credentials::new("AK", "SK", None, None, "test"),
		}
	}

	#[test]
	fn lookup_by_region() {
		let registry = BackendRegistry::new(
			vec![
				backend("tst-1", "http://localhost:5000"),
				backend("eu-test-2", "http://localhost:5001"),
			],
			"eu-test-2".to_string(),
		)
		.unwrap();
		assert_eq!(
			registry.lookup("tst-1").unwrap().endpoint.to_string(),
			"http://localhost:5000/"
		);
		assert!(registry.lookup("nowhere").is_none());
		assert_eq!(registry.default_region(), "eu-test-2");
	}

	#[test]
	fn duplicate_regions_are_rejected() {
		let result = BackendRegistry::new(
			vec![
				backend("tst-1", "http://localhost:5000"),
				backend("tst-1", "http://localhost:5001"),
			],
			"tst-1".to_string(),
		);
		assert!(result.is_err());
	}

	#[test]
	fn default_must_reference_a_defined_region() {
		let result =
			BackendRegistry::new(vec![backend("tst-1", "http://localhost:5000")], "eu-test-2".to_string());
		assert!(result.is_err());
	}
}
