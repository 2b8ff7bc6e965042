use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use jsonwebtoken::DecodingKey;
use serde::Deserialize;

use crate::backend::Backend;
use crate::iam::Policy;
use crate::token::OidcProvider;

const DEFAULT_MAX_DURATION_SECONDS: u64 = 12 * 3600;
const DEFAULT_ISSUER: &str = "s3gate";

/// On-disk configuration, strict decode. See SPEC_FULL.md for a sample.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
	pub s3backends: Vec<RawBackend>,
	/// region used when a request does not encode one
	pub default: String,
	#[serde(default)]
	pub oidc: RawOidcConfig,
	#[serde(default)]
	pub roles: Vec<RawRole>,
	pub signing_key_file: PathBuf,
	pub signing_public_key_file: PathBuf,
	#[serde(default)]
	pub issuer: Option<String>,
	#[serde(default)]
	pub max_duration_seconds: Option<u64>,
	#[serde(default)]
	pub access_log_headers: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawBackend {
	pub region: String,
	pub endpoint: String,
	pub credentials: RawCredentialSource,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RawCredentialSource {
	File { file: PathBuf },
	Inline(RawCredentials),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawCredentials {
	pub access_key_id: String,
	pub secret_access_key: String,
	#[serde(default)]
	pub session_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawOidcConfig {
	#[serde(default)]
	pub providers: BTreeMap<String, RawOidcProvider>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawOidcProvider {
	pub iss: String,
	pub realm: String,
	/// base64 PEM body only, without the BEGIN/END armor
	pub public_key: String,
	#[serde(default)]
	pub token_service: Option<String>,
	#[serde(default)]
	pub tokens_not_before: u64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawRole {
	pub arn: String,
	pub policy_file: PathBuf,
}

pub fn parse_raw(contents: &str) -> anyhow::Result<RawConfig> {
	Ok(serde_yaml::from_str(contents)?)
}

/// Fully resolved configuration: files read, keys parsed, policies loaded.
pub struct Config {
	pub backends: Vec<Backend>,
	pub default_region: String,
	pub providers: Vec<OidcProvider>,
	pub policies: HashMap<String, Arc<Policy>>,
	pub signing_key_pem: Vec<u8>,
	pub signing_public_key_pem: Vec<u8>,
	pub issuer: String,
	pub max_duration: Duration,
	pub access_log_headers: Vec<String>,
}

impl Config {
	pub fn load(path: &Path) -> anyhow::Result<Config> {
		let contents = std::fs::read_to_string(path)
			.with_context(|| format!("reading config file {}", path.display()))?;
		let raw = parse_raw(&contents).with_context(|| format!("parsing {}", path.display()))?;
		Config::resolve(raw)
	}

	pub fn resolve(raw: RawConfig) -> anyhow::Result<Config> {
		let mut backends = Vec::with_capacity(raw.s3backends.len());
		for b in raw.s3backends {
			let endpoint: http::Uri = b
				.endpoint
				.parse()
				.with_context(|| format!("backend {} endpoint", b.region))?;
			if endpoint.authority().is_none() {
				anyhow::bail!("backend {} endpoint has no host", b.region);
			}
			let creds = match b.credentials {
				RawCredentialSource::File { file } => {
					let contents = std::fs::read_to_string(&file)
						.with_context(|| format!("reading credentials file {}", file.display()))?;
					serde_yaml::from_str::<RawCredentials>(&contents)
						.with_context(|| format!("parsing credentials file {}", file.display()))?
				},
				RawCredentialSource::Inline(creds) => creds,
			};
			backends.push(Backend {
				region: b.region,
				endpoint,
				credentials: aws_credential_types::Credentials::new(
					creds.access_key_id,
					creds.secret_access_key,
					creds.session_token,
					None,
					"backend-config",
				),
			});
		}

		let mut providers = Vec::new();
		for (name, provider) in raw.oidc.providers {
			let pem = public_key_pem(&provider.public_key);
			let decoding_key = DecodingKey::from_rsa_pem(pem.as_bytes())
				.with_context(|| format!("public key of OIDC provider {name}"))?;
			providers.push(OidcProvider {
				iss: provider.iss,
				realm: provider.realm,
				token_service: provider.token_service,
				tokens_not_before: provider.tokens_not_before,
				decoding_key,
			});
		}

		let mut policies = HashMap::new();
		for role in raw.roles {
			let contents = std::fs::read_to_string(&role.policy_file)
				.with_context(|| format!("reading policy file {}", role.policy_file.display()))?;
			let policy = crate::iam::parse_policy(&contents)
				.with_context(|| format!("parsing policy for role {}", role.arn))?;
			policies.insert(role.arn, Arc::new(policy));
		}

		let signing_key_pem = std::fs::read(&raw.signing_key_file)
			.with_context(|| format!("reading signing key {}", raw.signing_key_file.display()))?;
		let signing_public_key_pem = std::fs::read(&raw.signing_public_key_file).with_context(|| {
			format!(
				"reading signing public key {}",
				raw.signing_public_key_file.display()
			)
		})?;

		Ok(Config {
			backends,
			default_region: raw.default,
			providers,
			policies,
			signing_key_pem,
			signing_public_key_pem,
			issuer: raw.issuer.unwrap_or_else(|| DEFAULT_ISSUER.to_string()),
			max_duration: Duration::from_secs(
				raw.max_duration_seconds.unwrap_or(DEFAULT_MAX_DURATION_SECONDS),
			),
			access_log_headers: raw.access_log_headers,
		})
	}
}

/// Config files carry only the base64 body; re-wrap it so PEM parsers accept
/// it.
pub fn public_key_pem(body: &str) -> String {
	format!("-----BEGIN PUBLIC KEY-----\n{body}\n-----END PUBLIC KEY-----")
}

#[cfg(test)]
mod tests {
	use super::*;

	const SAMPLE: &str = r#"
s3backends:
  - region: tst-1
    endpoint: http://localhost:5000
    credentials:
      access_key_id: AKIDTST1
      secret_access_key: secret1
  - region: eu-test-2
    endpoint: http://localhost:5001
    credentials:
      file: etc/creds/otc.yaml
default: eu-test-2
oidc:
  providers:
    testing:
      iss: https://fake-testing/auth/realms/testing
      realm: testing
      public_key: MIIBIjAN
      tokens_not_before: 10
roles:
  - arn: arn:aws:iam::000000000000:role/reader
    policy_file: etc/policies/reader.json
signing_key_file: etc/key.pem
signing_public_key_file: etc/key_pub.pem
max_duration_seconds: 3600
access_log_headers: [x-amz-request-id]
"#;

	#[test]
	fn sample_config_parses() {
		let raw = parse_raw(SAMPLE).unwrap();
		assert_eq!(raw.s3backends.len(), 2);
		assert_eq!(raw.default, "eu-test-2");
		assert!(matches!(
			raw.s3backends[0].credentials,
			RawCredentialSource::Inline(_)
		));
		assert!(matches!(
			raw.s3backends[1].credentials,
			RawCredentialSource::File { .. }
		));
		let provider = raw.oidc.providers.get("testing").unwrap();
		assert_eq!(provider.tokens_not_before, 10);
		assert_eq!(raw.roles[0].arn, "arn:aws:iam::000000000000:role/reader");
		assert_eq!(raw.max_duration_seconds, Some(3600));
	}

	#[test]
	fn unknown_fields_are_rejected() {
		let bad = SAMPLE.replace("access_log_headers", "acces_log_headers");
		assert!(parse_raw(&bad).is_err());
	}

	#[test]
	fn pem_rewrap_includes_armor() {
		let pem = public_key_pem("Zm9v");
		assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----\n"));
		assert!(pem.ends_with("\n-----END PUBLIC KEY-----"));
	}
}
