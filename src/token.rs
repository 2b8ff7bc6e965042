use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use aws_credential_types::Credentials;
use data_encoding::{BASE32_NOPAD, BASE64URL_NOPAD};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use ring::{digest, hmac};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Claim carrying session tags on web-identity tokens, per the AWS
/// AssumeRoleWithWebIdentity convention.
pub const SESSION_TAGS_CLAIM: &str = "https://aws.amazon.com/tags";

#[derive(thiserror::Error, Debug)]
pub enum TokenError {
	#[error("the token is invalid or malformed: {0}")]
	Invalid(#[from] jsonwebtoken::errors::Error),
	#[error("token issuer {0:?} is not a configured provider")]
	UnknownIssuer(String),
	#[error("token was issued before the provider not-before floor")]
	IssuedBeforeFloor,
	#[error("access key id is not recoverable to a session token")]
	InvalidAccessKeyId,
	#[error("no security token accompanied the request")]
	MissingSessionToken,
}

impl TokenError {
	pub fn is_expired(&self) -> bool {
		matches!(
			self,
			TokenError::Invalid(e)
				if matches!(e.kind(), jsonwebtoken::errors::ErrorKind::ExpiredSignature)
		)
	}
}

/// Session tags as they appear in the web-identity token and again in the
/// minted session token.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionTags {
	#[serde(default)]
	pub principal_tags: BTreeMap<String, Vec<String>>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub transitive_tag_keys: Vec<String>,
}

/// The subset of OIDC claims the proxy consumes.
#[derive(Debug, Clone, Deserialize)]
pub struct WebIdentityClaims {
	pub iss: String,
	pub sub: String,
	pub exp: u64,
	#[serde(default)]
	pub iat: Option<u64>,
	#[serde(default)]
	pub aud: Option<serde_json::Value>,
	#[serde(default, rename = "https://aws.amazon.com/tags")]
	pub tags: Option<SessionTags>,
}

/// Claims of a proxy-minted session token. Never stored server-side: the
/// token travels with every request and everything needed to re-derive the
/// presented credentials is in here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionClaims {
	pub role_arn: String,
	/// issuer of the original web-identity token
	pub initial_issuer: String,
	#[serde(
		default,
		rename = "https://aws.amazon.com/tags",
		skip_serializing_if = "Option::is_none"
	)]
	pub tags: Option<SessionTags>,
	pub iss: String,
	pub sub: String,
	pub jti: String,
	pub iat: u64,
	pub nbf: u64,
	pub exp: u64,
}

impl SessionClaims {
	pub fn principal_tags(&self) -> BTreeMap<String, Vec<String>> {
		self
			.tags
			.as_ref()
			.map(|t| t.principal_tags.clone())
			.unwrap_or_default()
	}

	pub fn expiration(&self) -> SystemTime {
		UNIX_EPOCH + Duration::from_secs(self.exp)
	}
}

/// A configured OIDC provider, keyed by the `iss` claim.
pub struct OidcProvider {
	pub iss: String,
	pub realm: String,
	pub token_service: Option<String>,
	/// tokens issued before this epoch second are rejected
	pub tokens_not_before: u64,
	pub decoding_key: DecodingKey,
}

impl std::fmt::Debug for OidcProvider {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("OidcProvider")
			.field("iss", &self.iss)
			.field("realm", &self.realm)
			.field("tokens_not_before", &self.tokens_not_before)
			.finish()
	}
}

/// Verifies web-identity tokens, mints and verifies session tokens, and
/// derives the stateless credential pair from them.
pub struct TokenService {
	issuer: String,
	providers: HashMap<String, OidcProvider>,
	encoding_key: EncodingKey,
	decoding_key: DecodingKey,
	master_key: hmac::Key,
}

impl std::fmt::Debug for TokenService {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TokenService")
			.field("issuer", &self.issuer)
			.field("providers", &self.providers.keys().collect::<Vec<_>>())
			.finish()
	}
}

impl TokenService {
	pub fn new(
		issuer: impl Into<String>,
		signing_key_pem: &[u8],
		public_key_pem: &[u8],
		providers: Vec<OidcProvider>,
	) -> Result<Self, jsonwebtoken::errors::Error> {
		let encoding_key = EncodingKey::from_rsa_pem(signing_key_pem)?;
		let decoding_key = DecodingKey::from_rsa_pem(public_key_pem)?;
		// One key file determines the whole credential space: the HMAC key for
		// secret derivation is bound to the signing key material.
		let master = digest::digest(&digest::SHA256, signing_key_pem);
		Ok(TokenService {
			issuer: issuer.into(),
			providers: providers.into_iter().map(|p| (p.iss.clone(), p)).collect(),
			encoding_key,
			decoding_key,
			master_key: hmac::Key::new(hmac::HMAC_SHA256, master.as_ref()),
		})
	}

	fn provider_for(&self, iss: &str) -> Result<&OidcProvider, TokenError> {
		self
			.providers
			.get(iss)
			.ok_or_else(|| TokenError::UnknownIssuer(iss.to_string()))
	}

	/// Verify an OIDC token: look the provider up by the unverified `iss`
	/// claim, then verify signature, `exp`, `nbf` and the provider's
	/// issued-at floor.
	pub fn verify_web_identity(&self, token: &str) -> Result<WebIdentityClaims, TokenError> {
		let mut peek = Validation::new(Algorithm::RS256);
		peek.insecure_disable_signature_validation();
		peek.validate_exp = false;
		peek.validate_aud = false;
		peek.required_spec_claims.clear();
		let unverified = decode::<WebIdentityClaims>(token, &DecodingKey::from_secret(&[]), &peek)?;

		let provider = self.provider_for(&unverified.claims.iss)?;
		let mut validation = Validation::new(Algorithm::RS256);
		validation.validate_aud = false;
		validation.validate_nbf = true;
		validation.set_issuer(&[&provider.iss]);
		let verified = decode::<WebIdentityClaims>(token, &provider.decoding_key, &validation)?;

		if provider.tokens_not_before > 0
			&& verified.claims.iat.unwrap_or(0) < provider.tokens_not_before
		{
			return Err(TokenError::IssuedBeforeFloor);
		}
		Ok(verified.claims)
	}

	/// Mint a session token for a verified web identity. `nbf == iat`, fresh
	/// `jti`, signed RS256 with the proxy key.
	pub fn mint_session(
		&self,
		web_identity: &WebIdentityClaims,
		role_arn: &str,
		duration: Duration,
		now: SystemTime,
	) -> Result<(SessionClaims, String), TokenError> {
		let iat = epoch_seconds(now);
		let claims = SessionClaims {
			role_arn: role_arn.to_string(),
			initial_issuer: web_identity.iss.clone(),
			tags: web_identity.tags.clone(),
			iss: self.issuer.clone(),
			sub: web_identity.sub.clone(),
			jti: Uuid::new_v4().to_string(),
			iat,
			nbf: iat,
			exp: iat + duration.as_secs(),
		};
		let token = encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key)?;
		Ok((claims, token))
	}

	pub fn verify_session_token(&self, token: &str) -> Result<SessionClaims, TokenError> {
		let mut validation = Validation::new(Algorithm::RS256);
		validation.validate_aud = false;
		validation.validate_nbf = true;
		validation.set_issuer(&[&self.issuer]);
		Ok(decode::<SessionClaims>(token, &self.decoding_key, &validation)?.claims)
	}

	/// The ephemeral credentials a session token stands for. Both keys are
	/// pure functions of the token, so presenting them later needs no state.
	pub fn credentials_for(
		&self,
		claims: &SessionClaims,
		token: &str,
	) -> Result<Credentials, TokenError> {
		let access_key_id = access_key_for_token_id(&claims.jti)?;
		Ok(Credentials::new(
			access_key_id,
			self.secret_for(token),
			Some(token.to_string()),
			Some(claims.expiration()),
			"sts",
		))
	}

	/// Verify the credentials presented on an S3 request: session token first,
	/// then the access key must round-trip to the token's id.
	pub fn authenticate(
		&self,
		access_key_id: &str,
		session_token: Option<&str>,
	) -> Result<(SessionClaims, Credentials), TokenError> {
		let token = session_token.ok_or(TokenError::MissingSessionToken)?;
		let claims = self.verify_session_token(token)?;
		let expected_jti = token_id_for_access_key(access_key_id)?;
		if claims.jti != expected_jti {
			return Err(TokenError::InvalidAccessKeyId);
		}
		let creds = self.credentials_for(&claims, token)?;
		Ok((claims, creds))
	}

	fn secret_for(&self, token: &str) -> String {
		let tag = hmac::sign(&self.master_key, token.as_bytes());
		BASE64URL_NOPAD.encode(tag.as_ref())
	}
}

/// AccessKeyId: base32 (no padding) over the session token's UUID id.
/// 26 uppercase characters, comfortably inside AWS's 16-128 constraint.
pub fn access_key_for_token_id(jti: &str) -> Result<String, TokenError> {
	let id = Uuid::parse_str(jti).map_err(|_| TokenError::InvalidAccessKeyId)?;
	Ok(BASE32_NOPAD.encode(id.as_bytes()))
}

pub fn token_id_for_access_key(access_key_id: &str) -> Result<String, TokenError> {
	let bytes = BASE32_NOPAD
		.decode(access_key_id.as_bytes())
		.map_err(|_| TokenError::InvalidAccessKeyId)?;
	let id = Uuid::from_slice(&bytes).map_err(|_| TokenError::InvalidAccessKeyId)?;
	Ok(id.to_string())
}

fn epoch_seconds(t: SystemTime) -> u64 {
	t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}
