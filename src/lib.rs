pub mod backend;
pub mod config;
pub mod context;
pub mod errors;
pub mod iam;
pub mod proxy;
pub mod sigv4;
pub mod sts;
pub mod telemetry;
pub mod token;

use std::sync::Arc;
use std::time::Duration;

use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;

use crate::backend::BackendRegistry;
use crate::config::Config;
use crate::context::{HeaderProcessor, HeaderToAccessLog};
use crate::iam::{PolicyManager, StaticPolicyManager};
use crate::token::TokenService;

pub type HttpClient =
	hyper_util::client::legacy::Client<hyper_rustls::HttpsConnector<HttpConnector>, axum::body::Body>;

/// Everything the two listeners share. Built once at startup; read-only
/// afterwards, so handlers need no synchronisation around it.
pub struct ProxyState {
	pub tokens: TokenService,
	pub backends: BackendRegistry,
	pub policies: Arc<dyn PolicyManager>,
	pub header_processor: Option<Arc<dyn HeaderProcessor>>,
	pub client: HttpClient,
	pub max_duration: Duration,
}

impl ProxyState {
	pub fn from_config(config: Config) -> anyhow::Result<Self> {
		let tokens = TokenService::new(
			config.issuer,
			&config.signing_key_pem,
			&config.signing_public_key_pem,
			config.providers,
		)?;
		let backends = BackendRegistry::new(config.backends, config.default_region)?;
		let policies: Arc<dyn PolicyManager> =
			Arc::new(StaticPolicyManager::new(config.policies));
		let header_processor = HeaderToAccessLog::new(&config.access_log_headers)
			.map(|p| p as Arc<dyn HeaderProcessor>);
		Ok(ProxyState {
			tokens,
			backends,
			policies,
			header_processor,
			client: new_http_client()?,
			max_duration: config.max_duration,
		})
	}
}

pub fn new_http_client() -> anyhow::Result<HttpClient> {
	let https = hyper_rustls::HttpsConnectorBuilder::new()
		.with_native_roots()?
		.https_or_http()
		.enable_http1()
		.build();
	Ok(
		hyper_util::client::legacy::Client::builder(TokioExecutor::new())
			.build::<_, axum::body::Body>(https),
	)
}
