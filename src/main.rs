use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use clap::Parser;
use clap::error::ErrorKind;
use hyper_util::rt::{TokioExecutor, TokioIo};
use s3gate::config::Config;
use s3gate::{ProxyState, proxy, sts, telemetry};
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tracing::{debug, error, info};

const EXIT_GENERIC: i32 = 1;
const EXIT_MISSING_ARG: i32 = 2;
const EXIT_INVALID_ARG: i32 = 3;

#[derive(Parser, Debug)]
#[command(name = "s3gate", about = "S3-compatible reverse proxy with STS web-identity credentials", version)]
struct Args {
	/// YAML configuration file (backends, OIDC providers, roles)
	#[arg(long, value_name = "file")]
	config: PathBuf,

	/// Port of the STS listener
	#[arg(long, default_value_t = 8444)]
	sts_port: u16,

	/// Port of the S3 listener
	#[arg(long, default_value_t = 8443)]
	s3_port: u16,

	/// TLS certificate (PEM); plain HTTP when omitted
	#[arg(long, value_name = "file", requires = "tls_key")]
	tls_cert: Option<PathBuf>,

	/// TLS private key (PEM)
	#[arg(long, value_name = "file", requires = "tls_cert")]
	tls_key: Option<PathBuf>,
}

fn main() {
	telemetry::setup_logging();
	let args = match Args::try_parse() {
		Ok(args) => args,
		Err(e) => {
			let code = match e.kind() {
				ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
					let _ = e.print();
					std::process::exit(0);
				},
				ErrorKind::MissingRequiredArgument => EXIT_MISSING_ARG,
				_ => EXIT_INVALID_ARG,
			};
			let _ = e.print();
			std::process::exit(code);
		},
	};
	if let Err(err) = run(args) {
		error!("{err:#}");
		std::process::exit(EXIT_GENERIC);
	}
}

fn run(args: Args) -> anyhow::Result<()> {
	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.context("building runtime")?
		.block_on(serve(args))
}

async fn serve(args: Args) -> anyhow::Result<()> {
	let config = Config::load(&args.config)?;
	let state = Arc::new(ProxyState::from_config(config)?);

	let tls = match (&args.tls_cert, &args.tls_key) {
		(Some(cert), Some(key)) => Some(load_tls(cert, key)?),
		_ => None,
	};

	let sts_app = sts::router(state.clone());
	let s3_app = proxy::router(state);
	tokio::try_join!(
		listen("sts", args.sts_port, sts_app, tls.clone()),
		listen("s3", args.s3_port, s3_app, tls),
	)?;
	Ok(())
}

async fn listen(
	name: &'static str,
	port: u16,
	app: Router,
	tls: Option<TlsAcceptor>,
) -> anyhow::Result<()> {
	let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
		.await
		.with_context(|| format!("binding {name} listener on port {port}"))?;
	info!(name, port, tls = tls.is_some(), "listening");
	match tls {
		None => {
			axum::serve(listener, app)
				.with_graceful_shutdown(shutdown_signal())
				.await?;
		},
		Some(acceptor) => serve_tls(listener, app, acceptor).await?,
	}
	Ok(())
}

async fn serve_tls(
	listener: tokio::net::TcpListener,
	app: Router,
	acceptor: TlsAcceptor,
) -> anyhow::Result<()> {
	loop {
		tokio::select! {
			_ = shutdown_signal() => {
				return Ok(());
			},
			accepted = listener.accept() => {
				let (stream, peer) = accepted?;
				let acceptor = acceptor.clone();
				let app = app.clone();
				tokio::spawn(async move {
					let tls_stream = match acceptor.accept(stream).await {
						Ok(stream) => stream,
						Err(e) => {
							debug!(%peer, error = %e, "TLS handshake failed");
							return;
						},
					};
					let service = hyper::service::service_fn(move |req: http::Request<hyper::body::Incoming>| {
						app.clone().oneshot(req.map(axum::body::Body::new))
					});
					if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
						.serve_connection_with_upgrades(TokioIo::new(tls_stream), service)
						.await
					{
						debug!(%peer, error = %e, "connection closed with error");
					}
				});
			},
		}
	}
}

fn load_tls(cert_path: &Path, key_path: &Path) -> anyhow::Result<TlsAcceptor> {
	let certs = rustls_pemfile::certs(&mut BufReader::new(
		File::open(cert_path).with_context(|| format!("opening {}", cert_path.display()))?,
	))
	.collect::<Result<Vec<_>, _>>()
	.context("reading TLS certificate")?;
	let key = rustls_pemfile::private_key(&mut BufReader::new(
		File::open(key_path).with_context(|| format!("opening {}", key_path.display()))?,
	))
	.context("reading TLS key")?
	.ok_or_else(|| anyhow::anyhow!("no private key in {}", key_path.display()))?;
	let mut config = rustls::ServerConfig::builder()
		.with_no_client_auth()
		.with_single_cert(certs, key)
		.context("building TLS config")?;
	config.alpn_protocols = vec![b"http/1.1".to_vec()];
	Ok(TlsAcceptor::from(Arc::new(config)))
}

async fn shutdown_signal() {
	if let Err(e) = tokio::signal::ctrl_c().await {
		error!(error = %e, "failed to install signal handler");
	}
	info!("shutdown signal received, draining");
}
