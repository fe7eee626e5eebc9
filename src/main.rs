//! `chat-gateway` binary: parses settings, installs JSON logging, and serves the gateway.

// std
use std::sync::Arc;
// crates.io
use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use tokio::net::TcpListener;
// self
use chat_gateway::{config::GatewayArgs, obs, pipeline::RequestPipeline, server};

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;

	let config = GatewayArgs::parse().into_config().wrap_err("Invalid gateway configuration.")?;

	obs::init_logging(&config.log_level)?;

	let pipeline = Arc::new(RequestPipeline::from_config(&config)?);

	if let Some(verifier) = pipeline.verifier() {
		// Failure is not fatal: keys load again on the first request that needs them.
		match verifier.keys().refresh().await {
			Ok(count) => tracing::info!(keys = count, issuer = verifier.issuer(), "Signing keys loaded."),
			Err(e) => tracing::warn!(error = %e, "Signing keys could not be loaded at startup."),
		}
	}

	let listener = TcpListener::bind(config.listen_addr)
		.await
		.wrap_err_with(|| format!("Failed to bind {}.", config.listen_addr))?;

	tracing::info!(
		listen_addr = %config.listen_addr,
		auth_enabled = config.auth.is_some(),
		model = pipeline.model(),
		"Gateway listening."
	);

	server::serve(listener, pipeline, shutdown_signal()).await?;

	tracing::info!("Gateway stopped.");

	Ok(())
}

async fn shutdown_signal() {
	let ctrl_c = async {
		if let Err(e) = tokio::signal::ctrl_c().await {
			tracing::error!(error = %e, "Ctrl-C handler could not be installed.");
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
			Ok(mut signal) => {
				signal.recv().await;
			},
			Err(e) => {
				tracing::error!(error = %e, "SIGTERM handler could not be installed.");
				std::future::pending::<()>().await;
			},
		}
	};
	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}

	tracing::info!("Shutdown signal received; draining connections.");
}
