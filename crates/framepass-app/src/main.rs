//! Framepass - embed framing-hostile pages in an operator-controlled frame.
//!
//! This is the main binary that runs:
//! - MITM Proxy server (rewrite pipeline)
//! - Local control API (surface messages and status)

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use directories::ProjectDirs;
use framepass_proxy::{
    AuthConfig, PipelineConfig, ProxyConfig, ProxyServer, SurfaceMatcher, DEFAULT_CACHE_TTL,
    DEFAULT_PROXY_PORT, DEFAULT_UPSTREAM_TIMEOUT,
};
use framepass_server::{AppState, Server, ServerConfig, DEFAULT_PORT};
use tokio::sync::watch;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Framepass - transparent rewrite proxy for an embedding surface
#[derive(Parser, Debug)]
#[command(name = "framepass", version, about)]
struct Args {
    /// Proxy listen port
    #[arg(long, default_value_t = DEFAULT_PROXY_PORT)]
    port: u16,

    /// Control API listen port
    #[arg(long, default_value_t = DEFAULT_PORT)]
    control_port: u16,

    /// Bearer credential for the gated site's API
    #[arg(long, env = "FRAMEPASS_BEARER_TOKEN", hide_env_values = true)]
    bearer_token: Option<String>,

    /// Cache entry lifetime in seconds
    #[arg(long, default_value_t = DEFAULT_CACHE_TTL.as_secs())]
    cache_ttl_secs: u64,

    /// Timeout for each upstream exchange in seconds
    #[arg(long, default_value_t = DEFAULT_UPSTREAM_TIMEOUT.as_secs())]
    upstream_timeout_secs: u64,

    /// Additional Referer/Origin prefix identifying the embedding surface (repeatable)
    #[arg(long = "surface-origin", value_name = "PREFIX")]
    surface_origins: Vec<String>,

    /// Disable the response cache
    #[arg(long)]
    no_cache: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn pipeline_config(&self) -> PipelineConfig {
        let mut surface = SurfaceMatcher::default();
        surface
            .origin_prefixes
            .extend(self.surface_origins.iter().cloned());

        PipelineConfig::default()
            .with_cache_ttl(Duration::from_secs(self.cache_ttl_secs))
            .with_cache_enabled(!self.no_cache)
            .with_upstream_timeout(Duration::from_secs(self.upstream_timeout_secs))
            .with_surface(surface)
            .with_auth(AuthConfig::default().with_bearer_token(self.bearer_token.clone()))
    }
}

/// Get the logs directory path.
fn logs_dir() -> Option<PathBuf> {
    ProjectDirs::from("dev", "framepass", "Framepass").map(|dirs| dirs.data_dir().join("logs"))
}

/// Initialize logging with file rotation.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "framepass={0},framepass_proxy={0},framepass_server={0},warn",
            log_level
        ))
    });

    if let Some(log_dir) = logs_dir() {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            // Rotates daily, keeps the last five files
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("framepass")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);

                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stdout))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::info!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(&args);

    tracing::info!("Starting Framepass v{}", env!("CARGO_PKG_VERSION"));

    let proxy_config = ProxyConfig::new()
        .context("failed to resolve the CA directory")?
        .with_port(args.port)
        .with_pipeline(args.pipeline_config());
    let ca_manager = proxy_config.ca_manager.clone();

    let proxy = ProxyServer::new(proxy_config).context("failed to create proxy server")?;
    let pipeline = proxy.pipeline().clone();

    if pipeline.tokens().config().bearer_token.is_none() {
        tracing::warn!("No bearer token configured; guest token activation is disabled");
    }
    tracing::info!(
        "Install the CA certificate from {:?} in the browser hosting the surface",
        proxy.ca_cert_path()
    );

    let proxy_handle = proxy.start().context("failed to start proxy server")?;

    let server_config = ServerConfig::default().with_port(args.control_port);
    let server = Server::new(
        server_config,
        AppState::new(pipeline).with_ca_manager(ca_manager),
    )
    .context("failed to create control API server")?;

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let server_task = tokio::spawn(server.run_until(async move {
        let _ = shutdown_rx.changed().await;
    }));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("Shutdown requested");

    let _ = shutdown_tx.send(true);
    proxy_handle.stop().await;

    match server_task.await {
        Ok(Err(e)) => tracing::error!("Control API error: {}", e),
        Err(e) => tracing::error!("Control API task failed: {}", e),
        Ok(Ok(())) => {}
    }

    tracing::info!("Framepass stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_library_constants() {
        let args = Args::parse_from(["framepass"]);
        assert_eq!(args.port, DEFAULT_PROXY_PORT);
        assert_eq!(args.control_port, DEFAULT_PORT);
        assert!(!args.no_cache);

        let config = args.pipeline_config();
        assert_eq!(config.cache_ttl, DEFAULT_CACHE_TTL);
        assert_eq!(config.upstream_timeout, DEFAULT_UPSTREAM_TIMEOUT);
        assert!(config.cache_enabled);
    }

    #[test]
    fn flags_flow_into_pipeline_config() {
        let args = Args::parse_from([
            "framepass",
            "--no-cache",
            "--cache-ttl-secs",
            "60",
            "--upstream-timeout-secs",
            "5",
            "--bearer-token",
            "abc",
            "--surface-origin",
            "http://localhost:3000",
            "--surface-origin",
            "app://panel",
        ]);
        let config = args.pipeline_config();

        assert!(!config.cache_enabled);
        assert_eq!(config.cache_ttl, Duration::from_secs(60));
        assert_eq!(config.upstream_timeout, Duration::from_secs(5));
        assert_eq!(config.auth.bearer_token.as_deref(), Some("abc"));
        assert!(config
            .surface
            .origin_prefixes
            .contains(&"http://localhost:3000".to_string()));
        assert!(config
            .surface
            .origin_prefixes
            .contains(&"chrome-extension://".to_string()));
    }
}
