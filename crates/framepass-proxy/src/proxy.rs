//! MITM proxy server.
//!
//! Hosts the rewrite [`Pipeline`] inside a TLS-intercepting forward proxy.

use std::net::SocketAddr;

use hudsucker::rustls::crypto::aws_lc_rs::default_provider;
use hudsucker::Proxy;
use tokio::sync::broadcast;

use crate::ca::CaManager;
use crate::error::{ProxyError, Result};
use crate::handler::ProxyHandler;
use crate::pipeline::{Pipeline, PipelineConfig};
use crate::DEFAULT_PROXY_PORT;

/// Proxy server configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to bind the proxy to.
    pub addr: SocketAddr,
    /// The CA manager for certificate generation.
    pub ca_manager: CaManager,
    /// Pipeline settings.
    pub pipeline: PipelineConfig,
}

impl ProxyConfig {
    /// Creates a configuration with the default port and CA directory.
    pub fn new() -> Result<Self> {
        let ca_manager = CaManager::with_default_dir()?;

        Ok(Self {
            addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PROXY_PORT)),
            ca_manager,
            pipeline: PipelineConfig::default(),
        })
    }

    /// Sets the listen address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Sets the port (uses 127.0.0.1 as host).
    pub fn with_port(mut self, port: u16) -> Self {
        self.addr = SocketAddr::from(([127, 0, 0, 1], port));
        self
    }

    pub fn with_ca_manager(mut self, ca_manager: CaManager) -> Self {
        self.ca_manager = ca_manager;
        self
    }

    pub fn with_pipeline(mut self, pipeline: PipelineConfig) -> Self {
        self.pipeline = pipeline;
        self
    }
}

/// MITM proxy server running the rewrite pipeline.
#[derive(Debug)]
pub struct ProxyServer {
    addr: SocketAddr,
    ca_manager: CaManager,
    pipeline: Pipeline,
}

impl ProxyServer {
    /// Creates a server and its pipeline.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let pipeline = Pipeline::new(config.pipeline.clone())?;
        Self::with_pipeline(config, pipeline)
    }

    /// Creates a server around an existing pipeline.
    ///
    /// `config.pipeline` is ignored in this case.
    pub fn with_pipeline(config: ProxyConfig, pipeline: Pipeline) -> Result<Self> {
        // Ensure CA exists (will generate if missing)
        config.ca_manager.ensure_ca()?;

        Ok(Self {
            addr: config.addr,
            ca_manager: config.ca_manager,
            pipeline,
        })
    }

    /// Returns the address the proxy is configured to listen on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Pipeline shared with the control API.
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Returns the CA certificate path for user installation.
    pub fn ca_cert_path(&self) -> std::path::PathBuf {
        self.ca_manager.cert_path()
    }

    /// Returns the CA certificate as DER bytes.
    pub fn ca_cert_der(&self) -> Result<Vec<u8>> {
        Ok(self.ca_manager.read_cert_der()?)
    }

    /// Starts the proxy server in the background.
    ///
    /// Returns a handle that can be used to stop the server.
    pub fn start(self) -> Result<ProxyHandle> {
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let shutdown_tx_clone = shutdown_tx.clone();
        let addr = self.addr;

        // Load CA authority before spawning
        let authority = self.ca_manager.ensure_ca()?;
        let handler = ProxyHandler::new(self.pipeline.clone());
        let proxy = Proxy::builder()
            .with_addr(addr)
            .with_ca(authority)
            .with_rustls_connector(default_provider())
            .with_http_handler(handler)
            .build()
            .map_err(|e| ProxyError::Proxy(e.to_string()))?;
        let maintenance = tokio::spawn(self.pipeline.start_maintenance());

        tracing::info!("Starting MITM proxy on {}", addr);
        tracing::info!("CA certificate: {:?}", self.ca_manager.cert_path());

        let handle = tokio::spawn(async move {
            let mut shutdown_rx = shutdown_tx.subscribe();

            tokio::select! {
                result = proxy.start() => {
                    if let Err(e) = result {
                        tracing::error!("Proxy error: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Proxy shutdown signal received");
                }
            };

            maintenance.abort();
            tracing::info!("Proxy server stopped");
        });

        Ok(ProxyHandle {
            shutdown_tx: shutdown_tx_clone,
            addr,
            handle,
        })
    }
}

/// Handle for controlling a running proxy server.
#[derive(Debug)]
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// Returns the address the proxy is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals the proxy to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the proxy to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Shuts down the proxy and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(temp_dir: &TempDir) -> ProxyConfig {
        ProxyConfig {
            addr: SocketAddr::from(([127, 0, 0, 1], 0)), // Random port
            ca_manager: CaManager::new(temp_dir.path().join("ca")),
            pipeline: PipelineConfig::default(),
        }
    }

    #[test]
    fn proxy_config_with_port() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir).with_port(8888);
        assert_eq!(config.addr.port(), 8888);
    }

    #[test]
    fn proxy_config_with_addr() {
        let temp_dir = TempDir::new().unwrap();
        let addr = SocketAddr::from(([0, 0, 0, 0], 9999));
        let config = test_config(&temp_dir).with_addr(addr);
        assert_eq!(config.addr, addr);
    }

    #[test]
    fn proxy_server_generates_ca() {
        let temp_dir = TempDir::new().unwrap();
        let server = ProxyServer::new(test_config(&temp_dir)).unwrap();

        assert!(server
            .ca_cert_path()
            .to_string_lossy()
            .contains("framepass-ca.crt"));
        assert!(server.ca_cert_der().is_ok());
    }

    #[test]
    fn proxy_server_shares_pipeline() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);
        let pipeline = Pipeline::new(PipelineConfig::default().with_cache_enabled(false)).unwrap();
        let server = ProxyServer::with_pipeline(config, pipeline).unwrap();
        assert!(!server.pipeline().status().cache_enabled);
    }

    #[tokio::test]
    async fn proxy_handle_shutdown() {
        let temp_dir = TempDir::new().unwrap();
        let server = ProxyServer::new(test_config(&temp_dir)).unwrap();

        let handle = server.start().unwrap();

        // Give it a moment to start
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        handle.stop().await;
    }
}
