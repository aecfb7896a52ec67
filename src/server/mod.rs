//! Web server exposing the shared store to browsers on the local network.

mod error;
pub mod routes;

pub use error::ApiError;
pub use routes::{build_router, AppState};

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{Config, DEFAULT_MAX_FILES_PER_UPLOAD, DEFAULT_PORT, DEFAULT_UPLOAD_DIR};
use crate::discovery::{
    local_network_address, server_url, DiscoveryConfig, DiscoveryHandle, DiscoveryResponder,
    DEFAULT_DISCOVERY_PORT,
};
use crate::notifier::{ChangeNotifier, DEFAULT_VIEWER_BUFFER};
use crate::store::{FileStore, StoreOptions};

/// How many ports above the requested one are tried when it is taken.
const PORT_SEARCH_RANGE: u16 = 100;

/// Bind to the first free port at or above `base_port`.
///
/// Port 0 asks the OS for any free port.
pub async fn bind_available_port(bind: IpAddr, base_port: u16) -> std::io::Result<TcpListener> {
    if base_port == 0 {
        return TcpListener::bind((bind, 0)).await;
    }

    let mut last_error = None;
    for port in base_port..=base_port.saturating_add(PORT_SEARCH_RANGE) {
        match TcpListener::bind((bind, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::AddrInUse, "No available port found")
    }))
}

/// Discovery settings for the server.
#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub port: u16,
    pub service_name: String,
}

/// Configuration for the web server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface to listen on.
    pub bind: IpAddr,
    /// Base port to try binding to (defaults to 3000).
    pub base_port: u16,
    /// Directory whose contents are shared.
    pub upload_dir: PathBuf,
    pub store: StoreOptions,
    pub max_files_per_upload: usize,
    pub viewer_buffer: usize,
    /// `None` disables discovery.
    pub discovery: Option<DiscoverySettings>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            base_port: DEFAULT_PORT,
            upload_dir: PathBuf::from(DEFAULT_UPLOAD_DIR),
            store: StoreOptions::default(),
            max_files_per_upload: DEFAULT_MAX_FILES_PER_UPLOAD,
            viewer_buffer: DEFAULT_VIEWER_BUFFER,
            discovery: Some(DiscoverySettings {
                port: DEFAULT_DISCOVERY_PORT,
                service_name: crate::config::default_service_name(),
            }),
        }
    }
}

impl ServerConfig {
    /// Resolve the file configuration into server settings.
    pub fn from_config(config: &Config, cli_port: Option<u16>) -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            base_port: config.effective_port(cli_port),
            upload_dir: config.effective_upload_dir(),
            store: StoreOptions {
                max_file_bytes: config.effective_max_file_bytes(),
            },
            max_files_per_upload: config.effective_max_files_per_upload(),
            viewer_buffer: config.effective_viewer_buffer(),
            discovery: config.discovery_enabled().then(|| DiscoverySettings {
                port: config.effective_discovery_port(),
                service_name: config.effective_service_name(),
            }),
        }
    }
}

/// Handle to a running server.
pub struct ServerHandle {
    addr: SocketAddr,
    store: Arc<FileStore>,
    notifier: Arc<ChangeNotifier>,
    discovery: Option<DiscoveryHandle>,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
}

impl ServerHandle {
    /// Address the HTTP server is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn store(&self) -> &Arc<FileStore> {
        &self.store
    }

    /// Address the discovery responder is bound to, if running.
    pub fn discovery_addr(&self) -> Option<SocketAddr> {
        self.discovery.as_ref().map(DiscoveryHandle::local_addr)
    }

    /// Stop discovery, end every change subscription, and drain the HTTP server.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        if let Some(discovery) = self.discovery {
            discovery.shutdown().await;
        }
        self.notifier.close();
        let _ = self.shutdown_tx.send(());

        self.task
            .await
            .context("server task panicked")?
            .context("server error")?;
        info!("server stopped");
        Ok(())
    }
}

/// Open the store, bind every socket, and start serving in the background.
pub async fn start_server(config: ServerConfig) -> anyhow::Result<ServerHandle> {
    let notifier = Arc::new(ChangeNotifier::new(config.viewer_buffer));
    let store = Arc::new(
        FileStore::open(&config.upload_dir, config.store.clone(), Arc::clone(&notifier))
            .await
            .with_context(|| format!("Failed to open {}", config.upload_dir.display()))?,
    );

    let listener = bind_available_port(config.bind, config.base_port)
        .await
        .with_context(|| format!("No available port found from {}", config.base_port))?;
    let addr = listener.local_addr()?;
    if config.base_port != 0 && addr.port() != config.base_port {
        warn!(
            requested = config.base_port,
            port = addr.port(),
            "requested port busy, using another"
        );
    }

    let discovery = match &config.discovery {
        Some(settings) => start_discovery(settings, config.bind, addr.port()).await,
        None => None,
    };

    let state = Arc::new(AppState::new(
        Arc::clone(&store),
        config.max_files_per_upload,
        addr.port(),
    ));
    let app = build_router(state);

    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await
    });

    info!(%addr, "server listening");
    Ok(ServerHandle {
        addr,
        store,
        notifier,
        discovery,
        shutdown_tx,
        task,
    })
}

/// Discovery is best effort: another instance may already own the port.
async fn start_discovery(
    settings: &DiscoverySettings,
    bind: IpAddr,
    service_port: u16,
) -> Option<DiscoveryHandle> {
    let mut discovery_config = DiscoveryConfig::new(&settings.service_name, service_port);
    discovery_config.bind = SocketAddr::new(bind, settings.port);

    let responder = match DiscoveryResponder::bind(discovery_config).await {
        Ok(responder) => responder,
        Err(e) => {
            warn!(error = %e, "network discovery disabled");
            return None;
        }
    };
    match responder.spawn() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "network discovery disabled");
            None
        }
    }
}

/// Run the server until Ctrl+C or SIGTERM.
pub async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    let handle = start_server(config).await?;
    print_banner(&handle);

    shutdown_signal().await;
    println!("\nShutting down server...");

    if let Err(e) = handle.shutdown().await {
        error!(error = %e, "unclean shutdown");
        return Err(e);
    }
    println!("Server stopped");
    Ok(())
}

fn print_banner(handle: &ServerHandle) {
    let port = handle.port();
    println!();
    println!("File share server started");
    println!("  Sharing:       {}", handle.store().root().display());
    if let Some(ip) = local_network_address() {
        println!("  Network URL:   {}", server_url(ip, port));
    }
    println!("  Local access:  http://localhost:{}", port);
    match handle.discovery_addr() {
        Some(addr) => println!("  Discovery:     UDP port {}", addr.port()),
        None => println!("  Discovery:     disabled"),
    }
    println!();
    println!("Press Ctrl+C to stop");
}

/// Wait for the shutdown signal (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_available_port_skips_busy_port() {
        let busy = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let busy_port = busy.local_addr().unwrap().port();
        if busy_port > u16::MAX - PORT_SEARCH_RANGE {
            return;
        }

        let listener = bind_available_port(IpAddr::V4(Ipv4Addr::LOCALHOST), busy_port)
            .await
            .unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(port > busy_port);
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.base_port, 3000);
        assert_eq!(config.max_files_per_upload, 10);
        assert_eq!(config.discovery.unwrap().port, 41234);
    }

    #[test]
    fn test_server_config_from_config() {
        let config = Config {
            port: Some(8080),
            discovery: Some(false),
            max_file_bytes: Some(1024),
            ..Config::default()
        };
        let server = ServerConfig::from_config(&config, None);
        assert_eq!(server.base_port, 8080);
        assert!(server.discovery.is_none());
        assert_eq!(server.store.max_file_bytes, 1024);

        let server = ServerConfig::from_config(&config, Some(9000));
        assert_eq!(server.base_port, 9000);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = ServerConfig {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            base_port: 0,
            upload_dir: dir.path().join("share"),
            discovery: None,
            ..ServerConfig::default()
        };

        let handle = start_server(config).await.unwrap();
        assert_ne!(handle.port(), 0);
        assert!(handle.discovery_addr().is_none());
        assert!(dir.path().join("share").is_dir());

        let mut subscription = handle.store().subscribe();
        handle.shutdown().await.unwrap();
        assert!(subscription.recv().await.is_none());
    }
}
