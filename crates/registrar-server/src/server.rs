//! Registrar process wiring
//!
//! Owns the registry, the directory synchronizer, the UDP and TCP transports
//! and the expiry sweeper, and drives their startup, reload and shutdown.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sipreg_registrar_core::sync::DirectoryStore;
use sipreg_registrar_core::{
    DirectorySync, PgDirectoryStore, RegistrarConfig, Registry, RequestHandler,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::Result;
use crate::transport::{TcpTransport, UdpTransport};

/// Interval between expired-endpoint sweeps
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

pub struct RegistrarServer {
    config_path: Option<PathBuf>,
    config: RegistrarConfig,
    registry: Arc<Registry>,
    sync: Arc<DirectorySync>,
    cancel: CancellationToken,
    udp: Mutex<Option<UdpTransport>>,
    tcp: Mutex<Option<TcpTransport>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RegistrarServer {
    /// Build the server from loaded configuration.
    ///
    /// A PostgreSQL store is attached when the configuration names one.
    pub fn new(config_path: Option<PathBuf>, config: RegistrarConfig) -> Result<Self> {
        let store: Option<Arc<dyn DirectoryStore>> = if config.server.has_database() {
            let sessions = u32::try_from(config.server.connections).unwrap_or(u32::MAX);
            Some(Arc::new(PgDirectoryStore::new(&config.server.database, sessions)?))
        } else {
            None
        };
        Ok(Self::with_store(config_path, config, store))
    }

    /// Build the server around an existing store
    pub fn with_store(
        config_path: Option<PathBuf>,
        config: RegistrarConfig,
        store: Option<Arc<dyn DirectoryStore>>,
    ) -> Self {
        let registry = Arc::new(Registry::new(config.realm()));
        let sync = Arc::new(DirectorySync::new(registry.clone(), store, &config));
        Self {
            config_path,
            config,
            registry,
            sync,
            cancel: CancellationToken::new(),
            udp: Mutex::new(None),
            tcp: Mutex::new(None),
            sweeper: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn sync(&self) -> &Arc<DirectorySync> {
        &self.sync
    }

    /// Load the directory, start synchronization and open the transports.
    ///
    /// UDP binds first; TCP then listens on the same address and port.
    /// Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        info!("realm {}", self.registry.realm());
        self.sync.load_static(&self.config);
        self.sync.startup().await?;

        let addr = SocketAddr::new(self.config.server.bind, self.config.server.port);
        let handler = RequestHandler::new(self.registry.clone());
        let udp = UdpTransport::bind(addr, handler.clone()).await?;
        let local = udp.local_addr();
        *self.udp.lock().await = Some(udp);
        let tcp = TcpTransport::bind(local, handler).await?;
        *self.tcp.lock().await = Some(tcp);

        *self.sweeper.lock().await = Some(spawn_sweeper(
            self.registry.clone(),
            SWEEP_INTERVAL,
            self.cancel.clone(),
        ));
        Ok(local)
    }

    /// Re-read the configuration file and resynchronize.
    ///
    /// Realm, bind address and port changes take effect on restart only.
    pub async fn reload(&self) -> Result<()> {
        let config = match &self.config_path {
            Some(path) => RegistrarConfig::load(path)?,
            None => self.config.clone(),
        };
        info!("reloading configuration");
        self.sync.reload(&config).await;
        Ok(())
    }

    pub async fn shutdown(&self) {
        info!("shutting down");
        self.cancel.cancel();
        if let Some(udp) = self.udp.lock().await.take() {
            udp.close().await;
        }
        if let Some(tcp) = self.tcp.lock().await.take() {
            tcp.close().await;
        }
        if let Some(sweeper) = self.sweeper.lock().await.take() {
            let _ = sweeper.await;
        }
        self.sync.shutdown().await;
    }
}

/// Periodically drop endpoints whose registration lapsed
pub fn spawn_sweeper(
    registry: Arc<Registry>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // First tick fires immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let dropped = registry.sweep_expired();
                    if dropped > 0 {
                        debug!("swept {} expired endpoints", dropped);
                    }
                }
            }
        }
        debug!("sweeper stopped");
    })
}
