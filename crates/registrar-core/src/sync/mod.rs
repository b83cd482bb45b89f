//! Directory synchronization
//!
//! Keeps the [`Registry`] consistent with static configuration and with an
//! external store. Every full pass against the store is tagged with a new
//! generation; once all rows of a pass are applied, records from earlier
//! passes are pruned. Preset (configured) records are never pruned.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RegistrarConfig;
use crate::error::Result;
use crate::registry::Registry;

pub mod dispatch;
pub mod memory;
pub mod postgres;
pub mod store;

pub use dispatch::DispatchQueue;
pub use memory::MemoryStore;
pub use postgres::PgDirectoryStore;
pub use store::{ChangeFeed, DirectoryStore, ExtensionRow};

// Pause after a failed receive before waiting on the feed again
const LISTENER_RETRY: Duration = Duration::from_secs(1);

/// Channel names used for change notifications
#[derive(Debug, Clone)]
pub struct SyncChannels {
    /// Channel this process listens on
    pub listen: String,
    /// Channel this process publishes its own changes on
    pub notify: String,
}

impl SyncChannels {
    fn from_config(config: &RegistrarConfig) -> Self {
        Self {
            listen: config.server.listen_channel.clone(),
            notify: config.server.notify_channel.clone(),
        }
    }
}

/// Loads and reconciles the extension directory
pub struct DirectorySync {
    registry: Arc<Registry>,
    store: Option<Arc<dyn DirectoryStore>>,
    channels: SyncChannels,

    /// Generation of the most recently started pass
    generation: AtomicU64,
    /// Highest generation whose pass has finished applying its rows
    completed: AtomicU64,

    /// Bounds concurrent store sessions; replaced on reload
    limiter: RwLock<Arc<Semaphore>>,
    capacity: Mutex<usize>,

    queue: DispatchQueue,
    cancel: CancellationToken,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl DirectorySync {
    /// Create the service; `store` is `None` when no database is configured
    pub fn new(
        registry: Arc<Registry>,
        store: Option<Arc<dyn DirectoryStore>>,
        config: &RegistrarConfig,
    ) -> Self {
        let capacity = config.server.connections.max(1);
        Self {
            registry,
            store,
            channels: SyncChannels::from_config(config),
            generation: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            limiter: RwLock::new(Arc::new(Semaphore::new(capacity))),
            capacity: Mutex::new(capacity),
            queue: DispatchQueue::new("notify"),
            cancel: CancellationToken::new(),
            listener: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    /// Generation of the most recently started pass
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Highest generation whose pass has completed
    pub fn completed_generation(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    /// Apply the preset extensions from configuration; returns how many were applied
    pub fn load_static(&self, config: &RegistrarConfig) -> usize {
        let mut applied = 0;
        for section in &config.extensions {
            if self.registry.upsert(section.to_record()) {
                applied += 1;
            }
        }
        info!("loaded {} preset extensions", applied);
        applied
    }

    /// Start the notify queue and the change listener, then run the first pass.
    ///
    /// Failing to open the listener subscription is fatal.
    pub async fn startup(self: &Arc<Self>) -> Result<()> {
        self.queue.start();
        let Some(store) = self.store.clone() else {
            info!("no database configured, directory is static");
            return Ok(());
        };

        let feed = store.subscribe(&self.channels.listen).await.map_err(|e| {
            error!("directory listener failed: {}", e);
            e
        })?;

        let sync = Arc::clone(self);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            sync.listen(feed, cancel).await;
        });
        *self.listener.lock() = Some(handle);

        info!("startup directory sync");
        self.full_sync().await;
        Ok(())
    }

    async fn listen(&self, mut feed: Box<dyn ChangeFeed>, cancel: CancellationToken) {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = feed.next() => next,
            };

            match next {
                Ok(Some(payload)) => {
                    debug!("directory notification {}", payload);
                    self.full_sync().await;
                }
                Ok(None) => {
                    info!("directory listener closed");
                    break;
                }
                Err(e) => {
                    warn!("directory listener error: {}", e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(LISTENER_RETRY) => {}
                    }
                }
            }
        }
        // Dropping the feed closes the listener connection
        drop(feed);
        debug!("directory listener stopped");
    }

    /// Run one reconciliation pass against the store.
    ///
    /// Returns the pass generation, or `None` if no pass ran (no store,
    /// shutting down, or the query failed).
    pub async fn full_sync(&self) -> Option<u64> {
        let store = self.store.as_ref()?;
        let limiter = Arc::clone(&*self.limiter.read());
        let _permit = limiter.acquire_owned().await.ok()?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let rows = match store.load_extensions().await {
            Ok(rows) => rows,
            Err(e) => {
                error!("directory sync {} failed: {}", generation, e);
                return None;
            }
        };

        let mut applied = 0;
        for row in &rows {
            if let Some(record) = row.to_record(generation) {
                if self.registry.upsert(record) {
                    applied += 1;
                }
            }
        }
        // A pass that finishes after a newer one prunes against the newer
        // generation, so rows the newer pass no longer saw cannot survive.
        let floor = self
            .completed
            .fetch_max(generation, Ordering::SeqCst)
            .max(generation);
        let pruned = self.registry.prune(floor);
        info!(
            "directory sync {}: {} rows, {} applied, {} pruned below {}",
            generation,
            rows.len(),
            applied,
            pruned,
            floor
        );
        Some(generation)
    }

    /// Publish a change for cooperating processes.
    ///
    /// Queued for the notify worker; returns false without store I/O when no
    /// store is configured or the queue is stopped.
    pub fn notify(&self, message: impl Into<String>) -> bool {
        let Some(store) = self.store.clone() else {
            return false;
        };
        let channel = self.channels.notify.clone();
        let message = message.into();
        self.queue.dispatch(Box::pin(async move {
            if let Err(e) = store.publish(&channel, &message).await {
                error!("notify {} failed: {}", channel, e);
            }
        }))
    }

    /// Re-apply configuration and resynchronize.
    ///
    /// Preset extensions no longer present in `config` are removed first.
    pub async fn reload(&self, config: &RegistrarConfig) {
        let keep: HashSet<u32> = config.extensions.iter().map(|ext| ext.id).collect();
        let removed = self.registry.retain_presets(&keep);
        if removed > 0 {
            info!("removed {} preset extensions no longer configured", removed);
        }
        self.load_static(config);

        let capacity = config.server.connections.max(1);
        {
            let mut current = self.capacity.lock();
            if *current != capacity && !self.cancel.is_cancelled() {
                *self.limiter.write() = Arc::new(Semaphore::new(capacity));
                *current = capacity;
                if let Some(store) = &self.store {
                    store.set_session_limit(capacity);
                }
                debug!("store session limit now {}", capacity);
            }
        }

        self.full_sync().await;
    }

    /// Stop the notify queue and the change listener.
    ///
    /// Queued notifications are drained; an in-flight pass is allowed to finish.
    pub async fn shutdown(&self) {
        self.queue.close();
        self.cancel.cancel();

        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            let _ = listener.await;
        }

        self.limiter.read().close();
        self.queue.shutdown().await;
        info!("shutdown directory sync");
    }
}
