//! Serialized task queue
//!
//! A single worker runs submitted jobs strictly in submission order so callers
//! on the request path never wait on store I/O.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

type Job = BoxFuture<'static, ()>;

pub struct DispatchQueue {
    name: String,
    tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DispatchQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tx: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Start the worker; a no-op if it is already running
    pub fn start(&self) {
        let mut tx_slot = self.tx.lock();
        if tx_slot.is_some() {
            return;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let name = self.name.clone();
        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
            debug!("{} queue drained", name);
        });

        *tx_slot = Some(tx);
        *self.worker.lock() = Some(handle);
        info!("{} queue started", self.name);
    }

    /// Queue a job; returns false if the queue is not running
    pub fn dispatch(&self, job: Job) -> bool {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(job).is_ok(),
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.tx.lock().is_some()
    }

    /// Stop accepting jobs without waiting for queued ones
    pub fn close(&self) {
        self.tx.lock().take();
    }

    /// Stop accepting jobs and wait until every queued job has run
    pub async fn shutdown(&self) {
        self.close();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
            info!("{} queue stopped", self.name);
        }
    }
}
