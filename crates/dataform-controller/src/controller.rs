//! Controller runtime: event intake, cache-sync gate and the worker pool.
//!
//! ```text
//!   RecordWatcher ──events──► intake task ──add──► WorkQueue ──get──► workers ──► Reconciler
//!                                                     ▲                              │
//!                                                     └──── add_rate_limited (error) ┘
//! ```
//!
//! Intake starts before the sync wait so changes made while the cache fills
//! are not lost. Workers only start once the cache reports synced.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dataform_core::RecordKey;
use dataform_provisioner::DynProvisioner;
use dataform_storage::{DynLister, DynWatcher, DynWriter, RecordEvent, RecordLister};
use futures_util::FutureExt;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::error::ControllerError;
use crate::queue::{RateLimiter, WorkQueue, default_controller_rate_limiter};
use crate::reconciler::Reconciler;

const DEFAULT_WORKERS: usize = 2;
const DEFAULT_CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolves once `rx` holds `true`, or once its sender is gone.
async fn wait_until_set(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|value| *value).await;
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

/// Builder wiring the collaborators into a [`Controller`].
pub struct ControllerBuilder {
    lister: Option<DynLister>,
    watcher: Option<DynWatcher>,
    writer: Option<DynWriter>,
    provisioner: Option<DynProvisioner>,
    workers: usize,
    cache_sync_timeout: Duration,
    rate_limiter: Option<Box<dyn RateLimiter<RecordKey>>>,
}

impl ControllerBuilder {
    pub fn new() -> Self {
        Self {
            lister: None,
            watcher: None,
            writer: None,
            provisioner: None,
            workers: DEFAULT_WORKERS,
            cache_sync_timeout: DEFAULT_CACHE_SYNC_TIMEOUT,
            rate_limiter: None,
        }
    }

    pub fn with_lister(mut self, lister: DynLister) -> Self {
        self.lister = Some(lister);
        self
    }

    pub fn with_watcher(mut self, watcher: DynWatcher) -> Self {
        self.watcher = Some(watcher);
        self
    }

    pub fn with_writer(mut self, writer: DynWriter) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn with_provisioner(mut self, provisioner: DynProvisioner) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_cache_sync_timeout(mut self, timeout: Duration) -> Self {
        self.cache_sync_timeout = timeout;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: impl RateLimiter<RecordKey> + 'static) -> Self {
        self.rate_limiter = Some(Box::new(limiter));
        self
    }

    /// Applies worker count, sync timeout and retry pacing from config.
    pub fn with_config(self, config: &AppConfig) -> Result<Self, ControllerError> {
        let limiter = config
            .rate_limit
            .build::<RecordKey>()
            .map_err(|e| ControllerError::Config(e.to_string()))?;
        Ok(self
            .with_workers(config.controller.workers)
            .with_cache_sync_timeout(config.cache_sync_timeout())
            .with_rate_limiter(limiter))
    }

    pub fn build(self) -> Result<Controller, ControllerError> {
        let missing = |what: &str| ControllerError::Config(format!("{what} is required"));

        let lister = self.lister.ok_or_else(|| missing("record lister"))?;
        let watcher = self.watcher.ok_or_else(|| missing("record watcher"))?;
        let writer = self.writer.ok_or_else(|| missing("record writer"))?;
        let provisioner = self.provisioner.ok_or_else(|| missing("provisioner"))?;

        if self.workers == 0 {
            return Err(ControllerError::Config("workers must be > 0".into()));
        }
        if self.cache_sync_timeout.is_zero() {
            return Err(ControllerError::Config("cache sync timeout must be > 0".into()));
        }

        let queue = match self.rate_limiter {
            Some(limiter) => WorkQueue::new(limiter),
            None => WorkQueue::new(default_controller_rate_limiter()),
        };

        Ok(Controller {
            reconciler: Arc::new(Reconciler::new(lister.clone(), writer, provisioner)),
            lister,
            watcher,
            queue,
            workers: self.workers,
            cache_sync_timeout: self.cache_sync_timeout,
        })
    }
}

impl Default for ControllerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps records and managed instances in sync until shut down.
pub struct Controller {
    lister: DynLister,
    watcher: DynWatcher,
    reconciler: Arc<Reconciler>,
    queue: WorkQueue<RecordKey>,
    workers: usize,
    cache_sync_timeout: Duration,
}

impl Controller {
    pub fn builder() -> ControllerBuilder {
        ControllerBuilder::new()
    }

    pub fn queue(&self) -> &WorkQueue<RecordKey> {
        &self.queue
    }

    /// Runs until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// In-flight reconciles finish before this returns; queued keys are
    /// abandoned.
    ///
    /// # Errors
    ///
    /// Fails without starting any worker if the cache does not sync within
    /// the configured timeout, or if shutdown is requested first.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ControllerError> {
        info!(workers = self.workers, "Starting controller");

        let intake = tokio::spawn(intake_events(
            self.watcher.subscribe(),
            self.lister.clone(),
            self.queue.clone(),
            shutdown.clone(),
        ));

        if let Err(e) = self.wait_for_cache_sync(&mut shutdown).await {
            self.queue.shut_down();
            intake.abort();
            return Err(e);
        }
        // Records stored before intake subscribed produced no events.
        enqueue_all(self.lister.as_ref(), &self.queue).await;
        info!(queued = self.queue.len(), "Record cache synced, starting workers");

        let mut workers = JoinSet::new();
        for id in 0..self.workers {
            workers.spawn(run_worker(id, self.queue.clone(), self.reconciler.clone()));
        }

        wait_until_set(&mut shutdown).await;
        info!("Shutdown requested, draining workers");
        self.queue.shut_down();

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Worker task failed");
            }
        }
        if let Err(e) = intake.await {
            error!(error = %e, "Event intake task failed");
        }

        info!("Controller stopped");
        Ok(())
    }

    async fn wait_for_cache_sync(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), ControllerError> {
        let mut synced = self.watcher.synced();
        let timeout_ms = u64::try_from(self.cache_sync_timeout.as_millis()).unwrap_or(u64::MAX);

        if *shutdown.borrow() {
            return Err(ControllerError::ShutdownBeforeSync);
        }

        tokio::select! {
            biased;

            _ = wait_until_set(shutdown) => Err(ControllerError::ShutdownBeforeSync),
            result = tokio::time::timeout(self.cache_sync_timeout, async {
                synced.wait_for(|done| *done).await.is_ok()
            }) => match result {
                Ok(true) => Ok(()),
                Ok(false) => Err(ControllerError::WatchClosed),
                Err(_) => Err(ControllerError::CacheSyncTimeout { timeout_ms }),
            },
        }
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("workers", &self.workers)
            .field("cache_sync_timeout", &self.cache_sync_timeout)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

async fn intake_events(
    mut events: broadcast::Receiver<RecordEvent>,
    lister: DynLister,
    queue: WorkQueue<RecordKey>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("Starting event intake");

    loop {
        let received = tokio::select! {
            biased;

            _ = wait_until_set(&mut shutdown) => break,
            received = events.recv() => received,
        };

        match received {
            Ok(event) => enqueue_event(&queue, &event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Event intake lagged, re-enqueueing all records");
                enqueue_all(lister.as_ref(), &queue).await;
            }
            Err(broadcast::error::RecvError::Closed) => {
                info!("Event stream closed, stopping intake");
                break;
            }
        }
    }

    debug!("Event intake stopped");
}

fn enqueue_event(queue: &WorkQueue<RecordKey>, event: &RecordEvent) {
    if let RecordEvent::Updated { old, new } = event {
        if old == new {
            return;
        }
    }

    let record = event.record();
    match RecordKey::for_record(record) {
        Ok(key) => {
            debug!(key = %key, event = %event.event_type(), "Queued record");
            queue.add(key);
        }
        Err(e) => warn!(
            namespace = %record.namespace,
            name = %record.name,
            error = %e,
            "Skipping record with unusable key"
        ),
    }
}

async fn enqueue_all(lister: &dyn RecordLister, queue: &WorkQueue<RecordKey>) {
    let records = match lister.list().await {
        Ok(records) => records,
        Err(e) => {
            error!(error = %e, "Failed to list records for resync");
            return;
        }
    };

    for record in records {
        match RecordKey::for_record(&record) {
            Ok(key) => queue.add(key),
            Err(e) => warn!(name = %record.name, error = %e, "Skipping record with unusable key"),
        }
    }
}

async fn run_worker(id: usize, queue: WorkQueue<RecordKey>, reconciler: Arc<Reconciler>) {
    debug!(worker = id, "Worker started");
    while process_next_work_item(&queue, &reconciler).await {}
    debug!(worker = id, "Worker stopped");
}

/// Handles one key. Returns `false` once the queue is shut down.
async fn process_next_work_item(queue: &WorkQueue<RecordKey>, reconciler: &Reconciler) -> bool {
    let Some(key) = queue.get().await else {
        return false;
    };

    match AssertUnwindSafe(reconciler.reconcile(&key)).catch_unwind().await {
        Ok(Ok(())) => {
            debug!(key = %key, "Reconciled");
            queue.forget(&key);
        }
        Ok(Err(e)) => {
            warn!(
                key = %key,
                category = %e.category(),
                retryable = e.is_retryable(),
                requeues = queue.num_requeues(&key),
                error = %e,
                "Reconcile failed, requeueing"
            );
            queue.add_rate_limited(key.clone());
        }
        Err(panic) => {
            error!(
                key = %key,
                panic = %panic_message(panic.as_ref()),
                "Reconcile panicked, requeueing"
            );
            queue.add_rate_limited(key.clone());
        }
    }

    queue.done(&key);
    true
}
