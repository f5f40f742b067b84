//! Background aggregation workers
//!
//! Submissions return immediately; a `TriggerHandle` marks the user's pending
//! records QUEUED and drops a `Trigger` on a bounded channel. A fixed pool of
//! tokio tasks shares the receiver and drains the user's pending work one
//! batch at a time. Delivery is at-least-once at best: a full queue drops the
//! trigger and the QUEUED records wait for the next trigger or run.
//!
//! Shutdown is checked between batches, so a stopped worker never leaves a
//! batch half-applied.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::RollupError;
use crate::pipeline::RollupEngine;
use crate::status::ProcessingStatus;
use crate::store::{MeasurementStore, Store};

/// "Process pending work for this user"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub user_id: String,
}

/// Sending side of the trigger channel
#[derive(Clone)]
pub struct TriggerHandle {
    tx: mpsc::Sender<Trigger>,
    store: Arc<dyn Store>,
}

impl TriggerHandle {
    /// Queue the user's pending records for a worker.
    ///
    /// Returns `Ok(false)` when the queue is full and the trigger was dropped.
    pub fn notify(&self, user_id: &str) -> Result<bool, RollupError> {
        let queued = self.mark_queued(user_id)?;

        match self.tx.try_send(Trigger {
            user_id: user_id.to_string(),
        }) {
            Ok(()) => {
                debug!(user_id = %user_id, queued, "Trigger sent");
                Ok(true)
            }
            Err(TrySendError::Full(_)) => {
                warn!(user_id = %user_id, queued, "Trigger queue full, dropping trigger");
                Ok(false)
            }
            Err(TrySendError::Closed(_)) => {
                Err(RollupError::Worker("trigger channel closed".to_string()))
            }
        }
    }

    fn mark_queued(&self, user_id: &str) -> Result<usize, RollupError> {
        let mut queued = 0;
        for record in self.store.pending_measurements(user_id, usize::MAX)? {
            if self.store.transition_status(
                record.id,
                &[ProcessingStatus::Pending],
                ProcessingStatus::Queued,
                None,
            )? {
                queued += 1;
            }
        }
        Ok(queued)
    }
}

/// Fixed pool of tokio tasks draining triggers
pub struct AggregationWorker {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    batches: Arc<AtomicUsize>,
}

impl AggregationWorker {
    /// Start `config.workers` tasks on the current tokio runtime
    pub fn spawn(engine: Arc<RollupEngine>) -> (Self, TriggerHandle) {
        let workers = engine.config().workers;
        let (tx, rx) = mpsc::channel::<Trigger>(engine.config().trigger_queue_capacity);
        let rx = Arc::new(Mutex::new(rx));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let batches = Arc::new(AtomicUsize::new(0));

        let tasks = (0..workers)
            .map(|worker_id| {
                let engine = Arc::clone(&engine);
                let rx = Arc::clone(&rx);
                let shutdown = shutdown_rx.clone();
                let batches = Arc::clone(&batches);
                tokio::spawn(async move {
                    worker_task(worker_id, engine, rx, shutdown, batches).await;
                })
            })
            .collect();

        info!(workers, "Aggregation workers started");

        let handle = TriggerHandle {
            tx,
            store: engine.store().clone(),
        };
        (
            Self {
                shutdown_tx,
                tasks,
                batches,
            },
            handle,
        )
    }

    pub fn worker_count(&self) -> usize {
        self.tasks.len()
    }

    /// Batches processed so far, successful or not
    pub fn batches_processed(&self) -> usize {
        self.batches.load(Ordering::Relaxed)
    }

    /// Stop every worker after its current batch and wait for them
    pub async fn shutdown(self) {
        // Err only when every worker already exited
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Worker task panicked");
            }
        }
        info!("Aggregation workers stopped");
    }
}

async fn worker_task(
    worker_id: usize,
    engine: Arc<RollupEngine>,
    rx: Arc<Mutex<mpsc::Receiver<Trigger>>>,
    mut shutdown: watch::Receiver<bool>,
    batches: Arc<AtomicUsize>,
) {
    debug!(worker_id, "Worker starting");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let next = tokio::select! {
            _ = shutdown.changed() => None,
            trigger = async { rx.lock().await.recv().await } => trigger,
        };
        let Some(trigger) = next else {
            break;
        };

        drain_user(worker_id, &engine, &trigger.user_id, &shutdown, &batches).await;
    }

    debug!(worker_id, "Worker shutting down");
}

/// Process batches for one user until exhausted, an error, or shutdown
async fn drain_user(
    worker_id: usize,
    engine: &RollupEngine,
    user_id: &str,
    shutdown: &watch::Receiver<bool>,
    batches: &AtomicUsize,
) {
    loop {
        if *shutdown.borrow() {
            info!(worker_id, user_id = %user_id, "Shutdown requested, leaving remaining work queued");
            return;
        }

        let result = engine.process_batch(user_id).await;
        batches.fetch_add(1, Ordering::Relaxed);

        match result {
            Ok(report) if report.exhausted => return,
            Ok(_) => continue,
            Err(e) => {
                error!(worker_id, user_id = %user_id, error = %e, "Batch failed");
                return;
            }
        }
    }
}
