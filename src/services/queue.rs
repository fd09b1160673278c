use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

/// Bounded in-process job queue shared by the worker pool.
///
/// Enqueue never waits: a full queue is reported to the caller so job
/// creation can apply backpressure.
pub struct JobQueue {
    tx: mpsc::Sender<Uuid>,
    rx: Arc<Mutex<mpsc::Receiver<Uuid>>>,
    depth: AtomicUsize,
    capacity: usize,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            depth: AtomicUsize::new(0),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue a job id for processing.
    pub fn enqueue(&self, job_id: Uuid) -> Result<(), QueueError> {
        self.tx.try_send(job_id).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Full {
                capacity: self.capacity,
            },
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
        })?;
        let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::gauge!("compositor_queue_depth").set(depth as f64);
        Ok(())
    }

    /// Wait for the next job id. `None` once the queue is closed and drained.
    pub async fn dequeue(&self) -> Option<Uuid> {
        let job_id = self.rx.lock().await.recv().await?;
        let depth = self
            .depth
            .fetch_sub(1, Ordering::SeqCst)
            .saturating_sub(1);
        metrics::gauge!("compositor_queue_depth").set(depth as f64);
        Some(job_id)
    }

    /// Take every job id still waiting, without blocking.
    pub async fn drain(&self) -> Vec<Uuid> {
        let mut rx = self.rx.lock().await;
        let mut drained = Vec::new();
        while let Ok(job_id) = rx.try_recv() {
            drained.push(job_id);
        }
        let depth = self
            .depth
            .fetch_sub(drained.len(), Ordering::SeqCst)
            .saturating_sub(drained.len());
        metrics::gauge!("compositor_queue_depth").set(depth as f64);
        drained
    }

    /// Current number of jobs waiting for a worker.
    pub fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Job queue is full ({capacity} jobs waiting)")]
    Full { capacity: usize },

    #[error("Job queue is closed")]
    Closed,
}
