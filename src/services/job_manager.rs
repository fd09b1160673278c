use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::job::{ErrorKind, Job, JobError, JobInputs, JobStatus};
use crate::models::media::MediaRef;
use crate::models::requests::{CreateJobRequest, JobResult};
use crate::services::pipeline::Pipeline;
use crate::services::queue::{JobQueue, QueueError};
use crate::services::registry::{CancelError, JobRegistry, RetentionPolicy};
use crate::services::storage::{MediaStore, StorageError};

/// Errors of the public job API.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Job {id} is {status}")]
    InvalidState { id: Uuid, status: JobStatus },

    #[error("Invalid job input: {0}")]
    InvalidInput(String),

    #[error("Job queue is full ({capacity} jobs waiting)")]
    QueueFull { capacity: usize },

    #[error("Job queue is closed")]
    QueueClosed,

    #[error("Media store error: {0}")]
    Storage(#[from] StorageError),
}

impl From<CancelError> for EngineError {
    fn from(e: CancelError) -> Self {
        match e {
            CancelError::NotFound(id) => EngineError::NotFound(id),
            CancelError::Terminal { id, status } => EngineError::InvalidState { id, status },
        }
    }
}

impl From<QueueError> for EngineError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Full { capacity } => EngineError::QueueFull { capacity },
            QueueError::Closed => EngineError::QueueClosed,
        }
    }
}

/// Owns the job arena, the bounded queue and the worker pool.
pub struct JobManager {
    jobs: Arc<JobRegistry>,
    queue: Arc<JobQueue>,
    pipeline: Arc<Pipeline>,
    worker_count: usize,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobManager {
    /// Build the manager and spawn `worker_count` workers with the default
    /// retention policy.
    pub fn start(pipeline: Pipeline, worker_count: usize, queue_capacity: usize) -> Arc<Self> {
        Self::start_with_retention(
            pipeline,
            worker_count,
            queue_capacity,
            RetentionPolicy::default(),
        )
    }

    pub fn start_with_retention(
        pipeline: Pipeline,
        worker_count: usize,
        queue_capacity: usize,
        retention: RetentionPolicy,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            jobs: Arc::new(JobRegistry::new()),
            queue: Arc::new(JobQueue::new(queue_capacity)),
            pipeline: Arc::new(pipeline),
            worker_count: worker_count.max(1),
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        });

        let mut handles: Vec<JoinHandle<()>> = (0..manager.worker_count)
            .map(|worker| {
                tokio::spawn(run_worker(
                    worker,
                    manager.jobs.clone(),
                    manager.queue.clone(),
                    manager.pipeline.clone(),
                    manager.shutdown.clone(),
                ))
            })
            .collect();
        handles.push(tokio::spawn(run_retention(
            manager.jobs.clone(),
            retention,
            manager.shutdown.clone(),
        )));
        *manager.workers.lock() = handles;

        tracing::info!(
            workers = manager.worker_count,
            queue_capacity = manager.queue.capacity(),
            retention_secs = retention.ttl.as_secs(),
            "Job manager started"
        );
        manager
    }

    /// Validate a request, register the job and queue it.
    pub async fn create(&self, request: CreateJobRequest) -> Result<Uuid, EngineError> {
        let inputs = request.into_inputs().map_err(EngineError::InvalidInput)?;
        self.submit(inputs).await
    }

    /// Register and queue already-typed inputs. References must resolve.
    pub async fn submit(&self, inputs: JobInputs) -> Result<Uuid, EngineError> {
        self.ensure_resolves("source_video_ref", &inputs.source_video)
            .await?;
        self.ensure_resolves("product_image_ref", &inputs.product_image)
            .await?;

        let job = Job::new(inputs);
        let category = job.inputs.product_category;
        let id = self.jobs.insert(job);
        if let Err(e) = self.queue.enqueue(id) {
            self.jobs.remove(id);
            tracing::warn!(job_id = %id, error = %e, "Rejected job submission");
            return Err(e.into());
        }

        metrics::counter!("compositor_jobs_submitted_total").increment(1);
        tracing::info!(
            job_id = %id,
            category = %category,
            queue_depth = self.queue.queue_depth(),
            "Job queued"
        );
        Ok(id)
    }

    async fn ensure_resolves(&self, field: &str, media: &MediaRef) -> Result<(), EngineError> {
        match self.pipeline.store().exists(media).await {
            Ok(true) => Ok(()),
            Ok(false) | Err(StorageError::InvalidRef(_)) => Err(EngineError::InvalidInput(
                format!("{} '{}' does not resolve to stored media", field, media),
            )),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_status(&self, id: Uuid) -> Result<Job, EngineError> {
        self.jobs.get(id).ok_or(EngineError::NotFound(id))
    }

    /// Final result; only available once the job has completed.
    pub fn result(&self, id: Uuid) -> Result<JobResult, EngineError> {
        let job = self.get_status(id)?;
        if job.status != JobStatus::Completed {
            return Err(EngineError::InvalidState {
                id,
                status: job.status,
            });
        }
        JobResult::from_job(&job).ok_or(EngineError::InvalidState {
            id,
            status: job.status,
        })
    }

    /// Request cancellation. Returns the job as it stands after the request.
    pub fn cancel(&self, id: Uuid) -> Result<Job, EngineError> {
        let job = self.jobs.request_cancel(id)?;
        if job.status == JobStatus::Cancelled {
            metrics::counter!("compositor_jobs_cancelled_total").increment(1);
        }
        tracing::info!(job_id = %id, status = %job.status, "Cancellation requested");
        Ok(job)
    }

    pub fn store(&self) -> &Arc<dyn MediaStore> {
        self.pipeline.store()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.queue_depth()
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn active_jobs(&self) -> usize {
        self.jobs.active()
    }

    /// Stop taking jobs off the queue, wait for in-flight jobs to finish and
    /// cancel every job still waiting.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }

        let stranded = self.queue.drain().await;
        for id in &stranded {
            let cancelled = self
                .jobs
                .update(*id, |job| {
                    job.cancel_requested = true;
                    job.transition(JobStatus::Cancelled, "Cancelled at shutdown")
                })
                .unwrap_or(false);
            if cancelled {
                metrics::counter!("compositor_jobs_cancelled_total").increment(1);
            }
        }
        if !stranded.is_empty() {
            tracing::warn!(jobs = stranded.len(), "Cancelled queued jobs at shutdown");
        }
    }
}

/// Pull jobs off the queue until shutdown. Each job runs in its own task so a
/// panic fails that job and the worker carries on.
async fn run_worker(
    worker: usize,
    jobs: Arc<JobRegistry>,
    queue: Arc<JobQueue>,
    pipeline: Arc<Pipeline>,
    shutdown: CancellationToken,
) {
    tracing::debug!(worker, "Worker started");
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => None,
            id = queue.dequeue() => id,
        };
        let Some(id) = next else {
            break;
        };
        tracing::info!(worker, job_id = %id, "Processing compositing job");

        let task = tokio::spawn({
            let jobs = jobs.clone();
            let pipeline = pipeline.clone();
            async move { pipeline.run(&jobs, id).await }
        });
        if let Err(e) = task.await {
            tracing::error!(worker, job_id = %id, error = %e, "Job task panicked");
            fail_abandoned(&jobs, id, e.to_string());
        }
    }
    tracing::debug!(worker, "Worker stopped");
}

/// Record a job whose task died without reaching a terminal state.
fn fail_abandoned(jobs: &JobRegistry, id: Uuid, detail: String) {
    let failed = jobs
        .update(id, |job| {
            let stage = job.status.stage();
            if !job.transition(JobStatus::Failed, "Failed: job task aborted") {
                return false;
            }
            job.error = Some(JobError {
                kind: ErrorKind::Internal,
                stage,
                detail,
            });
            true
        })
        .unwrap_or(false);
    if failed {
        metrics::counter!("compositor_jobs_failed_total").increment(1);
    }
}

/// Evict finished jobs on a fixed interval until shutdown.
async fn run_retention(
    jobs: Arc<JobRegistry>,
    retention: RetentionPolicy,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(retention.sweep_interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let evicted = jobs.evict_terminal(chrono::Utc::now(), &retention);
                if evicted > 0 {
                    tracing::info!(evicted, remaining = jobs.len(), "Evicted finished jobs");
                } else {
                    tracing::debug!("Job retention: nothing to evict");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::policy::PolicyConfig;
    use crate::services::media::{CodecError, FrameEditor, TranscodePlan, VideoCodec, VideoInfo};
    use crate::services::retry::RetryConfig;
    use crate::services::storage::MemoryStore;
    use crate::services::vision::{HeuristicConfig, HeuristicDetector};
    use async_trait::async_trait;
    use image::RgbImage;
    use std::time::Duration;

    /// Codec that cannot read anything.
    struct BrokenCodec;

    #[async_trait]
    impl VideoCodec for BrokenCodec {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn inspect(&self, _source: &[u8]) -> Result<VideoInfo, CodecError> {
            Err(CodecError::Inspect("not a video".into()))
        }

        async fn extract_frames(
            &self,
            _source: &[u8],
            _info: &VideoInfo,
            _indices: &[usize],
        ) -> Result<Vec<RgbImage>, CodecError> {
            Err(CodecError::Decode("not a video".into()))
        }

        async fn transcode(
            &self,
            _source: &[u8],
            _info: &VideoInfo,
            _plan: &TranscodePlan,
            _editor: &mut dyn FrameEditor,
        ) -> Result<Vec<u8>, CodecError> {
            Err(CodecError::Encode("not a video".into()))
        }
    }

    /// Codec that blows up on first use.
    struct PanickingCodec;

    #[async_trait]
    impl VideoCodec for PanickingCodec {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn inspect(&self, _source: &[u8]) -> Result<VideoInfo, CodecError> {
            panic!("codec bug");
        }

        async fn extract_frames(
            &self,
            _source: &[u8],
            _info: &VideoInfo,
            _indices: &[usize],
        ) -> Result<Vec<RgbImage>, CodecError> {
            unreachable!()
        }

        async fn transcode(
            &self,
            _source: &[u8],
            _info: &VideoInfo,
            _plan: &TranscodePlan,
            _editor: &mut dyn FrameEditor,
        ) -> Result<Vec<u8>, CodecError> {
            unreachable!()
        }
    }

    fn manager(store: Arc<MemoryStore>, workers: usize, capacity: usize) -> Arc<JobManager> {
        manager_with_codec(store, Arc::new(BrokenCodec), workers, capacity)
    }

    fn manager_with_codec(
        store: Arc<MemoryStore>,
        codec: Arc<dyn VideoCodec>,
        workers: usize,
        capacity: usize,
    ) -> Arc<JobManager> {
        let pipeline = Pipeline::new(crate::services::pipeline::PipelineDeps {
            store,
            codec,
            detector: Arc::new(HeuristicDetector::new(HeuristicConfig::default())),
            styler: None,
            policy: PolicyConfig::default(),
            retry: RetryConfig::default().with_max_retries(0),
            stage_timeout: Duration::from_secs(5),
            capability_timeout: Duration::from_secs(1),
        });
        JobManager::start(pipeline, workers, capacity)
    }

    fn request(video: &str, image: &str) -> CreateJobRequest {
        CreateJobRequest {
            source_video_ref: video.to_string(),
            product_image_ref: image.to_string(),
            product_category: "phone".to_string(),
            platform_hint: None,
            trim: None,
        }
    }

    async fn wait_terminal(manager: &JobManager, id: Uuid) -> Job {
        for _ in 0..200 {
            let job = manager.get_status(id).unwrap();
            if job.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never finished", id);
    }

    #[tokio::test]
    async fn test_unresolvable_reference_rejected() {
        let store = Arc::new(MemoryStore::new());
        store.insert("video", vec![1, 2, 3]);
        let manager = manager(store, 1, 4);

        let err = manager
            .create(request("video", "missing.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(ref msg) if msg.contains("product_image_ref")));
        assert_eq!(manager.active_jobs(), 0);
    }

    #[tokio::test]
    async fn test_unknown_job_not_found() {
        let manager = manager(Arc::new(MemoryStore::new()), 1, 4);
        let id = Uuid::new_v4();
        assert!(matches!(manager.get_status(id), Err(EngineError::NotFound(_))));
        assert!(matches!(manager.result(id), Err(EngineError::NotFound(_))));
        assert!(matches!(manager.cancel(id), Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_undecodable_source_fails_with_input_error() {
        let store = Arc::new(MemoryStore::new());
        store.insert("video", b"garbage".to_vec());
        store.insert("image", b"garbage".to_vec());
        let manager = manager(store, 1, 4);

        let id = manager.create(request("video", "image")).await.unwrap();
        let job = wait_terminal(&manager, id).await;
        assert_eq!(job.status, JobStatus::Failed);
        let error = job.error.unwrap();
        assert_eq!(error.kind, crate::models::job::ErrorKind::InputError);
        assert_eq!(error.stage, Some(crate::models::job::Stage::Analysis));

        assert!(matches!(
            manager.result(id),
            Err(EngineError::InvalidState { status: JobStatus::Failed, .. })
        ));
        assert!(matches!(
            manager.cancel(id),
            Err(EngineError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_queue_full_rejects_and_forgets_job() {
        let store = Arc::new(MemoryStore::new());
        store.insert("video", vec![0]);
        store.insert("image", vec![0]);
        let manager = manager(store, 1, 1);
        manager.shutdown().await;

        manager.create(request("video", "image")).await.unwrap();
        let err = manager.create(request("video", "image")).await.unwrap_err();
        assert!(matches!(err, EngineError::QueueFull { capacity: 1 }));
        assert_eq!(manager.active_jobs(), 1);
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        let store = Arc::new(MemoryStore::new());
        store.insert("video", vec![0]);
        store.insert("image", vec![0]);
        let manager = manager(store, 1, 4);
        manager.shutdown().await;

        let id = manager.create(request("video", "image")).await.unwrap();
        let job = manager.cancel(id).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.cancel_requested);
        assert!(job.error.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_jobs_left_in_queue() {
        let store = Arc::new(MemoryStore::new());
        store.insert("video", vec![0]);
        store.insert("image", vec![0]);
        let manager = manager(store, 1, 4);
        manager.shutdown().await;

        let id = manager.create(request("video", "image")).await.unwrap();
        assert_eq!(manager.get_status(id).unwrap().status, JobStatus::Pending);
        manager.shutdown().await;

        let job = manager.get_status(id).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.cancel_requested);
        assert_eq!(manager.queue_depth(), 0);
        assert_eq!(manager.active_jobs(), 0);
    }

    #[tokio::test]
    async fn test_panicking_job_fails_and_worker_survives() {
        let store = Arc::new(MemoryStore::new());
        store.insert("video", vec![0]);
        store.insert("image", vec![0]);
        let manager = manager_with_codec(store, Arc::new(PanickingCodec), 1, 4);

        let first = manager.create(request("video", "image")).await.unwrap();
        let second = manager.create(request("video", "image")).await.unwrap();
        for id in [first, second] {
            let job = wait_terminal(&manager, id).await;
            assert_eq!(job.status, JobStatus::Failed);
            let error = job.error.unwrap();
            assert_eq!(error.kind, ErrorKind::Internal);
            assert_eq!(error.stage, Some(crate::models::job::Stage::Analysis));
        }
    }
}
