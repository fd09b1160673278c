//! Stage sequencer.
//!
//! Runs the five stages of a job strictly in order. Each stage reads only
//! artifacts already committed to the job record and its own output is
//! committed atomically before the next stage starts. Every attempt is bounded
//! by the stage timeout; retryable failures are retried in place with
//! exponential backoff and never change the job status.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::policy::PolicyConfig;
use crate::models::asset::StyledAsset;
use crate::models::composite::CompositeResult;
use crate::models::job::{ErrorKind, Job, JobArtifacts, JobError, JobStatus, Stage};
use crate::models::placement::PlacementDecision;
use crate::models::quality::QualityReport;
use crate::models::scene::SceneAnalysis;
use crate::services::capability::CapabilityError;
use crate::services::compositor::{CompositeError, CompositeInput, Compositor};
use crate::services::media::VideoCodec;
use crate::services::placement::{select_placement, PlacementError};
use crate::services::quality::{evaluate, QualityInput};
use crate::services::registry::JobRegistry;
use crate::services::retry::{backoff, RetryConfig};
use crate::services::scene_analyzer::{AnalyzerError, SceneAnalyzer};
use crate::services::storage::{MediaStore, ScopedWriter, StorageError};
use crate::services::stylist::{AssetStylist, StyleCapability, StylistError};
use crate::services::vision::ZoneDetector;

/// Failure of a single stage attempt, classified by the job error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("{0}")]
    Input(String),

    #[error("{0}")]
    Analysis(String),

    #[error("{0}")]
    ExternalService(String),

    #[error("{0}")]
    Render(String),

    #[error("Stage exceeded its {0:?} budget")]
    Timeout(Duration),

    #[error("Cancelled")]
    Cancelled,
}

impl StageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::Input(_) => ErrorKind::InputError,
            StageError::Analysis(_) => ErrorKind::AnalysisFailure,
            StageError::ExternalService(_) => ErrorKind::ExternalServiceError,
            StageError::Render(_) => ErrorKind::RenderError,
            StageError::Timeout(_) => ErrorKind::Timeout,
            StageError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StageError::ExternalService(_) | StageError::Render(_) | StageError::Timeout(_)
        )
    }
}

impl From<StorageError> for StageError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(_) | StorageError::InvalidRef(_) => {
                StageError::Input(e.to_string())
            }
            other => StageError::ExternalService(other.to_string()),
        }
    }
}

impl From<CapabilityError> for StageError {
    fn from(e: CapabilityError) -> Self {
        match e {
            CapabilityError::TimedOut { timeout, .. } => StageError::Timeout(timeout),
            other => StageError::ExternalService(other.to_string()),
        }
    }
}

impl From<AnalyzerError> for StageError {
    fn from(e: AnalyzerError) -> Self {
        match e {
            AnalyzerError::Undecodable(_) => StageError::Input(e.to_string()),
            AnalyzerError::Codec(_) => StageError::Render(e.to_string()),
            AnalyzerError::Capability(inner) => inner.into(),
            AnalyzerError::Cancelled => StageError::Cancelled,
        }
    }
}

impl From<PlacementError> for StageError {
    fn from(e: PlacementError) -> Self {
        StageError::Analysis(e.to_string())
    }
}

impl From<StylistError> for StageError {
    fn from(e: StylistError) -> Self {
        match e {
            StylistError::InvalidImage(_) => StageError::Input(e.to_string()),
            StylistError::Capability(inner) => inner.into(),
            StylistError::Encode(_) => StageError::Render(e.to_string()),
            StylistError::Storage(inner) => inner.into(),
        }
    }
}

impl From<CompositeError> for StageError {
    fn from(e: CompositeError) -> Self {
        match e {
            CompositeError::Codec(_) | CompositeError::Asset(_) => {
                StageError::Render(e.to_string())
            }
            CompositeError::InvalidTrim { .. } | CompositeError::WindowOutsideTrim { .. } => {
                StageError::Input(e.to_string())
            }
            CompositeError::Storage(inner) => inner.into(),
            CompositeError::Cancelled => StageError::Cancelled,
        }
    }
}

/// Output of one stage, committed into its artifact slot.
#[derive(Debug)]
pub enum StageOutput {
    Scene(SceneAnalysis),
    Placement(PlacementDecision),
    Styled(StyledAsset),
    Composite(CompositeResult),
    Quality(QualityReport),
}

impl StageOutput {
    fn store_in(self, artifacts: &mut JobArtifacts) {
        match self {
            StageOutput::Scene(a) => artifacts.scene_analysis = Some(a),
            StageOutput::Placement(p) => artifacts.placement = Some(p),
            StageOutput::Styled(s) => artifacts.styled_asset = Some(s),
            StageOutput::Composite(c) => artifacts.composite = Some(c),
            StageOutput::Quality(q) => artifacts.quality_report = Some(q),
        }
    }
}

/// Collaborators and tuning for the pipeline.
pub struct PipelineDeps {
    pub store: Arc<dyn MediaStore>,
    pub codec: Arc<dyn VideoCodec>,
    pub detector: Arc<dyn ZoneDetector>,
    pub styler: Option<Arc<dyn StyleCapability>>,
    pub policy: PolicyConfig,
    pub retry: RetryConfig,
    pub stage_timeout: Duration,
    pub capability_timeout: Duration,
}

pub struct Pipeline {
    store: Arc<dyn MediaStore>,
    analyzer: SceneAnalyzer,
    stylist: AssetStylist,
    compositor: Compositor,
    policy: PolicyConfig,
    retry: RetryConfig,
    stage_timeout: Duration,
}

fn missing(artifact: &str) -> StageError {
    StageError::Analysis(format!("Required {} artifact was never committed", artifact))
}

impl Pipeline {
    pub fn new(deps: PipelineDeps) -> Self {
        Self {
            analyzer: SceneAnalyzer::new(
                deps.codec.clone(),
                deps.detector,
                deps.policy.analyzer.clone(),
                deps.capability_timeout,
            ),
            stylist: AssetStylist::new(deps.styler, deps.capability_timeout),
            compositor: Compositor::new(deps.codec, deps.policy.compositor.clone()),
            store: deps.store,
            policy: deps.policy,
            retry: deps.retry,
            stage_timeout: deps.stage_timeout,
        }
    }

    pub fn store(&self) -> &Arc<dyn MediaStore> {
        &self.store
    }

    /// Drive a job from `pending` to a terminal state.
    pub async fn run(&self, jobs: &JobRegistry, id: Uuid) {
        let Some(cancel) = jobs.cancel_token(id) else {
            tracing::warn!(job_id = %id, "Dequeued unknown job");
            return;
        };
        let started = Instant::now();

        for stage in Stage::ALL {
            if cancel.is_cancelled() {
                self.finish_cancelled(jobs, id, stage);
                return;
            }

            let (band_start, band_end) = stage.progress_band();
            let entered = jobs
                .update(id, |job| {
                    let moved = job.transition(stage.status(), stage.message());
                    if moved {
                        job.set_progress(band_start);
                    }
                    moved
                })
                .unwrap_or(false);
            if !entered {
                tracing::info!(job_id = %id, stage = %stage, "Job ended before stage start");
                return;
            }
            tracing::info!(job_id = %id, stage = %stage, "Stage started");

            let stage_started = Instant::now();
            let result = self.run_with_retries(jobs, id, stage, &cancel).await;
            metrics::histogram!("compositor_stage_duration_seconds", "stage" => stage.to_string())
                .record(stage_started.elapsed().as_secs_f64());

            let (output, written) = match result {
                Ok(attempt) => attempt,
                Err(StageError::Cancelled) => {
                    self.finish_cancelled(jobs, id, stage);
                    return;
                }
                Err(e) => {
                    self.finish_failed(jobs, id, stage, e);
                    return;
                }
            };

            let committed = jobs.commit(id, |job| {
                output.store_in(&mut job.artifacts);
                job.set_progress(band_end);
            });
            if !committed {
                tracing::debug!(
                    job_id = %id,
                    stage = %stage,
                    blobs = written.written().len(),
                    "Discarding uncommitted stage output"
                );
                written.discard().await;
                self.finish_cancelled(jobs, id, stage);
                return;
            }
            tracing::info!(
                job_id = %id,
                stage = %stage,
                duration_ms = stage_started.elapsed().as_millis() as u64,
                "Stage committed"
            );
        }

        let finished = jobs
            .update(id, |job| {
                let done = job.transition(JobStatus::Completed, "Completed");
                (done, job.clone())
            })
            .filter(|(done, _)| *done)
            .map(|(_, job)| job);
        let Some(job) = finished else {
            self.finish_cancelled(jobs, id, Stage::Scoring);
            return;
        };

        metrics::counter!("compositor_jobs_completed_total").increment(1);
        if is_degraded(&job) {
            metrics::counter!("compositor_jobs_degraded_total").increment(1);
        }
        tracing::info!(
            job_id = %id,
            duration_ms = started.elapsed().as_millis() as u64,
            recommendation = ?job.artifacts.quality_report.as_ref().map(|q| q.recommendation),
            degraded = is_degraded(&job),
            "Job completed"
        );
    }

    async fn run_with_retries(
        &self,
        jobs: &JobRegistry,
        id: Uuid,
        stage: Stage,
        cancel: &CancellationToken,
    ) -> Result<(StageOutput, ScopedWriter), StageError> {
        let mut retries = 0u32;
        loop {
            // Lives outside the timed future so a timeout can still roll back
            // blobs the attempt already stored.
            let output = ScopedWriter::for_job(self.store.clone(), id);
            let attempt = tokio::time::timeout(
                self.stage_timeout,
                self.run_stage(jobs, id, stage, &output, cancel),
            )
            .await;
            let err = match attempt {
                Ok(Ok(result)) => return Ok((result, output)),
                Ok(Err(e)) => e,
                Err(_) => StageError::Timeout(self.stage_timeout),
            };
            output.discard().await;

            if !err.is_retryable() || retries >= self.retry.max_retries {
                return Err(err);
            }
            retries += 1;
            jobs.update(id, |job| job.attempts.increment(stage));
            let delay = self.retry.delay_for_retry(retries);
            tracing::warn!(
                job_id = %id,
                stage = %stage,
                retry = retries,
                max_retries = self.retry.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Stage attempt failed, retrying"
            );
            if !backoff(delay, cancel).await {
                return Err(StageError::Cancelled);
            }
        }
    }

    async fn run_stage(
        &self,
        jobs: &JobRegistry,
        id: Uuid,
        stage: Stage,
        output: &ScopedWriter,
        cancel: &CancellationToken,
    ) -> Result<StageOutput, StageError> {
        let job = jobs.get(id).ok_or(StageError::Cancelled)?;
        let inputs = &job.inputs;
        let artifacts = &job.artifacts;

        match stage {
            Stage::Analysis => {
                let source = self.store.get(&inputs.source_video).await?;
                let analysis = self.analyzer.analyze(&source, cancel).await?;
                if analysis.degraded {
                    tracing::warn!(job_id = %id, detector = %analysis.detector, "Scene analysis degraded");
                }
                Ok(StageOutput::Scene(analysis))
            }
            Stage::Placement => {
                let analysis = artifacts
                    .scene_analysis
                    .as_ref()
                    .ok_or_else(|| missing("scene analysis"))?;
                let decision = select_placement(
                    analysis,
                    inputs.product_category,
                    &self.policy.placement,
                )?;
                Ok(StageOutput::Placement(decision))
            }
            Stage::Styling => {
                let placement = artifacts
                    .placement
                    .as_ref()
                    .ok_or_else(|| missing("placement"))?;
                let product = self.store.get(&inputs.product_image).await?;
                let styled = self
                    .stylist
                    .style(&product, &placement.lighting, output)
                    .await?;
                Ok(StageOutput::Styled(styled))
            }
            Stage::Compositing => {
                let analysis = artifacts
                    .scene_analysis
                    .as_ref()
                    .ok_or_else(|| missing("scene analysis"))?;
                let placement = artifacts
                    .placement
                    .as_ref()
                    .ok_or_else(|| missing("placement"))?;
                let styled = artifacts
                    .styled_asset
                    .as_ref()
                    .ok_or_else(|| missing("styled asset"))?;

                let source = self.store.get(&inputs.source_video).await?;
                let asset_png = self.store.get(&styled.asset_ref).await?;
                let (band_start, band_end) = Stage::Compositing.progress_band();
                let progress = |fraction: f64| {
                    jobs.update(id, |job| {
                        job.set_progress(band_start + (band_end - band_start) * fraction)
                    });
                };

                let result = self
                    .compositor
                    .composite(
                        CompositeInput {
                            source: &source,
                            asset_png: &asset_png,
                            placement,
                            analysis,
                            trim: inputs.trim,
                            output,
                        },
                        cancel,
                        &progress,
                    )
                    .await?;
                Ok(StageOutput::Composite(result))
            }
            Stage::Scoring => {
                let placement = artifacts
                    .placement
                    .as_ref()
                    .ok_or_else(|| missing("placement"))?;
                let styled = artifacts
                    .styled_asset
                    .as_ref()
                    .ok_or_else(|| missing("styled asset"))?;
                let composite = artifacts
                    .composite
                    .as_ref()
                    .ok_or_else(|| missing("composite"))?;
                let analysis_degraded = artifacts
                    .scene_analysis
                    .as_ref()
                    .map(|a| a.degraded)
                    .unwrap_or(false);

                let report = evaluate(
                    &QualityInput {
                        placement,
                        styled,
                        composite,
                        analysis_degraded,
                        platform: inputs.platform,
                    },
                    &self.policy.quality,
                );
                Ok(StageOutput::Quality(report))
            }
        }
    }

    fn finish_cancelled(&self, jobs: &JobRegistry, id: Uuid, stage: Stage) {
        let cancelled = jobs
            .update(id, |job| job.transition(JobStatus::Cancelled, "Cancelled"))
            .unwrap_or(false);
        if cancelled {
            metrics::counter!("compositor_jobs_cancelled_total").increment(1);
            tracing::info!(job_id = %id, stage = %stage, "Job cancelled");
        }
    }

    fn finish_failed(&self, jobs: &JobRegistry, id: Uuid, stage: Stage, err: StageError) {
        let kind = err.kind();
        let detail = err.to_string();
        let outcome = jobs
            .update(id, |job| {
                if job.cancel_requested {
                    return job
                        .transition(JobStatus::Cancelled, "Cancelled")
                        .then_some(JobStatus::Cancelled);
                }
                if !job.transition(JobStatus::Failed, format!("Failed during {}", stage)) {
                    return None;
                }
                job.error = Some(JobError {
                    kind,
                    stage: Some(stage),
                    detail: detail.clone(),
                });
                Some(JobStatus::Failed)
            })
            .flatten();

        match outcome {
            Some(JobStatus::Failed) => {
                metrics::counter!("compositor_jobs_failed_total").increment(1);
                tracing::error!(
                    job_id = %id,
                    stage = %stage,
                    kind = %kind,
                    error = %detail,
                    "Job failed"
                );
            }
            Some(_) => {
                metrics::counter!("compositor_jobs_cancelled_total").increment(1);
                tracing::info!(job_id = %id, stage = %stage, "Job cancelled");
            }
            None => {}
        }
    }
}

/// Completed on a degraded path: fallback detection, unstyled asset or
/// degraded geometry.
fn is_degraded(job: &Job) -> bool {
    let artifacts = &job.artifacts;
    artifacts
        .scene_analysis
        .as_ref()
        .is_some_and(|a| a.degraded)
        || artifacts.styled_asset.as_ref().is_some_and(|s| !s.styled)
        || artifacts
            .composite
            .as_ref()
            .is_some_and(|c| c.geometry_degraded)
}
