use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::composite::TimeRange;
use crate::models::job::{Job, JobError, JobInputs, JobStatus, TrimRange};
use crate::models::media::MediaRef;
use crate::models::placement::{Platform, ProductCategory};
use crate::models::quality::{QualityReport, Recommendation};
use crate::models::scene::{Region, ZoneType};

/// Request to create a compositing job.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CreateJobRequest {
    #[garde(length(min = 1, max = 512))]
    pub source_video_ref: String,

    #[garde(length(min = 1, max = 512))]
    pub product_image_ref: String,

    #[garde(length(min = 1, max = 64))]
    pub product_category: String,

    #[garde(skip)]
    pub platform_hint: Option<String>,

    #[garde(dive)]
    pub trim: Option<TrimRequest>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Validate)]
pub struct TrimRequest {
    #[garde(range(min = 0.0))]
    pub start: f64,

    #[garde(range(min = 0.0))]
    pub end: f64,
}

impl CreateJobRequest {
    /// Validate and convert into typed job inputs.
    ///
    /// Media references are only checked for shape here; resolvability is
    /// checked against the media store by the job manager.
    pub fn into_inputs(self) -> Result<JobInputs, String> {
        self.validate().map_err(|report| report.to_string())?;

        let product_category = self
            .product_category
            .trim()
            .parse::<ProductCategory>()
            .map_err(|_| format!("Unrecognized product category '{}'", self.product_category))?;

        let platform = match self.platform_hint.as_deref().map(str::trim) {
            None | Some("") => Platform::default(),
            Some(hint) => hint
                .parse::<Platform>()
                .map_err(|_| format!("Unrecognized platform hint '{}'", hint))?,
        };

        let trim = match self.trim {
            Some(t) if t.end <= t.start => {
                return Err(format!(
                    "Trim end ({:.3}s) must be after start ({:.3}s)",
                    t.end, t.start
                ))
            }
            Some(t) => Some(TrimRange {
                start: t.start,
                end: t.end,
            }),
            None => None,
        };

        Ok(JobInputs {
            source_video: MediaRef::new(self.source_video_ref.trim()),
            product_image: MediaRef::new(self.product_image_ref.trim()),
            product_category,
            platform,
            trim,
        })
    }
}

/// Response after creating a job.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateJobResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
}

/// Response for polling a job.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub progress: f64,
    pub stage_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub cancel_requested: bool,
}

impl From<&Job> for JobStatusResponse {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            progress: job.progress,
            stage_message: job.stage_message.clone(),
            error: job.error.clone(),
            cancel_requested: job.cancel_requested,
        }
    }
}

/// Compact view of where and how the product was placed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementSummary {
    pub zone_type: ZoneType,
    pub region: Region,
    pub anchor_timestamp: f64,
    pub confidence: f64,
    pub rationale: String,
    pub styled: bool,
    pub modified_range: TimeRange,
    pub frames_composited: usize,
    pub frames_skipped: usize,
}

/// Final result of a completed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: Uuid,
    pub output_video_ref: MediaRef,
    pub placement_summary: PlacementSummary,
    pub quality_report: QualityReport,
    /// Set when the quality gate recommends rejecting the output.
    pub rejected: bool,
}

impl JobResult {
    /// Assemble from a completed job; `None` if any artifact is missing.
    pub fn from_job(job: &Job) -> Option<Self> {
        let placement = job.artifacts.placement.as_ref()?;
        let styled = job.artifacts.styled_asset.as_ref()?;
        let composite = job.artifacts.composite.as_ref()?;
        let report = job.artifacts.quality_report.as_ref()?;

        Some(Self {
            job_id: job.id,
            output_video_ref: composite.output_video.clone(),
            placement_summary: PlacementSummary {
                zone_type: placement.selected_zone.zone_type,
                region: placement.selected_zone.region,
                anchor_timestamp: placement.anchor_timestamp,
                confidence: placement.confidence,
                rationale: placement.compatibility_rationale.clone(),
                styled: styled.styled,
                modified_range: composite.modified_range,
                frames_composited: composite.frames_composited,
                frames_skipped: composite.frames_skipped,
            },
            quality_report: report.clone(),
            rejected: report.recommendation == Recommendation::Reject,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub cancel_requested: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MediaUploadResponse {
    pub media_ref: MediaRef,
    pub size: usize,
}
