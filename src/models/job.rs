use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

use crate::models::asset::StyledAsset;
use crate::models::composite::CompositeResult;
use crate::models::media::MediaRef;
use crate::models::placement::{PlacementDecision, Platform, ProductCategory};
use crate::models::quality::QualityReport;
use crate::models::scene::SceneAnalysis;

/// Status of a compositing job.
///
/// `pending → analyzing → placing → styling → compositing → scoring →
/// completed`, with `failed` and `cancelled` reachable from any non-terminal
/// state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Analyzing,
    Placing,
    Styling,
    Compositing,
    Scoring,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Stage running while the job is in this status.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            JobStatus::Analyzing => Some(Stage::Analysis),
            JobStatus::Placing => Some(Stage::Placement),
            JobStatus::Styling => Some(Stage::Styling),
            JobStatus::Compositing => Some(Stage::Compositing),
            JobStatus::Scoring => Some(Stage::Scoring),
            JobStatus::Pending
            | JobStatus::Completed
            | JobStatus::Failed
            | JobStatus::Cancelled => None,
        }
    }

    /// Position along the forward path; terminal failure states rank last.
    fn rank(&self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Analyzing => 1,
            JobStatus::Placing => 2,
            JobStatus::Styling => 3,
            JobStatus::Compositing => 4,
            JobStatus::Scoring => 5,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => 6,
        }
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            JobStatus::Failed | JobStatus::Cancelled => true,
            JobStatus::Pending => false,
            JobStatus::Completed => *self == JobStatus::Scoring,
            _ => next.rank() == self.rank() + 1,
        }
    }
}

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    Analysis,
    Placement,
    Styling,
    Compositing,
    Scoring,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Analysis,
        Stage::Placement,
        Stage::Styling,
        Stage::Compositing,
        Stage::Scoring,
    ];

    /// Job status while this stage runs.
    pub fn status(&self) -> JobStatus {
        match self {
            Stage::Analysis => JobStatus::Analyzing,
            Stage::Placement => JobStatus::Placing,
            Stage::Styling => JobStatus::Styling,
            Stage::Compositing => JobStatus::Compositing,
            Stage::Scoring => JobStatus::Scoring,
        }
    }

    /// Slice of overall progress owned by this stage.
    pub fn progress_band(&self) -> (f64, f64) {
        match self {
            Stage::Analysis => (0.0, 0.25),
            Stage::Placement => (0.25, 0.30),
            Stage::Styling => (0.30, 0.40),
            Stage::Compositing => (0.40, 0.90),
            Stage::Scoring => (0.90, 1.0),
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Stage::Analysis => "Analyzing scene lighting and insertion zones",
            Stage::Placement => "Selecting product placement",
            Stage::Styling => "Matching product to scene lighting",
            Stage::Compositing => "Compositing product into video",
            Stage::Scoring => "Scoring output quality",
        }
    }
}

/// Optional explicit trim of the output, in source seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrimRange {
    pub start: f64,
    pub end: f64,
}

/// Inputs of a job, validated at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInputs {
    pub source_video: MediaRef,
    pub product_image: MediaRef,
    pub product_category: ProductCategory,
    pub platform: Platform,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trim: Option<TrimRange>,
}

/// Artifacts produced by completed stages. Each slot is written once by its
/// stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobArtifacts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scene_analysis: Option<SceneAnalysis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placement: Option<PlacementDecision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub styled_asset: Option<StyledAsset>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub composite: Option<CompositeResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_report: Option<QualityReport>,
}

/// In-place retry counters per stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageAttempts {
    pub analysis: u32,
    pub placement: u32,
    pub styling: u32,
    pub compositing: u32,
    pub scoring: u32,
}

impl StageAttempts {
    pub fn get(&self, stage: Stage) -> u32 {
        match stage {
            Stage::Analysis => self.analysis,
            Stage::Placement => self.placement,
            Stage::Styling => self.styling,
            Stage::Compositing => self.compositing,
            Stage::Scoring => self.scoring,
        }
    }

    pub fn increment(&mut self, stage: Stage) -> u32 {
        let slot = match stage {
            Stage::Analysis => &mut self.analysis,
            Stage::Placement => &mut self.placement,
            Stage::Styling => &mut self.styling,
            Stage::Compositing => &mut self.compositing,
            Stage::Scoring => &mut self.scoring,
        };
        *slot += 1;
        *slot
    }
}

/// Failure taxonomy recorded on a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
pub enum ErrorKind {
    InputError,
    AnalysisFailure,
    ExternalServiceUnavailable,
    ExternalServiceError,
    RenderError,
    Timeout,
    Cancelled,
    /// Engine defect, such as a job task that panicked.
    Internal,
}

/// Structured failure reason, present only when a job has failed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobError {
    pub kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    pub detail: String,
}

/// A compositing job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub inputs: JobInputs,
    pub progress: f64,
    pub stage_message: String,
    pub artifacts: JobArtifacts,
    pub error: Option<JobError>,
    pub attempts: StageAttempts,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(inputs: JobInputs) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Pending,
            inputs,
            progress: 0.0,
            stage_message: "Queued".to_string(),
            artifacts: JobArtifacts::default(),
            error: None,
            attempts: StageAttempts::default(),
            cancel_requested: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Raise progress; never lowers it.
    pub fn set_progress(&mut self, progress: f64) {
        let progress = progress.clamp(0.0, 1.0);
        if progress > self.progress {
            self.progress = progress;
        }
        self.updated_at = Utc::now();
    }

    /// Apply a status transition. Illegal transitions are refused.
    pub fn transition(&mut self, next: JobStatus, message: impl Into<String>) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.stage_message = message.into();
        if next == JobStatus::Completed {
            self.progress = 1.0;
        }
        self.updated_at = Utc::now();
        true
    }
}
