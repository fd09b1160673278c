use serde::{Deserialize, Serialize};
use strum::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Recommendation {
    Publish,
    Revise,
    Reject,
}

/// Informational quality gate attached to a completed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityReport {
    pub realism: f64,
    pub brand_safety: f64,
    pub engagement_potential: f64,
    pub recommendation: Recommendation,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub notes: Vec<String>,
}
