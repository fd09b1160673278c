//! Tunable scoring weights and thresholds.
//!
//! Every number that shapes a placement, render or quality decision lives
//! here so deployments can tune it without a rebuild. Defaults are built in;
//! a JSON file may override any subset.

use garde::Validate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PolicyConfig {
    #[garde(dive)]
    pub analyzer: AnalyzerPolicy,
    #[garde(dive)]
    pub placement: PlacementPolicy,
    #[garde(dive)]
    pub compositor: CompositorPolicy,
    #[garde(dive)]
    pub quality: QualityPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AnalyzerPolicy {
    /// Frames sampled per source video.
    #[garde(range(min = 1, max = 120))]
    pub sample_count: usize,
    /// Frames analysed concurrently for one job.
    #[garde(range(min = 1, max = 64))]
    pub max_concurrency: usize,
    /// Face or mark detections at or above this confidence become avoid
    /// regions. Kept low: a missed face is worse than a lost zone.
    #[garde(range(min = 0.0, max = 1.0))]
    pub avoid_floor: f64,
    /// Zones below this confidence are discarded.
    #[garde(range(min = 0.0, max = 1.0))]
    pub min_zone_confidence: f64,
}

impl Default for AnalyzerPolicy {
    fn default() -> Self {
        Self {
            sample_count: 5,
            max_concurrency: 5,
            avoid_floor: 0.1,
            min_zone_confidence: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PlacementPolicy {
    /// Depth treated as ideal mid-ground for tie-breaks.
    #[garde(range(min = 0.0, max = 1.0))]
    pub mid_ground_depth: f64,
}

impl Default for PlacementPolicy {
    fn default() -> Self {
        Self {
            mid_ground_depth: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CompositorPolicy {
    /// Length of the composited window centred on the anchor, seconds.
    #[garde(range(min = 0.0, max = 600.0))]
    pub window_secs: f64,
    /// Fade-in/out length at each end of the window, seconds.
    #[garde(range(min = 0.0, max = 10.0))]
    pub fade_secs: f64,
    /// Shrink factor applied to far zones (depth 1.0 renders at `1 - depth_scale`).
    #[garde(range(min = 0.0, max = 0.9))]
    pub depth_scale: f64,
    #[garde(range(min = 0.0, max = 1.0))]
    pub shadow_opacity: f64,
    /// Shadow offset as a fraction of the rendered asset size.
    #[garde(range(min = 0.0, max = 0.5))]
    pub shadow_offset: f64,
    /// Footprints within this normalized distance of an avoid region count as
    /// near misses.
    #[garde(range(min = 0.0, max = 0.5))]
    pub near_miss_margin: f64,
    /// Skipped-frame fraction above which geometry is flagged as degraded.
    #[garde(range(min = 0.0, max = 1.0))]
    pub geometry_skip_threshold: f64,
}

impl Default for CompositorPolicy {
    fn default() -> Self {
        Self {
            window_secs: 3.0,
            fade_secs: 0.25,
            depth_scale: 0.3,
            shadow_opacity: 0.35,
            shadow_offset: 0.08,
            near_miss_margin: 0.03,
            geometry_skip_threshold: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct QualityPolicy {
    /// Weight of placement confidence in realism; the rest is coverage.
    #[garde(range(min = 0.0, max = 1.0))]
    pub confidence_weight: f64,
    #[garde(range(min = 0.0, max = 1.0))]
    pub unstyled_penalty: f64,
    #[garde(range(min = 0.0, max = 1.0))]
    pub geometry_penalty: f64,
    #[garde(range(min = 0.0, max = 1.0))]
    pub degraded_analysis_penalty: f64,
    #[garde(range(min = 0.0, max = 1.0))]
    pub near_miss_weight: f64,
    #[garde(range(min = 0.0, max = 1.0))]
    pub on_person_penalty: f64,
    /// Realism below this is always rejected. Cannot be configured under 0.5.
    #[garde(range(min = 0.5, max = 1.0))]
    pub reject_realism: f64,
    #[garde(range(min = 0.0, max = 1.0))]
    pub reject_brand_safety: f64,
    #[garde(range(min = 0.0, max = 1.0))]
    pub publish_realism: f64,
    #[garde(range(min = 0.0, max = 1.0))]
    pub publish_brand_safety: f64,
    #[garde(range(min = 0.0, max = 1.0))]
    pub publish_engagement: f64,
}

impl Default for QualityPolicy {
    fn default() -> Self {
        Self {
            confidence_weight: 0.5,
            unstyled_penalty: 0.15,
            geometry_penalty: 0.2,
            degraded_analysis_penalty: 0.05,
            near_miss_weight: 0.6,
            on_person_penalty: 0.05,
            reject_realism: 0.5,
            reject_brand_safety: 0.4,
            publish_realism: 0.75,
            publish_brand_safety: 0.8,
            publish_engagement: 0.35,
        }
    }
}
