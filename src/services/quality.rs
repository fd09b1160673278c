use crate::config::policy::QualityPolicy;
use crate::models::asset::StyledAsset;
use crate::models::composite::CompositeResult;
use crate::models::placement::{PlacementDecision, Platform};
use crate::models::quality::{QualityReport, Recommendation};
use crate::models::scene::ZoneType;

/// Realism under this is always rejected, whatever the policy says.
pub const REALISM_FLOOR: f64 = 0.5;

/// Screen-time share at which the engagement term saturates.
const FULL_SCREEN_TIME: f64 = 0.2;
/// Zone area (fraction of frame) at which the size term saturates.
const FULL_ZONE_AREA: f64 = 0.1;

pub struct QualityInput<'a> {
    pub placement: &'a PlacementDecision,
    pub styled: &'a StyledAsset,
    pub composite: &'a CompositeResult,
    pub analysis_degraded: bool,
    pub platform: Platform,
}

fn prominence(zone: ZoneType, platform: Platform) -> f64 {
    let base: f64 = match zone {
        ZoneType::Hand => 0.9,
        ZoneType::Screen => 0.75,
        ZoneType::Surface => 0.6,
        ZoneType::Clothing => 0.55,
        ZoneType::Wall => 0.45,
    };
    let platform_fit = match (platform, zone) {
        (p, ZoneType::Hand) if p.is_short_form() => 0.1,
        (p, ZoneType::Wall) if p.is_short_form() => -0.05,
        (Platform::Youtube, ZoneType::Wall | ZoneType::Screen) => 0.05,
        _ => 0.0,
    };
    (base + platform_fit).clamp(0.0, 1.0)
}

/// Score a finished composite. Never fails; scores are clamped to `[0, 1]`.
pub fn evaluate(input: &QualityInput, policy: &QualityPolicy) -> QualityReport {
    let mut notes = Vec::new();
    let composite = input.composite;
    let zone = &input.placement.selected_zone;

    let coverage = composite.coverage();
    let mut realism = policy.confidence_weight * input.placement.confidence.clamp(0.0, 1.0)
        + (1.0 - policy.confidence_weight) * coverage;
    if composite.frames_skipped > 0 {
        notes.push(format!(
            "{} of {} window frames skipped to protect avoid regions",
            composite.frames_skipped, composite.window_frames
        ));
    }
    if !input.styled.styled {
        realism -= policy.unstyled_penalty;
        notes.push(format!(
            "Product was not restyled to scene lighting ({})",
            input
                .styled
                .fallback_reason
                .as_deref()
                .unwrap_or("no reason recorded")
        ));
    }
    if composite.geometry_degraded {
        realism -= policy.geometry_penalty;
        notes.push("Placement geometry degraded".to_string());
    }
    if input.analysis_degraded {
        realism -= policy.degraded_analysis_penalty;
        notes.push("Scene analysis ran on the local fallback detector".to_string());
    }
    let realism = realism.clamp(0.0, 1.0);

    let near_miss_fraction = if composite.frames_composited == 0 {
        0.0
    } else {
        composite.near_misses as f64 / composite.frames_composited as f64
    };
    let mut brand_safety = 1.0 - policy.near_miss_weight * near_miss_fraction;
    if composite.near_misses > 0 {
        notes.push(format!(
            "{} frames came close to a face or brand mark",
            composite.near_misses
        ));
    }
    if zone.zone_type.is_on_person() {
        brand_safety -= policy.on_person_penalty;
    }
    let brand_safety = brand_safety.clamp(0.0, 1.0);

    let screen_time = if composite.total_frames == 0 {
        0.0
    } else {
        composite.frames_composited as f64 / composite.total_frames as f64
    };
    let engagement_potential = (0.4 * prominence(zone.zone_type, input.platform)
        + 0.3 * (screen_time / FULL_SCREEN_TIME).min(1.0)
        + 0.3 * (zone.region.area() / FULL_ZONE_AREA).min(1.0))
    .clamp(0.0, 1.0);

    let recommendation = if realism < policy.reject_realism.max(REALISM_FLOOR)
        || brand_safety < policy.reject_brand_safety
    {
        Recommendation::Reject
    } else if realism < policy.publish_realism
        || brand_safety < policy.publish_brand_safety
        || engagement_potential < policy.publish_engagement
    {
        Recommendation::Revise
    } else {
        Recommendation::Publish
    };

    QualityReport {
        realism,
        brand_safety,
        engagement_potential,
        recommendation,
        notes,
    }
}
