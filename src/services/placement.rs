use std::cmp::Ordering;

use crate::config::policy::PlacementPolicy;
use crate::models::placement::{PlacementDecision, ProductCategory};
use crate::models::scene::{SceneAnalysis, SceneDescriptor, Zone};
use crate::services::compatibility::{compatible_zones, is_compatible, rationale};

#[derive(Debug, thiserror::Error)]
pub enum PlacementError {
    #[error("No zone compatible with category '{category}' among {zones_seen} detected zones")]
    NoCompatibleZone {
        category: ProductCategory,
        zones_seen: usize,
    },
}

struct Candidate<'a> {
    zone: &'a Zone,
    descriptor: &'a SceneDescriptor,
    order: usize,
}

/// Pick the zone for a product.
///
/// Candidates are all compatible zones across every descriptor. Highest
/// confidence wins; ties go to the depth nearest mid-ground, then the
/// earliest timestamp, then detection order. No randomness.
pub fn select_placement(
    analysis: &SceneAnalysis,
    category: ProductCategory,
    policy: &PlacementPolicy,
) -> Result<PlacementDecision, PlacementError> {
    let mid = policy.mid_ground_depth;

    let best = analysis
        .descriptors
        .iter()
        .flat_map(|descriptor| descriptor.zones.iter().map(move |zone| (descriptor, zone)))
        .enumerate()
        .filter(|(_, (_, zone))| is_compatible(zone.zone_type, category))
        .map(|(order, (descriptor, zone))| Candidate {
            zone,
            descriptor,
            order,
        })
        .min_by(|a, b| rank(a, b, mid));

    let Some(best) = best else {
        return Err(PlacementError::NoCompatibleZone {
            category,
            zones_seen: analysis.zone_count(),
        });
    };

    tracing::debug!(
        zone = %best.zone.zone_type,
        confidence = best.zone.confidence,
        timestamp = best.descriptor.timestamp,
        allowed = ?compatible_zones(category),
        "Placement selected"
    );

    Ok(PlacementDecision {
        selected_zone: best.zone.clone(),
        anchor_timestamp: best.descriptor.timestamp,
        anchor_frame: best.descriptor.frame_index,
        confidence: best.zone.confidence,
        compatibility_rationale: rationale(best.zone.zone_type, category),
        lighting: best.descriptor.lighting,
    })
}

/// `Less` means `a` is the better candidate.
fn rank(a: &Candidate, b: &Candidate, mid: f64) -> Ordering {
    b.zone
        .confidence
        .total_cmp(&a.zone.confidence)
        .then_with(|| {
            (a.zone.depth_estimate - mid)
                .abs()
                .total_cmp(&(b.zone.depth_estimate - mid).abs())
        })
        .then_with(|| a.descriptor.timestamp.total_cmp(&b.descriptor.timestamp))
        .then_with(|| a.order.cmp(&b.order))
}
