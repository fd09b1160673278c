use futures::stream::{self, StreamExt};
use image::RgbImage;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::policy::AnalyzerPolicy;
use crate::models::scene::{
    AvoidKind, AvoidRegion, ColorTemperature, LightDirection, Lighting, Region, SceneAnalysis,
    SceneDescriptor, Zone,
};
use crate::services::capability::{call_with_timeout, CapabilityError};
use crate::services::media::{CodecError, VideoCodec, VideoInfo};
use crate::services::vision::{
    detect_avoid_regions, Detection, DetectionLabel, HeuristicDetector, ZoneDetector,
};

#[derive(Debug, thiserror::Error)]
pub enum AnalyzerError {
    #[error("Source video is not decodable: {0}")]
    Undecodable(String),

    #[error("Frame extraction failed: {0}")]
    Codec(CodecError),

    #[error("Zone detection failed: {0}")]
    Capability(#[from] CapabilityError),

    #[error("Analysis cancelled")]
    Cancelled,
}

/// Evenly spaced sample positions over `frame_count` frames.
///
/// `requested` is clamped to `[1, frame_count]`; each index sits at the
/// middle of its slice of the stream.
pub fn sample_indices(frame_count: usize, requested: usize) -> Vec<usize> {
    if frame_count == 0 {
        return Vec::new();
    }
    let k = requested.clamp(1, frame_count);
    (0..k)
        .map(|i| {
            let pos = (i as f64 + 0.5) * frame_count as f64 / k as f64;
            (pos.floor() as usize).min(frame_count - 1)
        })
        .collect()
}

/// Estimate scene lighting from a frame.
///
/// Intensity is mean luma; colour temperature compares the red and blue
/// channel means; direction follows the strongest half-frame brightness
/// gradient, or is frontal when the frame is evenly lit.
pub fn estimate_lighting(frame: &RgbImage) -> Lighting {
    let (w, h) = frame.dimensions();
    if w == 0 || h == 0 {
        return Lighting::default();
    }
    let step = (w.max(h) / 256).max(1);

    let (mut n, mut luma_sum, mut r_sum, mut b_sum) = (0.0, 0.0, 0.0, 0.0);
    // (luma sum, samples) per half of the frame.
    let mut left = (0.0, 0.0);
    let mut right = (0.0, 0.0);
    let mut top = (0.0, 0.0);
    let mut bottom = (0.0, 0.0);

    for y in (0..h).step_by(step as usize) {
        for x in (0..w).step_by(step as usize) {
            let p = frame.get_pixel(x, y);
            let l =
                (0.2126 * p[0] as f64 + 0.7152 * p[1] as f64 + 0.0722 * p[2] as f64) / 255.0;
            n += 1.0;
            luma_sum += l;
            r_sum += p[0] as f64;
            b_sum += p[2] as f64;

            let horizontal = if x < w / 2 { &mut left } else { &mut right };
            horizontal.0 += l;
            horizontal.1 += 1.0;
            let vertical = if y < h / 2 { &mut top } else { &mut bottom };
            vertical.0 += l;
            vertical.1 += 1.0;
        }
    }

    let mean = |(sum, count): (f64, f64)| if count > 0.0 { sum / count } else { 0.0 };
    let intensity = (luma_sum / n).clamp(0.0, 1.0);

    let warmth = (r_sum - b_sum) / (n * 255.0);
    let color_temperature = if warmth > 0.06 {
        ColorTemperature::Warm
    } else if warmth < -0.06 {
        ColorTemperature::Cool
    } else {
        ColorTemperature::Neutral
    };

    let dx = mean(right) - mean(left);
    let dy = mean(bottom) - mean(top);
    let direction = if dx.abs().max(dy.abs()) < 0.05 {
        LightDirection::Frontal
    } else if dx.abs() >= dy.abs() {
        if dx < 0.0 {
            LightDirection::Left
        } else {
            LightDirection::Right
        }
    } else if dy < 0.0 {
        LightDirection::Top
    } else {
        LightDirection::Bottom
    };

    Lighting {
        direction,
        intensity,
        color_temperature,
    }
}

/// Split raw detections into zones and avoid regions.
///
/// Every face, brand mark and unclassified detection becomes an avoid region.
/// Faces and brand marks under the avoid floor are kept as ambiguous. Zones
/// under the confidence floor or touching any avoid region are dropped.
pub fn classify_detections(
    detections: Vec<Detection>,
    policy: &AnalyzerPolicy,
) -> (Vec<Zone>, Vec<AvoidRegion>) {
    let mut avoid = Vec::new();
    let mut candidates = Vec::new();

    for detection in detections {
        let confidence = detection.confidence.clamp(0.0, 1.0);
        let kind = match detection.label {
            DetectionLabel::Face if confidence >= policy.avoid_floor => Some(AvoidKind::Face),
            DetectionLabel::BrandMark if confidence >= policy.avoid_floor => {
                Some(AvoidKind::BrandMark)
            }
            DetectionLabel::Face | DetectionLabel::BrandMark | DetectionLabel::Unclassified => {
                Some(AvoidKind::Ambiguous)
            }
            _ => None,
        };
        if let Some(kind) = kind {
            avoid.push(AvoidRegion {
                kind,
                region: detection.region,
                confidence,
            });
            continue;
        }

        let Some(zone_type) = detection.label.zone_type() else {
            continue;
        };
        if confidence < policy.min_zone_confidence || detection.region.is_empty() {
            continue;
        }
        let depth_estimate = detection
            .depth
            .unwrap_or_else(|| 1.0 - detection.region.center().1)
            .clamp(0.0, 1.0);
        candidates.push(Zone {
            zone_type,
            region: detection.region,
            depth_estimate,
            confidence,
            rationale: detection
                .rationale
                .unwrap_or_else(|| format!("Detected {}", zone_type)),
        });
    }

    let zones = candidates
        .into_iter()
        .filter(|zone| !avoid.iter().any(|a| a.region.intersects(&zone.region)))
        .collect();
    (zones, avoid)
}

pub struct SceneAnalyzer {
    codec: Arc<dyn VideoCodec>,
    detector: Arc<dyn ZoneDetector>,
    fallback: HeuristicDetector,
    policy: AnalyzerPolicy,
    capability_timeout: Duration,
}

impl SceneAnalyzer {
    pub fn new(
        codec: Arc<dyn VideoCodec>,
        detector: Arc<dyn ZoneDetector>,
        policy: AnalyzerPolicy,
        capability_timeout: Duration,
    ) -> Self {
        Self {
            codec,
            detector,
            fallback: HeuristicDetector::default(),
            policy,
            capability_timeout,
        }
    }

    /// Inspect the source, sample frames and describe each of them.
    ///
    /// Every sampled frame is fully described before this returns.
    pub async fn analyze(
        &self,
        source: &[u8],
        cancel: &CancellationToken,
    ) -> Result<SceneAnalysis, AnalyzerError> {
        let info = self.codec.inspect(source).await.map_err(undecodable)?;
        let indices = sample_indices(info.frame_count, self.policy.sample_count);

        let frames = self
            .codec
            .extract_frames(source, &info, &indices)
            .await
            .map_err(undecodable)?;
        if cancel.is_cancelled() {
            return Err(AnalyzerError::Cancelled);
        }

        tracing::debug!(
            frames = frames.len(),
            detector = self.detector.name(),
            "Describing sampled frames"
        );

        let pending: Vec<_> = indices
            .iter()
            .copied()
            .zip(frames.iter())
            .map(|(index, frame)| self.describe_frame(&info, index, frame, cancel))
            .collect();
        let described: Vec<Result<(SceneDescriptor, bool), AnalyzerError>> =
            stream::iter(pending)
                .buffered(self.policy.max_concurrency.max(1))
                .collect()
                .await;

        let mut descriptors = Vec::with_capacity(described.len());
        let mut degraded = false;
        for result in described {
            let (descriptor, fell_back) = result?;
            degraded |= fell_back;
            descriptors.push(descriptor);
        }

        Ok(SceneAnalysis {
            width: info.width,
            height: info.height,
            fps: info.fps,
            frame_count: info.frame_count,
            duration: info.duration,
            descriptors,
            detector: if degraded {
                format!("{} (fallback: {})", self.detector.name(), self.fallback.name())
            } else {
                self.detector.name().to_string()
            },
            degraded,
        })
    }

    async fn describe_frame(
        &self,
        info: &VideoInfo,
        index: usize,
        frame: &RgbImage,
        cancel: &CancellationToken,
    ) -> Result<(SceneDescriptor, bool), AnalyzerError> {
        if cancel.is_cancelled() {
            return Err(AnalyzerError::Cancelled);
        }

        let name = self.detector.name().to_string();
        let detected =
            call_with_timeout(&name, self.capability_timeout, self.detector.detect(frame)).await;

        let (mut detections, degraded) = match detected {
            Ok(detections) => (detections, false),
            Err(e) if e.is_unavailable() => {
                tracing::warn!(
                    frame = index,
                    error = %e,
                    "Vision capability unavailable, using local detector"
                );
                (self.fallback.detect_frame(frame), true)
            }
            Err(e) => return Err(e.into()),
        };

        // Remote detectors can miss faces; the local skin check is additive.
        // Skin inside a reported hand or clothing zone belongs to that zone.
        if !degraded && name != self.fallback.name() {
            let on_person: Vec<_> = detections
                .iter()
                .filter(|d| d.label.zone_type().is_some_and(|z| z.is_on_person()))
                .map(|d| d.region)
                .collect();
            let local = detect_avoid_regions(frame, self.fallback.config())
                .into_iter()
                .filter(|blob| !explained_by(&blob.region, &on_person));
            detections.extend(local);
        }

        let (zones, avoid_regions) = classify_detections(detections, &self.policy);
        Ok((
            SceneDescriptor {
                frame_index: index,
                timestamp: info.timestamp(index),
                lighting: estimate_lighting(frame),
                zones,
                avoid_regions,
            },
            degraded,
        ))
    }
}

/// A local skin blob lying mostly inside an on-person zone is that zone.
pub fn explained_by(blob: &Region, on_person: &[Region]) -> bool {
    on_person
        .iter()
        .any(|zone| blob.overlap_fraction(zone) >= 0.5)
}

fn undecodable(e: CodecError) -> AnalyzerError {
    match e {
        CodecError::Inspect(msg) | CodecError::Decode(msg) => AnalyzerError::Undecodable(msg),
        CodecError::Json(e) => AnalyzerError::Undecodable(e.to_string()),
        other => AnalyzerError::Codec(other),
    }
}
