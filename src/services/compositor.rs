//! Frame-accurate compositing of the styled asset into the source video.
//!
//! Placement geometry is computed once from the selected zone; every frame
//! in the window around the anchor then re-checks the footprint (asset plus
//! shadow) against the avoid regions that apply to it before anything is
//! drawn. Frames outside the window pass through untouched.

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage, RgbaImage};
use std::ops::Range;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::policy::CompositorPolicy;
use crate::models::composite::{CompositeResult, TimeRange};
use crate::models::job::TrimRange;
use crate::models::placement::PlacementDecision;
use crate::models::scene::{LightDirection, Region, SceneAnalysis};
use crate::services::media::{
    CodecError, EditError, FrameEditor, TranscodePlan, VideoCodec, VideoInfo,
};
use crate::services::scene_analyzer::explained_by;
use crate::services::storage::{ScopedWriter, StorageError};
use crate::services::vision::{detect_avoid_regions, HeuristicConfig};

#[derive(Debug, thiserror::Error)]
pub enum CompositeError {
    #[error("Render failed: {0}")]
    Codec(CodecError),

    #[error("Styled asset is unreadable: {0}")]
    Asset(#[from] image::ImageError),

    #[error("Trim range {start:.3}s-{end:.3}s lies outside the {duration:.3}s source")]
    InvalidTrim { start: f64, end: f64, duration: f64 },

    #[error(
        "Trim {trim_start:.3}s-{trim_end:.3}s excludes the placement window around {anchor:.3}s"
    )]
    WindowOutsideTrim {
        anchor: f64,
        trim_start: f64,
        trim_end: f64,
    },

    #[error("Failed to store composited video: {0}")]
    Storage(#[from] StorageError),

    #[error("Compositing cancelled")]
    Cancelled,
}

impl From<CodecError> for CompositeError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Cancelled => CompositeError::Cancelled,
            other => CompositeError::Codec(other),
        }
    }
}

/// Where the asset and its shadow land, in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlacementGeometry {
    pub asset_x: i64,
    pub asset_y: i64,
    pub asset_width: u32,
    pub asset_height: u32,
    pub shadow_center: (f64, f64),
    pub shadow_radii: (f64, f64),
    /// Asset and shadow bounds in normalized frame coordinates.
    pub footprint: Region,
}

/// Fit the asset into the zone and place its shadow.
///
/// The asset keeps its aspect ratio, shrinks with zone depth, is centred
/// horizontally and rests on the bottom edge of the zone. The shadow sits at
/// the base, pushed away from the light.
pub fn compute_geometry(
    frame_width: u32,
    frame_height: u32,
    asset_width: u32,
    asset_height: u32,
    placement: &PlacementDecision,
    policy: &CompositorPolicy,
) -> PlacementGeometry {
    let zone = &placement.selected_zone;
    let (zx0, zy0, zx1, zy1) = zone.region.to_pixels(frame_width, frame_height);
    let zone_w = (zx1 - zx0).max(1) as f64;
    let zone_h = (zy1 - zy0).max(1) as f64;

    let depth_factor = 1.0 - policy.depth_scale * zone.depth_estimate.clamp(0.0, 1.0);
    let fit = (zone_w * depth_factor / asset_width.max(1) as f64)
        .min(zone_h * depth_factor / asset_height.max(1) as f64);
    let width = ((asset_width as f64 * fit).round() as u32).max(1);
    let height = ((asset_height as f64 * fit).round() as u32).max(1);

    let asset_x = zx0 as i64 + ((zone_w - width as f64) / 2.0).round() as i64;
    let asset_y = zy1 as i64 - height as i64;

    let (w, h) = (width as f64, height as f64);
    let offset_x = policy.shadow_offset * w;
    let offset_y = policy.shadow_offset * h;
    let (dx, dy) = match placement.lighting.direction {
        LightDirection::Left => (offset_x, 0.0),
        LightDirection::Right => (-offset_x, 0.0),
        LightDirection::Top => (0.0, offset_y),
        LightDirection::Bottom => (0.0, -offset_y),
        LightDirection::Frontal => (0.0, 0.0),
    };
    let shadow_center = (
        asset_x as f64 + w / 2.0 + dx,
        asset_y as f64 + h * 0.95 + dy,
    );
    let shadow_radii = (w * 0.55, (h * 0.12).max(1.0));

    let fw = frame_width as f64;
    let fh = frame_height as f64;
    let asset_region = Region::new(asset_x as f64 / fw, asset_y as f64 / fh, w / fw, h / fh);
    let shadow_region = Region::new(
        (shadow_center.0 - shadow_radii.0) / fw,
        (shadow_center.1 - shadow_radii.1) / fh,
        2.0 * shadow_radii.0 / fw,
        2.0 * shadow_radii.1 / fh,
    );

    PlacementGeometry {
        asset_x,
        asset_y,
        asset_width: width,
        asset_height: height,
        shadow_center,
        shadow_radii,
        footprint: asset_region.union(&shadow_region),
    }
}

/// Frames eligible for compositing: the window centred on the anchor,
/// always including the anchor frame itself.
pub fn window_frames(info: &VideoInfo, anchor_frame: usize, window_secs: f64) -> Range<usize> {
    if info.frame_count == 0 {
        return 0..0;
    }
    let anchor = anchor_frame.min(info.frame_count - 1);
    let half = (window_secs / 2.0 * info.fps).round() as usize;
    let start = anchor.saturating_sub(half);
    let end = (anchor + half + 1).min(info.frame_count);
    start..end
}

/// Straight-alpha `src` over `dst`, scaled by `opacity`.
fn over(dst: &mut Rgb<u8>, src: [u8; 4], opacity: f64) {
    let alpha = (src[3] as f64 / 255.0) * opacity.clamp(0.0, 1.0);
    if alpha <= 0.0 {
        return;
    }
    for i in 0..3 {
        let blended = src[i] as f64 * alpha + dst[i] as f64 * (1.0 - alpha);
        dst[i] = blended.round().clamp(0.0, 255.0) as u8;
    }
}

fn draw_shadow(frame: &mut RgbImage, geometry: &PlacementGeometry, opacity: f64) {
    let (fw, fh) = frame.dimensions();
    let (cx, cy) = geometry.shadow_center;
    let (rx, ry) = geometry.shadow_radii;
    let x0 = (cx - rx).floor().max(0.0) as u32;
    let y0 = (cy - ry).floor().max(0.0) as u32;
    let x1 = ((cx + rx).ceil().max(0.0) as u32).min(fw);
    let y1 = ((cy + ry).ceil().max(0.0) as u32).min(fh);

    for y in y0..y1 {
        for x in x0..x1 {
            let nx = (x as f64 + 0.5 - cx) / rx;
            let ny = (y as f64 + 0.5 - cy) / ry;
            let d = nx * nx + ny * ny;
            if d >= 1.0 {
                continue;
            }
            let keep = 1.0 - opacity * (1.0 - d);
            let pixel = frame.get_pixel_mut(x, y);
            for c in pixel.0.iter_mut() {
                *c = (*c as f64 * keep).round() as u8;
            }
        }
    }
}

fn draw_asset(frame: &mut RgbImage, asset: &RgbaImage, geometry: &PlacementGeometry, opacity: f64) {
    let (fw, fh) = frame.dimensions();
    for (ax, ay, src) in asset.enumerate_pixels() {
        let x = geometry.asset_x + ax as i64;
        let y = geometry.asset_y + ay as i64;
        if x < 0 || y < 0 || x >= fw as i64 || y >= fh as i64 {
            continue;
        }
        over(frame.get_pixel_mut(x as u32, y as u32), src.0, opacity);
    }
}

/// Per-frame compositing state driven by the codec's transcode loop.
pub struct CompositeEditor<'a> {
    asset: RgbaImage,
    geometry: PlacementGeometry,
    window: Range<usize>,
    keep: Range<usize>,
    fade_frames: usize,
    /// Recorded avoid regions that apply to every frame of the window.
    recorded_avoid: Vec<Region>,
    /// Regions where local skin detections belong to the selected zone.
    on_person: Vec<Region>,
    heuristic: HeuristicConfig,
    policy: &'a CompositorPolicy,
    cancel: &'a CancellationToken,
    progress: &'a (dyn Fn(f64) + Send + Sync),
    pub composited: usize,
    pub skipped: usize,
    pub near_misses: usize,
}

impl CompositeEditor<'_> {
    fn fade(&self, index: usize) -> f64 {
        if self.fade_frames == 0 {
            return 1.0;
        }
        let from_start = index - self.window.start;
        let from_end = self.window.end - 1 - index;
        ((from_start.min(from_end) + 1) as f64 / (self.fade_frames + 1) as f64).min(1.0)
    }

    fn frame_avoid_regions(&self, frame: &RgbImage) -> Vec<Region> {
        let mut regions = self.recorded_avoid.clone();
        regions.extend(
            detect_avoid_regions(frame, &self.heuristic)
                .into_iter()
                .map(|d| d.region)
                .filter(|r| !explained_by(r, &self.on_person)),
        );
        regions
    }
}

impl FrameEditor for CompositeEditor<'_> {
    fn edit(&mut self, index: usize, frame: &mut RgbImage) -> Result<(), EditError> {
        if self.cancel.is_cancelled() {
            return Err(EditError::Cancelled);
        }
        if !self.keep.is_empty() {
            let done = index.saturating_sub(self.keep.start) + 1;
            (self.progress)(done as f64 / self.keep.len() as f64);
        }
        if !self.window.contains(&index) {
            return Ok(());
        }

        let avoid = self.frame_avoid_regions(frame);
        let footprint = self.geometry.footprint;
        if avoid.iter().any(|region| region.intersects(&footprint)) {
            self.skipped += 1;
            return Ok(());
        }
        let margin = footprint.expand(self.policy.near_miss_margin);
        if avoid.iter().any(|region| region.intersects(&margin)) {
            self.near_misses += 1;
        }

        let opacity = self.fade(index);
        draw_shadow(frame, &self.geometry, self.policy.shadow_opacity * opacity);
        draw_asset(frame, &self.asset, &self.geometry, opacity);
        self.composited += 1;
        Ok(())
    }
}

/// Inputs of one compositing run.
pub struct CompositeInput<'a> {
    pub source: &'a [u8],
    pub asset_png: &'a [u8],
    pub placement: &'a PlacementDecision,
    pub analysis: &'a SceneAnalysis,
    pub trim: Option<TrimRange>,
    pub output: &'a ScopedWriter,
}

pub struct Compositor {
    codec: Arc<dyn VideoCodec>,
    policy: CompositorPolicy,
    heuristic: HeuristicConfig,
}

impl Compositor {
    pub fn new(codec: Arc<dyn VideoCodec>, policy: CompositorPolicy) -> Self {
        Self {
            codec,
            policy,
            heuristic: HeuristicConfig::default(),
        }
    }

    pub async fn composite(
        &self,
        input: CompositeInput<'_>,
        cancel: &CancellationToken,
        progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<CompositeResult, CompositeError> {
        let info = self.codec.inspect(input.source).await?;
        let plan = transcode_plan(&info, input.trim)?;

        let asset = image::load_from_memory(input.asset_png)?.to_rgba8();
        let geometry = compute_geometry(
            info.width,
            info.height,
            asset.width(),
            asset.height(),
            input.placement,
            &self.policy,
        );
        let asset = imageops::resize(
            &asset,
            geometry.asset_width,
            geometry.asset_height,
            FilterType::Triangle,
        );

        let window = window_frames(&info, input.placement.anchor_frame, self.policy.window_secs);
        let rendered_window = window.start.max(plan.keep_frames.start)
            ..window.end.min(plan.keep_frames.end).max(window.start.max(plan.keep_frames.start));
        if rendered_window.is_empty() {
            let trim = input.trim.unwrap_or(TrimRange {
                start: 0.0,
                end: info.duration,
            });
            return Err(CompositeError::WindowOutsideTrim {
                anchor: input.placement.anchor_timestamp,
                trim_start: trim.start,
                trim_end: trim.end,
            });
        }

        // Avoid regions recorded for any frame the window touches, plus the
        // descriptor nearest the anchor.
        let mut recorded_avoid: Vec<Region> = input
            .analysis
            .descriptors
            .iter()
            .filter(|d| window.contains(&d.frame_index))
            .flat_map(|d| d.avoid_regions.iter().map(|a| a.region))
            .collect();
        if let Some(nearest) = input.analysis.nearest_descriptor(input.placement.anchor_timestamp) {
            recorded_avoid.extend(nearest.avoid_regions.iter().map(|a| a.region));
        }

        let zone = &input.placement.selected_zone;
        let on_person = if zone.zone_type.is_on_person() {
            vec![zone.region]
        } else {
            Vec::new()
        };

        let mut editor = CompositeEditor {
            asset,
            geometry,
            window: rendered_window.clone(),
            keep: plan.keep_frames.clone(),
            fade_frames: (self.policy.fade_secs * info.fps).round() as usize,
            recorded_avoid,
            on_person,
            heuristic: self.heuristic.clone(),
            policy: &self.policy,
            cancel,
            progress,
            composited: 0,
            skipped: 0,
            near_misses: 0,
        };

        tracing::debug!(
            window_start = rendered_window.start,
            window_end = rendered_window.end,
            kept_frames = plan.keep_frames.len(),
            "Transcoding with composite editor"
        );

        let encoded = self
            .codec
            .transcode(input.source, &info, &plan, &mut editor)
            .await?;

        if cancel.is_cancelled() {
            return Err(CompositeError::Cancelled);
        }
        let output_video = input
            .output
            .put(&encoded, self.codec.output_content_type())
            .await?;

        let window_frames = rendered_window.len();
        let mut result = CompositeResult {
            output_video,
            modified_range: TimeRange {
                start: info.timestamp(rendered_window.start),
                end: info.timestamp(rendered_window.end),
            },
            total_frames: plan.keep_frames.len(),
            window_frames,
            frames_composited: editor.composited,
            frames_skipped: editor.skipped,
            near_misses: editor.near_misses,
            output_duration: plan.keep_frames.len() as f64 / info.fps,
            audio_preserved: info.has_audio,
            trimmed: input.trim.is_some(),
            geometry_degraded: false,
        };
        result.geometry_degraded = result.skipped_fraction() > self.policy.geometry_skip_threshold;
        Ok(result)
    }
}

/// Frames and audio span kept for an optional trim.
pub fn transcode_plan(
    info: &VideoInfo,
    trim: Option<TrimRange>,
) -> Result<TranscodePlan, CompositeError> {
    let Some(trim) = trim else {
        return Ok(TranscodePlan::full(info));
    };
    let start = (trim.start.max(0.0) * info.fps).round() as usize;
    let end = ((trim.end.min(info.duration) * info.fps).round() as usize).min(info.frame_count);
    if start >= end {
        return Err(CompositeError::InvalidTrim {
            start: trim.start,
            end: trim.end,
            duration: info.duration,
        });
    }
    Ok(TranscodePlan {
        keep_frames: start..end,
        audio_window: Some(TimeRange {
            start: info.timestamp(start),
            end: info.timestamp(end),
        }),
    })
}
