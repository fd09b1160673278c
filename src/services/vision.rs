//! Zone and avoid-region detection.
//!
//! Two detectors implement [`ZoneDetector`]:
//! - [`HeuristicDetector`]: deterministic, local, grid statistics over the
//!   frame. Finds flat low-texture areas (surfaces below the horizon, walls
//!   above it) and skin-tone blobs, which always become avoid regions.
//! - [`VisionClient`]: remote detection service over HTTP.

use async_trait::async_trait;
use base64::Engine;
use image::{DynamicImage, ImageFormat, RgbImage};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::Cursor;

use crate::models::scene::{Region, ZoneType};
use crate::services::capability::CapabilityError;

/// What a detection is believed to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionLabel {
    Hand,
    Surface,
    Wall,
    Screen,
    Clothing,
    Face,
    BrandMark,
    /// Could not be classified; treated as a region to avoid.
    Unclassified,
}

impl DetectionLabel {
    pub fn zone_type(&self) -> Option<ZoneType> {
        match self {
            DetectionLabel::Hand => Some(ZoneType::Hand),
            DetectionLabel::Surface => Some(ZoneType::Surface),
            DetectionLabel::Wall => Some(ZoneType::Wall),
            DetectionLabel::Screen => Some(ZoneType::Screen),
            DetectionLabel::Clothing => Some(ZoneType::Clothing),
            DetectionLabel::Face | DetectionLabel::BrandMark | DetectionLabel::Unclassified => {
                None
            }
        }
    }
}

/// A raw detector output, before the analyzer's avoid/zone policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: DetectionLabel,
    pub region: Region,
    pub confidence: f64,
    #[serde(default)]
    pub depth: Option<f64>,
    #[serde(default)]
    pub rationale: Option<String>,
}

#[async_trait]
pub trait ZoneDetector: Send + Sync {
    fn name(&self) -> &str;

    async fn detect(&self, frame: &RgbImage) -> Result<Vec<Detection>, CapabilityError>;
}

#[derive(Debug, Clone)]
pub struct HeuristicConfig {
    pub grid_cols: u32,
    pub grid_rows: u32,
    /// Maximum luma standard deviation for a cell to count as flat.
    pub uniform_std: f64,
    /// Share of skin-tone pixels that marks a cell as skin.
    pub skin_cell_ratio: f64,
    pub min_zone_cells: usize,
    /// Blobs at least this large with face-like proportions are faces;
    /// everything else skin-toned is unclassified.
    pub min_face_cells: usize,
    /// First grid row (as a fraction of height) considered for surfaces.
    pub horizon: f64,
}

impl Default for HeuristicConfig {
    fn default() -> Self {
        Self {
            grid_cols: 32,
            grid_rows: 18,
            uniform_std: 0.06,
            skin_cell_ratio: 0.35,
            min_zone_cells: 6,
            min_face_cells: 2,
            horizon: 0.55,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct CellStats {
    luma_mean: f64,
    luma_std: f64,
    skin_ratio: f64,
}

/// Kovac RGB skin rule.
fn is_skin(r: u8, g: u8, b: u8) -> bool {
    let (ri, gi, bi) = (r as i32, g as i32, b as i32);
    let max = ri.max(gi).max(bi);
    let min = ri.min(gi).min(bi);
    ri > 95 && gi > 40 && bi > 20 && max - min > 15 && (ri - gi).abs() > 15 && ri > gi && ri > bi
}

fn luma(r: u8, g: u8, b: u8) -> f64 {
    (0.2126 * r as f64 + 0.7152 * g as f64 + 0.0722 * b as f64) / 255.0
}

fn grid_stats(frame: &RgbImage, cols: u32, rows: u32) -> Vec<Vec<CellStats>> {
    let (w, h) = frame.dimensions();
    let mut grid = vec![vec![CellStats::default(); cols as usize]; rows as usize];
    if w == 0 || h == 0 {
        return grid;
    }

    for (row, cells) in grid.iter_mut().enumerate() {
        let y0 = row as u32 * h / rows;
        let y1 = ((row as u32 + 1) * h / rows).max(y0 + 1).min(h);
        for (col, cell) in cells.iter_mut().enumerate() {
            let x0 = col as u32 * w / cols;
            let x1 = ((col as u32 + 1) * w / cols).max(x0 + 1).min(w);
            let step = ((x1 - x0).max(y1 - y0) / 8).max(1);

            let (mut n, mut sum, mut sum_sq, mut skin) = (0.0, 0.0, 0.0, 0.0);
            let mut y = y0;
            while y < y1 {
                let mut x = x0;
                while x < x1 {
                    let p = frame.get_pixel(x, y);
                    let l = luma(p[0], p[1], p[2]);
                    sum += l;
                    sum_sq += l * l;
                    if is_skin(p[0], p[1], p[2]) {
                        skin += 1.0;
                    }
                    n += 1.0;
                    x += step;
                }
                y += step;
            }

            if n > 0.0 {
                let mean = sum / n;
                *cell = CellStats {
                    luma_mean: mean,
                    luma_std: (sum_sq / n - mean * mean).max(0.0).sqrt(),
                    skin_ratio: skin / n,
                };
            }
        }
    }
    grid
}

/// Cell rectangle `(top, left, bottom, right)` with exclusive bottom/right.
type CellRect = (usize, usize, usize, usize);

/// Largest all-true rectangle in a boolean grid (histogram stack method).
/// Ties resolve to the first rectangle found scanning top-down, left-right.
fn largest_rectangle(mask: &[Vec<bool>]) -> Option<CellRect> {
    let cols = mask.first().map(Vec::len)?;
    let mut heights = vec![0usize; cols];
    let mut best: Option<(usize, CellRect)> = None;

    for (row, line) in mask.iter().enumerate() {
        for (c, &filled) in line.iter().enumerate() {
            heights[c] = if filled { heights[c] + 1 } else { 0 };
        }

        let mut stack: Vec<usize> = Vec::new();
        for c in 0..=cols {
            let current = if c < cols { heights[c] } else { 0 };
            while let Some(&top) = stack.last() {
                if heights[top] <= current {
                    break;
                }
                stack.pop();
                let height = heights[top];
                let left = stack.last().map(|&s| s + 1).unwrap_or(0);
                let area = height * (c - left);
                if area > 0 && best.map(|(a, _)| area > a).unwrap_or(true) {
                    best = Some((area, (row + 1 - height, left, row + 1, c)));
                }
            }
            stack.push(c);
        }
    }
    best.map(|(_, rect)| rect)
}

fn cell_rect_to_region(rect: CellRect, cols: usize, rows: usize) -> Region {
    let (top, left, bottom, right) = rect;
    Region::new(
        left as f64 / cols as f64,
        top as f64 / rows as f64,
        (right - left) as f64 / cols as f64,
        (bottom - top) as f64 / rows as f64,
    )
}

/// Skin-toned blobs as avoid detections (faces or unclassified).
///
/// Pure and synchronous so the compositor can re-check every rendered frame.
pub fn detect_avoid_regions(frame: &RgbImage, config: &HeuristicConfig) -> Vec<Detection> {
    let grid = grid_stats(frame, config.grid_cols, config.grid_rows);
    skin_blobs(&grid, config)
}

fn skin_blobs(grid: &[Vec<CellStats>], config: &HeuristicConfig) -> Vec<Detection> {
    let rows = grid.len();
    let cols = grid.first().map(Vec::len).unwrap_or(0);
    let mut seen = vec![vec![false; cols]; rows];
    let mut detections = Vec::new();

    for r in 0..rows {
        for c in 0..cols {
            if seen[r][c] || grid[r][c].skin_ratio < config.skin_cell_ratio {
                continue;
            }
            // Flood fill one 4-connected blob.
            let mut queue = VecDeque::from([(r, c)]);
            seen[r][c] = true;
            let (mut top, mut left, mut bottom, mut right) = (r, c, r, c);
            let (mut cells, mut skin_sum) = (0usize, 0.0);
            while let Some((y, x)) = queue.pop_front() {
                cells += 1;
                skin_sum += grid[y][x].skin_ratio;
                top = top.min(y);
                bottom = bottom.max(y);
                left = left.min(x);
                right = right.max(x);
                let neighbours = [
                    (y.wrapping_sub(1), x),
                    (y + 1, x),
                    (y, x.wrapping_sub(1)),
                    (y, x + 1),
                ];
                for (ny, nx) in neighbours {
                    if ny < rows
                        && nx < cols
                        && !seen[ny][nx]
                        && grid[ny][nx].skin_ratio >= config.skin_cell_ratio
                    {
                        seen[ny][nx] = true;
                        queue.push_back((ny, nx));
                    }
                }
            }

            let blob_w = right + 1 - left;
            let blob_h = bottom + 1 - top;
            let aspect = blob_h as f64 / blob_w as f64;
            let face_like = cells >= config.min_face_cells && (0.6..=2.5).contains(&aspect);
            let confidence = (skin_sum / cells as f64).clamp(0.0, 1.0);
            // Pad by half a cell: cell edges rarely line up with the skin edge.
            let region = cell_rect_to_region((top, left, bottom + 1, right + 1), cols, rows)
                .expand(0.5 / cols.max(rows) as f64);

            detections.push(Detection {
                label: if face_like {
                    DetectionLabel::Face
                } else {
                    DetectionLabel::Unclassified
                },
                region,
                confidence,
                depth: None,
                rationale: Some(format!("{} skin-tone cells", cells)),
            });
        }
    }
    detections
}

/// Deterministic local detector.
#[derive(Debug, Clone, Default)]
pub struct HeuristicDetector {
    config: HeuristicConfig,
}

impl HeuristicDetector {
    pub fn new(config: HeuristicConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HeuristicConfig {
        &self.config
    }

    pub fn detect_frame(&self, frame: &RgbImage) -> Vec<Detection> {
        let cfg = &self.config;
        let grid = grid_stats(frame, cfg.grid_cols, cfg.grid_rows);
        let rows = grid.len();
        let cols = grid.first().map(Vec::len).unwrap_or(0);
        if rows == 0 || cols == 0 {
            return Vec::new();
        }

        let mut detections = skin_blobs(&grid, cfg);

        let horizon_row = ((rows as f64) * cfg.horizon).round() as usize;
        let wall_limit = rows / 2;
        let flat = |r: usize, c: usize| {
            let cell = &grid[r][c];
            cell.luma_std <= cfg.uniform_std && cell.skin_ratio < cfg.skin_cell_ratio / 3.0
        };

        let bands = [
            (DetectionLabel::Surface, horizon_row, rows),
            (DetectionLabel::Wall, 0, wall_limit),
        ];
        for (label, start, end) in bands {
            if start >= end {
                continue;
            }
            let mask: Vec<Vec<bool>> = (0..rows)
                .map(|r| (0..cols).map(|c| r >= start && r < end && flat(r, c)).collect())
                .collect();
            let Some(rect) = largest_rectangle(&mask) else {
                continue;
            };
            let (top, left, bottom, right) = rect;
            let cells = (bottom - top) * (right - left);
            if cells < cfg.min_zone_cells {
                continue;
            }

            let band_cells = ((end - start) * cols) as f64;
            let fill = (cells as f64 / band_cells).min(1.0);
            let mean_std = (top..bottom)
                .flat_map(|r| (left..right).map(move |c| (r, c)))
                .map(|(r, c)| grid[r][c].luma_std)
                .sum::<f64>()
                / cells as f64;
            let flatness = 1.0 - (mean_std / cfg.uniform_std).min(1.0);
            let confidence = (0.35 + 0.4 * fill + 0.2 * flatness).clamp(0.0, 0.95);

            let region = cell_rect_to_region(rect, cols, rows);
            let (_, center_y) = region.center();
            let depth = match label {
                DetectionLabel::Surface => ((1.0 - center_y) / 0.5).clamp(0.0, 1.0),
                _ => 0.8,
            };

            detections.push(Detection {
                label,
                region,
                confidence,
                depth: Some(depth),
                rationale: Some(format!(
                    "Flat low-texture area of {}x{} cells ({:.0}% of band)",
                    right - left,
                    bottom - top,
                    fill * 100.0
                )),
            });
        }
        detections
    }
}

#[async_trait]
impl ZoneDetector for HeuristicDetector {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn detect(&self, frame: &RgbImage) -> Result<Vec<Detection>, CapabilityError> {
        Ok(self.detect_frame(frame))
    }
}

/// Client for a remote detection service.
pub struct VisionClient {
    http: Client,
    base_url: String,
    api_token: Option<String>,
}

#[derive(Serialize)]
struct DetectRequest<'a> {
    image: String,
    width: u32,
    height: u32,
    labels: &'a [DetectionLabel],
}

#[derive(Deserialize)]
struct DetectResponse {
    detections: Vec<Detection>,
}

const REQUESTED_LABELS: &[DetectionLabel] = &[
    DetectionLabel::Hand,
    DetectionLabel::Surface,
    DetectionLabel::Wall,
    DetectionLabel::Screen,
    DetectionLabel::Clothing,
    DetectionLabel::Face,
    DetectionLabel::BrandMark,
];

impl VisionClient {
    pub fn new(base_url: impl Into<String>, api_token: Option<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token,
        }
    }
}

pub(crate) fn encode_png(image: DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, ImageFormat::Png)?;
    Ok(buf.into_inner())
}

#[async_trait]
impl ZoneDetector for VisionClient {
    fn name(&self) -> &str {
        "vision-service"
    }

    async fn detect(&self, frame: &RgbImage) -> Result<Vec<Detection>, CapabilityError> {
        let png = encode_png(DynamicImage::ImageRgb8(frame.clone()))
            .map_err(|e| CapabilityError::transient(self.name(), e.to_string()))?;

        let body = DetectRequest {
            image: base64::engine::general_purpose::STANDARD.encode(png),
            width: frame.width(),
            height: frame.height(),
            labels: REQUESTED_LABELS,
        };

        let mut request = self.http.post(format!("{}/v1/detect", self.base_url));
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .json(&body)
            .send()
            .await
            .map_err(|e| CapabilityError::from_http(self.name(), &e))?
            .error_for_status()
            .map_err(|e| CapabilityError::from_http(self.name(), &e))?;

        let parsed: DetectResponse = response
            .json()
            .await
            .map_err(|e| CapabilityError::transient(self.name(), e.to_string()))?;
        Ok(parsed.detections)
    }
}
