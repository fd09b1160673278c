use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Axis-aligned rectangle in normalized frame coordinates (0.0 - 1.0).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Region {
    /// Build a region, clipping it to the unit square.
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        let x0 = x.clamp(0.0, 1.0);
        let y0 = y.clamp(0.0, 1.0);
        let x1 = (x + width).clamp(0.0, 1.0);
        let y1 = (y + height).clamp(0.0, 1.0);
        Self {
            x: x0,
            y: y0,
            width: (x1 - x0).max(0.0),
            height: (y1 - y0).max(0.0),
        }
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    pub fn area(&self) -> f64 {
        self.width * self.height
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }

    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Overlap of two regions, if they share a non-zero area.
    pub fn intersection(&self, other: &Region) -> Option<Region> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x1 > x0 && y1 > y0 {
            Some(Region {
                x: x0,
                y: y0,
                width: x1 - x0,
                height: y1 - y0,
            })
        } else {
            None
        }
    }

    pub fn intersects(&self, other: &Region) -> bool {
        self.intersection(other).is_some()
    }

    /// Share of this region's area that lies inside `other`.
    pub fn overlap_fraction(&self, other: &Region) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        self.intersection(other)
            .map(|overlap| overlap.area() / self.area())
            .unwrap_or(0.0)
    }

    /// Smallest region containing both.
    pub fn union(&self, other: &Region) -> Region {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let x0 = self.x.min(other.x);
        let y0 = self.y.min(other.y);
        let x1 = self.right().max(other.right());
        let y1 = self.bottom().max(other.bottom());
        Region::new(x0, y0, x1 - x0, y1 - y0)
    }

    /// Grow on every side by `margin`, clipped to the frame.
    pub fn expand(&self, margin: f64) -> Region {
        Region::new(
            self.x - margin,
            self.y - margin,
            self.width + 2.0 * margin,
            self.height + 2.0 * margin,
        )
    }

    /// Pixel bounds `(x0, y0, x1, y1)` with exclusive right/bottom edges.
    ///
    /// The outer edges are rounded outward so that a region which touches a
    /// pixel always covers it.
    pub fn to_pixels(&self, frame_width: u32, frame_height: u32) -> (u32, u32, u32, u32) {
        let fw = frame_width as f64;
        let fh = frame_height as f64;
        let x0 = (self.x * fw).floor().clamp(0.0, fw) as u32;
        let y0 = (self.y * fh).floor().clamp(0.0, fh) as u32;
        let x1 = (self.right() * fw).ceil().clamp(0.0, fw) as u32;
        let y1 = (self.bottom() * fh).ceil().clamp(0.0, fh) as u32;
        (x0, y0, x1.max(x0), y1.max(y0))
    }
}

/// Kind of insertion zone. Closed set, matched exhaustively by the
/// compatibility table.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ZoneType {
    Hand,
    Surface,
    Wall,
    Screen,
    Clothing,
}

impl ZoneType {
    pub const ALL: [ZoneType; 5] = [
        ZoneType::Hand,
        ZoneType::Surface,
        ZoneType::Wall,
        ZoneType::Screen,
        ZoneType::Clothing,
    ];

    /// Zones that sit on a person.
    pub fn is_on_person(&self) -> bool {
        matches!(self, ZoneType::Hand | ZoneType::Clothing)
    }
}

/// A candidate region where inserted content could plausibly belong.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    #[serde(rename = "type")]
    pub zone_type: ZoneType,
    pub region: Region,
    /// 0.0 = extreme foreground, 1.0 = far background.
    pub depth_estimate: f64,
    pub confidence: f64,
    pub rationale: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AvoidKind {
    Face,
    BrandMark,
    /// Detection that could not be ruled out as a face or mark.
    Ambiguous,
}

/// A region compositing must never cover.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvoidRegion {
    pub kind: AvoidKind,
    pub region: Region,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LightDirection {
    Left,
    Right,
    Top,
    Bottom,
    Frontal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ColorTemperature {
    Warm,
    Neutral,
    Cool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Lighting {
    pub direction: LightDirection,
    /// Mean scene luminance, 0.0 - 1.0.
    pub intensity: f64,
    pub color_temperature: ColorTemperature,
}

impl Default for Lighting {
    fn default() -> Self {
        Self {
            direction: LightDirection::Frontal,
            intensity: 0.5,
            color_temperature: ColorTemperature::Neutral,
        }
    }
}

/// Per analysed frame scene description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneDescriptor {
    pub frame_index: usize,
    /// Seconds from the start of the source.
    pub timestamp: f64,
    pub lighting: Lighting,
    pub zones: Vec<Zone>,
    pub avoid_regions: Vec<AvoidRegion>,
}

/// Output of the scene analysis stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneAnalysis {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub frame_count: usize,
    pub duration: f64,
    pub descriptors: Vec<SceneDescriptor>,
    /// Name of the detector that produced the zones.
    pub detector: String,
    /// True when the configured vision capability was unavailable and the
    /// local detector was used instead.
    pub degraded: bool,
}

impl SceneAnalysis {
    /// Descriptor whose timestamp is closest to `timestamp`.
    pub fn nearest_descriptor(&self, timestamp: f64) -> Option<&SceneDescriptor> {
        self.descriptors.iter().min_by(|a, b| {
            (a.timestamp - timestamp)
                .abs()
                .total_cmp(&(b.timestamp - timestamp).abs())
        })
    }

    pub fn zone_count(&self) -> usize {
        self.descriptors.iter().map(|d| d.zones.len()).sum()
    }
}
