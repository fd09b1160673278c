use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::models::scene::{Lighting, Zone};

/// Declared category of the product being placed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ProductCategory {
    Beverage,
    Phone,
    SmallItem,
    Food,
    Poster,
    Logo,
    Billboard,
    Digital,
    Ad,
    Brand,
}

/// Target platform hint used for engagement scoring.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Platform {
    Tiktok,
    Instagram,
    Youtube,
    Facebook,
    #[default]
    Generic,
}

impl Platform {
    /// Short-form vertical feeds where handheld placements read best.
    pub fn is_short_form(&self) -> bool {
        matches!(self, Platform::Tiktok | Platform::Instagram)
    }
}

/// The chosen zone, anchor time and confidence used for compositing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementDecision {
    pub selected_zone: Zone,
    pub anchor_timestamp: f64,
    pub anchor_frame: usize,
    pub confidence: f64,
    pub compatibility_rationale: String,
    /// Lighting of the anchor frame; drives styling and shadows.
    pub lighting: Lighting,
}
