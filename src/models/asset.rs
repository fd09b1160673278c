use serde::{Deserialize, Serialize};

use crate::models::media::MediaRef;
use crate::models::scene::{LightDirection, Lighting};

/// A single appearance adjustment derived from scene lighting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Adjustment {
    /// Positive shifts toward warm (red/yellow), negative toward cool (blue).
    ColorTemperatureShift { amount: f64 },
    /// Multiplier applied to every channel.
    BrightnessScale { factor: f64 },
    /// Darkening gradient toward the side facing away from the light.
    DirectionalShading {
        light_from: LightDirection,
        strength: f64,
    },
}

/// Product image adapted to the target scene.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StyledAsset {
    /// Stored PNG of the (possibly unmodified) asset.
    pub asset_ref: MediaRef,
    pub styled: bool,
    /// Adjustments actually applied; empty when `styled` is false.
    pub adjustments: Vec<Adjustment>,
    /// Lighting descriptor the adjustments were derived from.
    pub source_lighting: Lighting,
    /// Capability that applied the adjustments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    pub width: u32,
    pub height: u32,
}
