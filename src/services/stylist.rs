use async_trait::async_trait;
use base64::Engine;
use image::{DynamicImage, RgbaImage};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::models::asset::{Adjustment, StyledAsset};
use crate::models::scene::{ColorTemperature, LightDirection, Lighting};
use crate::services::capability::{call_with_timeout, CapabilityError};
use crate::services::storage::{ScopedWriter, StorageError};
use crate::services::vision::encode_png;

const TEMPERATURE_SHIFT: f64 = 0.12;
const SHADING_STRENGTH: f64 = 0.25;

/// Derive the adjustments that match a product to scene lighting.
///
/// Deterministic: the same lighting always yields the same plan.
pub fn plan_adjustments(lighting: &Lighting) -> Vec<Adjustment> {
    let mut plan = Vec::new();

    match lighting.color_temperature {
        ColorTemperature::Warm => plan.push(Adjustment::ColorTemperatureShift {
            amount: TEMPERATURE_SHIFT,
        }),
        ColorTemperature::Cool => plan.push(Adjustment::ColorTemperatureShift {
            amount: -TEMPERATURE_SHIFT,
        }),
        ColorTemperature::Neutral => {}
    }

    let factor = (0.7 + 0.6 * lighting.intensity).clamp(0.6, 1.3);
    if (factor - 1.0).abs() > 0.02 {
        plan.push(Adjustment::BrightnessScale { factor });
    }

    if lighting.direction != LightDirection::Frontal {
        plan.push(Adjustment::DirectionalShading {
            light_from: lighting.direction,
            strength: SHADING_STRENGTH,
        });
    }

    plan
}

/// Apply a plan to an RGBA image in place. Alpha is never touched.
pub fn apply_adjustments(image: &mut RgbaImage, adjustments: &[Adjustment]) {
    let (w, h) = image.dimensions();
    let span_x = (w.saturating_sub(1)).max(1) as f64;
    let span_y = (h.saturating_sub(1)).max(1) as f64;

    for adjustment in adjustments {
        for (x, y, pixel) in image.enumerate_pixels_mut() {
            let gains = match *adjustment {
                Adjustment::ColorTemperatureShift { amount } => [1.0 + amount, 1.0, 1.0 - amount],
                Adjustment::BrightnessScale { factor } => [factor; 3],
                Adjustment::DirectionalShading {
                    light_from,
                    strength,
                } => {
                    // Distance from the lit edge, 0.0 at the light.
                    let t = match light_from {
                        LightDirection::Left => x as f64 / span_x,
                        LightDirection::Right => 1.0 - x as f64 / span_x,
                        LightDirection::Top => y as f64 / span_y,
                        LightDirection::Bottom => 1.0 - y as f64 / span_y,
                        LightDirection::Frontal => 0.0,
                    };
                    [1.0 - strength * t; 3]
                }
            };
            for (channel, gain) in pixel.0.iter_mut().take(3).zip(gains) {
                *channel = (*channel as f64 * gain).round().clamp(0.0, 255.0) as u8;
            }
        }
    }
}

#[async_trait]
pub trait StyleCapability: Send + Sync {
    fn name(&self) -> &str;

    async fn apply(
        &self,
        image: &RgbaImage,
        adjustments: &[Adjustment],
    ) -> Result<RgbaImage, CapabilityError>;
}

/// In-process styling with plain pixel operations.
#[derive(Debug, Default, Clone)]
pub struct LocalStyler;

#[async_trait]
impl StyleCapability for LocalStyler {
    fn name(&self) -> &str {
        "local"
    }

    async fn apply(
        &self,
        image: &RgbaImage,
        adjustments: &[Adjustment],
    ) -> Result<RgbaImage, CapabilityError> {
        let mut styled = image.clone();
        apply_adjustments(&mut styled, adjustments);
        Ok(styled)
    }
}

/// Client for a remote stylization service.
pub struct HttpStyleClient {
    http: Client,
    base_url: String,
    api_token: Option<String>,
}

#[derive(Serialize)]
struct StyleRequest<'a> {
    image: String,
    adjustments: &'a [Adjustment],
}

#[derive(Deserialize)]
struct StyleResponse {
    image: String,
}

impl HttpStyleClient {
    pub fn new(base_url: impl Into<String>, api_token: Option<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token,
        }
    }
}

#[async_trait]
impl StyleCapability for HttpStyleClient {
    fn name(&self) -> &str {
        "style-service"
    }

    async fn apply(
        &self,
        image: &RgbaImage,
        adjustments: &[Adjustment],
    ) -> Result<RgbaImage, CapabilityError> {
        let png = encode_png(DynamicImage::ImageRgba8(image.clone()))
            .map_err(|e| CapabilityError::transient(self.name(), e.to_string()))?;
        let body = StyleRequest {
            image: base64::engine::general_purpose::STANDARD.encode(png),
            adjustments,
        };

        let mut request = self.http.post(format!("{}/v1/stylize", self.base_url));
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

        let parsed: StyleResponse = response
            .json()
            .await
            .map_err(|e| CapabilityError::transient(self.name(), e.to_string()))?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(parsed.image)
            .map_err(|e| CapabilityError::transient(self.name(), e.to_string()))?;
        let styled = image::load_from_memory(&bytes)
            .map_err(|e| CapabilityError::transient(self.name(), e.to_string()))?;
        Ok(styled.to_rgba8())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StylistError {
    #[error("Product image is not a decodable image: {0}")]
    InvalidImage(image::ImageError),

    #[error("Stylization failed: {0}")]
    Capability(#[from] CapabilityError),

    #[error("Failed to encode styled asset: {0}")]
    Encode(image::ImageError),

    #[error("Failed to store styled asset: {0}")]
    Storage(#[from] StorageError),
}

/// Adapts the product image to the anchor frame's lighting.
pub struct AssetStylist {
    capability: Option<Arc<dyn StyleCapability>>,
    capability_timeout: Duration,
}

impl AssetStylist {
    pub fn new(capability: Option<Arc<dyn StyleCapability>>, capability_timeout: Duration) -> Self {
        Self {
            capability,
            capability_timeout,
        }
    }

    /// Style the product and store the result as PNG through `output`.
    ///
    /// An unavailable or missing capability yields the unmodified asset with
    /// `styled = false`; transient capability errors are returned for retry.
    pub async fn style(
        &self,
        product_image: &[u8],
        lighting: &Lighting,
        output: &ScopedWriter,
    ) -> Result<StyledAsset, StylistError> {
        let source = image::load_from_memory(product_image)
            .map_err(StylistError::InvalidImage)?
            .to_rgba8();
        let plan = plan_adjustments(lighting);

        let (image, styled, adjustments, capability, fallback_reason) = match &self.capability {
            None => (
                source,
                false,
                Vec::new(),
                None,
                Some("No style capability configured".to_string()),
            ),
            Some(cap) => {
                let name = cap.name().to_string();
                match call_with_timeout(&name, self.capability_timeout, cap.apply(&source, &plan))
                    .await
                {
                    Ok(styled) => (styled, true, plan, Some(name), None),
                    Err(e) if e.is_unavailable() => {
                        tracing::warn!(capability = %name, error = %e, "Styling degraded to unmodified asset");
                        (source, false, Vec::new(), None, Some(e.to_string()))
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        let (width, height) = image.dimensions();
        let png = encode_png(DynamicImage::ImageRgba8(image)).map_err(StylistError::Encode)?;
        let asset_ref = output.put(&png, "image/png").await?;

        Ok(StyledAsset {
            asset_ref,
            styled,
            adjustments,
            source_lighting: *lighting,
            capability,
            fallback_reason,
            width,
            height,
        })
    }
}
