use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};

use crate::{GenerationError, Settings};

/// Dimensions are snapped down to a multiple of this before use.
pub const DIMENSION_QUANTUM: u32 = 64;
pub const MIN_STEPS: u32 = 1;
pub const MAX_STEPS: u32 = 50;
pub const MIN_GUIDANCE: f32 = 0.0;
pub const MAX_GUIDANCE: f32 = 20.0;

/// How the effective seed of a generation is chosen.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SeedPolicy {
    /// Draw a fresh 64-bit seed when the request is dispatched.
    #[default]
    Random,
    Fixed(u64),
}

impl SeedPolicy {
    fn resolve(self, draw: impl FnOnce() -> u64) -> u64 {
        match self {
            SeedPolicy::Random => draw(),
            SeedPolicy::Fixed(seed) => seed,
        }
    }
}

/// Encoding of the persisted image.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Lossless PNG.
    #[default]
    Png,
    /// JPEG at quality 90.
    Jpeg,
}

impl OutputFormat {
    pub const JPEG_QUALITY: u8 = 90;

    pub fn mime_type(self) -> &'static str {
        match self {
            OutputFormat::Png => "image/png",
            OutputFormat::Jpeg => "image/jpeg",
        }
    }

    pub fn encode(self, img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
        let mut bytes = Vec::new();
        match self {
            OutputFormat::Png => {
                img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
            }
            OutputFormat::Jpeg => {
                // JPEG has no alpha channel.
                let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
                let encoder = JpegEncoder::new_with_quality(&mut bytes, Self::JPEG_QUALITY);
                rgb.write_with_encoder(encoder)?;
            }
        }
        Ok(bytes)
    }
}

/// A generation request as submitted by a front-end.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    pub steps: u32,
    pub guidance_scale: f32,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub seed: SeedPolicy,
    #[serde(default)]
    pub output_format: OutputFormat,
    pub model_id: String,
}

/// Loosely specified request parameters; anything omitted falls back to
/// the configured defaults.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct RequestParams {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub steps: Option<u32>,
    pub guidance: Option<f32>,
    /// A fixed seed; omitted means a fresh random seed.
    pub seed: Option<u64>,
    pub output_format: Option<OutputFormat>,
    pub model: Option<String>,
}

impl RequestParams {
    pub fn resolve(self, settings: &Settings) -> GenerationRequest {
        GenerationRequest {
            prompt: self.prompt,
            negative_prompt: self.negative_prompt,
            steps: self.steps.unwrap_or(settings.default_steps),
            guidance_scale: self.guidance.unwrap_or(settings.default_guidance_scale),
            width: self.width.unwrap_or(settings.default_width),
            height: self.height.unwrap_or(settings.default_height),
            seed: self.seed.map_or(SeedPolicy::Random, SeedPolicy::Fixed),
            output_format: self.output_format.unwrap_or(settings.default_output_format),
            model_id: self
                .model
                .unwrap_or_else(|| settings.selected_model_id.clone()),
        }
    }
}

/// A request after normalization. The seed here is the effective seed and
/// never changes once resolved.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct NormalizedRequest {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub steps: u32,
    pub guidance_scale: f32,
    pub width: u32,
    pub height: u32,
    pub seed: u64,
    pub output_format: OutputFormat,
    pub model_id: String,
}

impl NormalizedRequest {
    /// A request that reproduces this one exactly.
    pub fn replay(&self) -> GenerationRequest {
        GenerationRequest {
            prompt: self.prompt.clone(),
            negative_prompt: self.negative_prompt.clone(),
            steps: self.steps,
            guidance_scale: self.guidance_scale,
            width: self.width,
            height: self.height,
            seed: SeedPolicy::Fixed(self.seed),
            output_format: self.output_format,
            model_id: self.model_id.clone(),
        }
    }
}

/// Rounds a dimension down to a multiple of 64, never below 64.
pub fn snap_dimension(value: u32) -> u32 {
    (value / DIMENSION_QUANTUM * DIMENSION_QUANTUM).max(DIMENSION_QUANTUM)
}

impl GenerationRequest {
    /// Validates and normalizes the request, drawing a random seed if the
    /// policy asks for one.
    pub fn normalize(&self) -> Result<NormalizedRequest, GenerationError> {
        self.normalize_with(rand::random::<u64>)
    }

    pub fn normalize_with(
        &self,
        draw_seed: impl FnOnce() -> u64,
    ) -> Result<NormalizedRequest, GenerationError> {
        if self.prompt.trim().is_empty() {
            return Err(GenerationError::Validation("prompt must not be empty".into()));
        }
        if !self.guidance_scale.is_finite() {
            return Err(GenerationError::Validation(format!(
                "guidance scale must be finite, got {}",
                self.guidance_scale
            )));
        }
        if self.model_id.trim().is_empty() {
            return Err(GenerationError::Validation("model id must not be empty".into()));
        }

        let negative_prompt = self
            .negative_prompt
            .as_ref()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());

        Ok(NormalizedRequest {
            prompt: self.prompt.clone(),
            negative_prompt,
            steps: self.steps.clamp(MIN_STEPS, MAX_STEPS),
            guidance_scale: self.guidance_scale.clamp(MIN_GUIDANCE, MAX_GUIDANCE),
            width: snap_dimension(self.width),
            height: snap_dimension(self.height),
            seed: self.seed.resolve(draw_seed),
            output_format: self.output_format,
            model_id: self.model_id.clone(),
        })
    }
}
