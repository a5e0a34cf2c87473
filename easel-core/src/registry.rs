//! Static registry of supported models.
//!
//! A model identifier selects both the backend that runs it and the set of
//! weight files it needs on disk.

use serde::{Deserialize, Serialize};

pub const DEFAULT_MODEL_ID: &str = "flux.1-schnell";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FluxVariant {
    Schnell,
    Dev,
}

/// Which engine implementation runs a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    Flux(FluxVariant),
}

/// A single file inside a hub repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WeightFile {
    pub repo: &'static str,
    pub revision: Option<&'static str>,
    pub file: &'static str,
}

impl WeightFile {
    const fn new(repo: &'static str, file: &'static str) -> Self {
        Self {
            repo,
            revision: None,
            file,
        }
    }

    pub fn hub_repo(&self) -> hf_hub::Repo {
        match self.revision {
            Some(revision) => hf_hub::Repo::with_revision(
                self.repo.to_string(),
                hf_hub::RepoType::Model,
                revision.to_string(),
            ),
            None => hf_hub::Repo::model(self.repo.to_string()),
        }
    }
}

pub const T5_WEIGHTS: WeightFile = WeightFile {
    repo: "google/t5-v1_1-xxl",
    revision: Some("refs/pr/2"),
    file: "model.safetensors",
};
pub const T5_CONFIG: WeightFile = WeightFile {
    repo: "google/t5-v1_1-xxl",
    revision: Some("refs/pr/2"),
    file: "config.json",
};
pub const T5_TOKENIZER: WeightFile =
    WeightFile::new("lmz/mt5-tokenizers", "t5-v1_1-xxl.tokenizer.json");
pub const CLIP_WEIGHTS: WeightFile =
    WeightFile::new("openai/clip-vit-large-patch14", "model.safetensors");
pub const CLIP_TOKENIZER: WeightFile =
    WeightFile::new("openai/clip-vit-large-patch14", "tokenizer.json");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub id: &'static str,
    pub display_name: &'static str,
    pub backend: Backend,
    pub denoiser: WeightFile,
    /// GGUF denoiser used by the conservative tier.
    pub quantized_denoiser: WeightFile,
    pub autoencoder: WeightFile,
}

impl ModelSpec {
    /// Every file that must be on disk before the model can run.
    pub fn required_files(&self, quantized: bool) -> Vec<WeightFile> {
        let denoiser = if quantized {
            self.quantized_denoiser
        } else {
            self.denoiser
        };
        vec![
            T5_CONFIG,
            T5_TOKENIZER,
            CLIP_TOKENIZER,
            T5_WEIGHTS,
            CLIP_WEIGHTS,
            self.autoencoder,
            denoiser,
        ]
    }
}

static MODELS: &[ModelSpec] = &[
    ModelSpec {
        id: "flux.1-schnell",
        display_name: "FLUX.1 [schnell]",
        backend: Backend::Flux(FluxVariant::Schnell),
        denoiser: WeightFile::new("black-forest-labs/FLUX.1-schnell", "flux1-schnell.safetensors"),
        quantized_denoiser: WeightFile::new("lmz/candle-flux", "flux1-schnell.gguf"),
        autoencoder: WeightFile::new("black-forest-labs/FLUX.1-schnell", "ae.safetensors"),
    },
    ModelSpec {
        id: "flux.1-dev",
        display_name: "FLUX.1 [dev]",
        backend: Backend::Flux(FluxVariant::Dev),
        denoiser: WeightFile::new("black-forest-labs/FLUX.1-dev", "flux1-dev.safetensors"),
        quantized_denoiser: WeightFile::new("lmz/candle-flux", "flux1-dev.gguf"),
        autoencoder: WeightFile::new("black-forest-labs/FLUX.1-dev", "ae.safetensors"),
    },
];

pub fn models() -> &'static [ModelSpec] {
    MODELS
}

/// Resolve a model identifier.
///
/// Accepts registry ids and hub repository names, case-insensitively. A
/// repository name outside the table (a fine-tune or re-upload such as
/// "someone/FLUX.1-dev-fp8") resolves to the base model whose variant the
/// name carries. Bare names must match exactly.
pub fn lookup(model_id: &str) -> Option<&'static ModelSpec> {
    let wanted = model_id.trim().to_lowercase();
    if let Some(model) = MODELS.iter().find(|model| {
        model.id == wanted || model.denoiser.repo.to_lowercase() == wanted
    }) {
        return Some(model);
    }

    if !wanted.contains('/') {
        return None;
    }
    let variant = detect_variant(&wanted)?;
    let model = MODELS
        .iter()
        .find(|model| model.backend == Backend::Flux(variant))?;
    tracing::warn!(
        requested = model_id,
        resolved = model.id,
        "Unknown repository, using the base model for its variant"
    );
    Some(model)
}

fn detect_variant(name: &str) -> Option<FluxVariant> {
    let name_upper = name.to_uppercase();
    if !name_upper.contains("FLUX") {
        return None;
    }
    if name_upper.contains("DEV") {
        Some(FluxVariant::Dev)
    } else {
        // Schnell unless the name says otherwise.
        Some(FluxVariant::Schnell)
    }
}
