//! Engine capability interface.
//!
//! The orchestrator only ever talks to an [`Engine`]; which implementation
//! runs a request is decided by the model identifier through the
//! [`registry`](crate::registry), so adding a backend never touches the
//! orchestrator.

use std::path::PathBuf;

use image::DynamicImage;
use tokio_util::sync::CancellationToken;

use crate::registry::{self, Backend};
use crate::{flux::FluxEngine, DeviceMap, EngineError, NormalizedRequest, Progress, ResourceTier};

/// A loaded pipeline able to turn a normalized request into an image.
///
/// `on_progress` is called once per completed step, in order, possibly
/// from a blocking worker thread. `on_preview` receives intermediate
/// decodes roughly every [`preview_interval`] steps and always before the
/// final image is returned. Cancellation is checked between steps.
pub trait Engine: Send {
    fn generate(
        &mut self,
        request: &NormalizedRequest,
        on_progress: &mut dyn FnMut(Progress),
        on_preview: &mut dyn FnMut(DynamicImage),
        cancel: &CancellationToken,
    ) -> Result<DynamicImage, EngineError>;
}

/// Configuration an engine session is opened with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub model_id: String,
    pub tier: ResourceTier,
    pub cache_dir: Option<PathBuf>,
}

impl EngineConfig {
    pub fn quantized(&self) -> bool {
        self.tier.quantized()
    }
}

/// Opens engine sessions. Called on a blocking thread; loading weights may
/// take a long time, so implementations check `cancel` between loading
/// stages and give up with [`EngineError::Cancelled`].
pub trait EngineProvider: Send + Sync {
    fn open(
        &self,
        config: &EngineConfig,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn Engine>, EngineError>;
}

/// Fails with [`EngineError::Cancelled`] once `cancel` has fired.
pub fn checkpoint(cancel: &CancellationToken) -> Result<(), EngineError> {
    if cancel.is_cancelled() {
        Err(EngineError::Cancelled)
    } else {
        Ok(())
    }
}

/// Number of steps between two preview deliveries.
pub fn preview_interval(total_steps: u32) -> u32 {
    (total_steps / 4).max(1)
}

/// Whether a preview is due after `completed` of `total` steps. The final
/// step never produces a preview.
pub fn preview_due(completed: u32, total: u32) -> bool {
    completed < total && completed % preview_interval(total) == 0
}

/// Provider that dispatches on the model registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryEngineProvider {
    device_map: DeviceMap,
}

impl RegistryEngineProvider {
    pub fn new(device_map: DeviceMap) -> Self {
        Self { device_map }
    }
}

impl EngineProvider for RegistryEngineProvider {
    fn open(
        &self,
        config: &EngineConfig,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn Engine>, EngineError> {
        let model = registry::lookup(&config.model_id).ok_or_else(|| {
            EngineError::Resource(format!("unknown model: {}", config.model_id))
        })?;

        tracing::info!(
            model_id = model.id,
            backend = ?model.backend,
            tier = %config.tier,
            "Opening engine session"
        );

        match model.backend {
            Backend::Flux(variant) => {
                let engine = FluxEngine::load(model, variant, config, self.device_map, cancel)?;
                Ok(Box::new(engine))
            }
        }
    }
}
