//! Model provisioning: the readiness predicate and the download that makes
//! it true.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use hf_hub::api::tokio::ApiBuilder;
use hf_hub::Cache;

use crate::registry::{self, WeightFile};
use crate::{Progress, TransportError};

/// Source of model weights.
#[async_trait]
pub trait ModelProvisioner: Send + Sync {
    /// Whether every file the model needs is already on disk.
    fn is_cached(&self, model_id: &str, cache_dir: Option<&Path>) -> bool;

    /// Fetch whatever is missing, reporting progress in files.
    async fn download(
        &self,
        model_id: &str,
        cache_dir: Option<&Path>,
        on_progress: &(dyn Fn(Progress) + Send + Sync),
    ) -> Result<(), TransportError>;
}

pub fn hub_cache(cache_dir: Option<&Path>) -> Cache {
    match cache_dir {
        Some(dir) => Cache::new(dir.to_path_buf()),
        None => Cache::default(),
    }
}

/// Local path of a weight file, if it has been downloaded.
pub fn local_path(cache: &Cache, weight: &WeightFile) -> Option<PathBuf> {
    cache.repo(weight.hub_repo()).get(weight.file)
}

/// Provisions weights from the Hugging Face hub.
#[derive(Debug, Clone, Copy)]
pub struct HubProvisioner {
    quantized: bool,
}

impl HubProvisioner {
    /// `quantized` selects which denoiser weights count as required.
    pub fn new(quantized: bool) -> Self {
        Self { quantized }
    }

    fn required_files(&self, model_id: &str) -> Option<Vec<WeightFile>> {
        registry::lookup(model_id).map(|model| model.required_files(self.quantized))
    }
}

#[async_trait]
impl ModelProvisioner for HubProvisioner {
    fn is_cached(&self, model_id: &str, cache_dir: Option<&Path>) -> bool {
        let Some(files) = self.required_files(model_id) else {
            return false;
        };
        let cache = hub_cache(cache_dir);
        files.iter().all(|file| local_path(&cache, file).is_some())
    }

    async fn download(
        &self,
        model_id: &str,
        cache_dir: Option<&Path>,
        on_progress: &(dyn Fn(Progress) + Send + Sync),
    ) -> Result<(), TransportError> {
        let transport_error = |message: String| TransportError {
            model_id: model_id.to_string(),
            message,
        };

        let files = self
            .required_files(model_id)
            .ok_or_else(|| transport_error("model is not in the registry".into()))?;

        let mut builder = ApiBuilder::new().with_progress(false);
        if let Some(dir) = cache_dir {
            builder = builder.with_cache_dir(dir.to_path_buf());
        }
        let api = builder
            .build()
            .map_err(|e| transport_error(format!("failed to create hub client: {e}")))?;
        let cache = hub_cache(cache_dir);

        let total = files.len() as u32;
        let mut completed = 0;
        on_progress(Progress::new(completed, total));

        for file in &files {
            if local_path(&cache, file).is_none() {
                tracing::info!(repo = file.repo, file = file.file, "Downloading weights");
                api.repo(file.hub_repo())
                    .get(file.file)
                    .await
                    .map_err(|e| transport_error(format!("{}/{}: {e}", file.repo, file.file)))?;
            }
            completed += 1;
            on_progress(Progress::new(completed, total));
        }

        tracing::info!(model_id, files = total, "Model weights ready");
        Ok(())
    }
}
