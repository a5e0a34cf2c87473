#[cfg(feature = "accelerate")]
extern crate accelerate_src;
#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

pub mod cache;
pub mod device_map;
pub mod engine;
pub mod error;
pub mod events;
mod flux;
pub mod orchestrator;
pub mod provision;
pub mod registry;
pub mod request;
pub mod settings;
pub mod store;
pub mod tier;
mod util;

pub use cache::{ArtifactCache, BlobSource, CacheKey, CacheLimits, CacheStats, Thumbnail};
pub use device_map::*;
pub use engine::{Engine, EngineConfig, EngineProvider, RegistryEngineProvider};
pub use error::*;
pub use events::*;
pub use flux::FluxEngine;
pub use orchestrator::{GenerationOutcome, Orchestrator};
pub use provision::{HubProvisioner, ModelProvisioner};
pub use request::{GenerationRequest, NormalizedRequest, OutputFormat, RequestParams, SeedPolicy};
pub use settings::Settings;
pub use store::{GenerationRecord, HistoryStore, NewRecord, RecordId, RecordSummary};
pub use tier::ResourceTier;
pub(crate) use util::*;
