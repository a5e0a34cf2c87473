//! Scripted engine and provisioner doubles shared by the integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use easel_core::{
    Engine, EngineConfig, EngineError, EngineProvider, GenerationEvent, GenerationRequest,
    HistoryStore, ModelProvisioner, NormalizedRequest, Orchestrator, OutputFormat, Progress,
    ResourceTier, SeedPolicy, Settings, TransportError,
};
use image::{DynamicImage, Rgb, RgbImage};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// What the next engine session does.
#[derive(Debug, Clone, PartialEq)]
pub enum Behavior {
    Succeed,
    /// Park inside the first step until released or cancelled.
    Hold,
    Fail(String),
    MissingWeights,
    /// Block while loading weights until cancelled.
    HoldOpen,
}

#[derive(Default)]
pub struct EngineTrace {
    pub opened: AtomicUsize,
    pub live_sessions: AtomicUsize,
    pub started: AtomicBool,
    pub loading: AtomicBool,
    pub release: AtomicBool,
    pub last_request: Mutex<Option<NormalizedRequest>>,
    pub last_config: Mutex<Option<EngineConfig>>,
}

pub struct FakeEngines {
    pub behavior: Mutex<Behavior>,
    pub trace: Arc<EngineTrace>,
}

impl FakeEngines {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            trace: Arc::new(EngineTrace::default()),
        })
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock() = behavior;
    }
}

impl EngineProvider for FakeEngines {
    fn open(
        &self,
        config: &EngineConfig,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn Engine>, EngineError> {
        self.trace.opened.fetch_add(1, Ordering::SeqCst);
        *self.trace.last_config.lock() = Some(config.clone());
        let behavior = self.behavior.lock().clone();
        match behavior {
            Behavior::MissingWeights => {
                return Err(EngineError::Resource(format!(
                    "{} weights are not in the local model cache",
                    config.model_id
                )));
            }
            Behavior::HoldOpen => {
                self.trace.loading.store(true, Ordering::SeqCst);
                while !cancel.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(2));
                }
                return Err(EngineError::Cancelled);
            }
            _ => {}
        }
        self.trace.live_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            behavior,
            trace: Arc::clone(&self.trace),
        }))
    }
}

struct FakeSession {
    behavior: Behavior,
    trace: Arc<EngineTrace>,
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.trace.live_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A deterministic image derived from the seed.
pub fn render(request: &NormalizedRequest) -> DynamicImage {
    let shade = (request.seed % 251) as u8;
    DynamicImage::ImageRgb8(RgbImage::from_pixel(
        request.width,
        request.height,
        Rgb([shade, 255 - shade, 7]),
    ))
}

impl Engine for FakeSession {
    fn generate(
        &mut self,
        request: &NormalizedRequest,
        on_progress: &mut dyn FnMut(Progress),
        on_preview: &mut dyn FnMut(DynamicImage),
        cancel: &CancellationToken,
    ) -> Result<DynamicImage, EngineError> {
        *self.trace.last_request.lock() = Some(request.clone());
        self.trace.started.store(true, Ordering::SeqCst);

        if let Behavior::Fail(reason) = &self.behavior {
            return Err(EngineError::pipeline(reason.clone()));
        }

        let total = request.steps;
        for step in 1..=total {
            if self.behavior == Behavior::Hold {
                while !self.trace.release.load(Ordering::SeqCst) {
                    if cancel.is_cancelled() {
                        return Err(EngineError::Cancelled);
                    }
                    std::thread::sleep(Duration::from_millis(2));
                }
            }
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            on_progress(Progress::new(step, total));
            if easel_core::engine::preview_due(step, total) {
                on_preview(DynamicImage::new_rgb8(8, 8));
            }
        }
        Ok(render(request))
    }
}

/// Provisioner whose readiness and download outcome are scripted.
pub struct FakeProvisioner {
    pub cached: AtomicBool,
    pub fail_download: Option<String>,
    /// Never complete the download.
    pub stall: bool,
    pub downloads: AtomicUsize,
}

impl FakeProvisioner {
    pub fn ready() -> Arc<Self> {
        Arc::new(Self {
            cached: AtomicBool::new(true),
            fail_download: None,
            stall: false,
            downloads: AtomicUsize::new(0),
        })
    }

    pub fn missing() -> Arc<Self> {
        Arc::new(Self {
            cached: AtomicBool::new(false),
            fail_download: None,
            stall: false,
            downloads: AtomicUsize::new(0),
        })
    }

    pub fn broken(message: &str) -> Arc<Self> {
        Arc::new(Self {
            cached: AtomicBool::new(false),
            fail_download: Some(message.to_string()),
            stall: false,
            downloads: AtomicUsize::new(0),
        })
    }

    pub fn stalled() -> Arc<Self> {
        Arc::new(Self {
            cached: AtomicBool::new(false),
            fail_download: None,
            stall: true,
            downloads: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ModelProvisioner for FakeProvisioner {
    fn is_cached(&self, _model_id: &str, _cache_dir: Option<&Path>) -> bool {
        self.cached.load(Ordering::SeqCst)
    }

    async fn download(
        &self,
        model_id: &str,
        _cache_dir: Option<&Path>,
        on_progress: &(dyn Fn(Progress) + Send + Sync),
    ) -> Result<(), TransportError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        if self.stall {
            std::future::pending::<()>().await;
        }
        if let Some(message) = &self.fail_download {
            return Err(TransportError {
                model_id: model_id.to_string(),
                message: message.clone(),
            });
        }
        for completed in 0..=2 {
            on_progress(Progress::new(completed, 2));
        }
        self.cached.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub engines: Arc<FakeEngines>,
    pub provisioner: Arc<FakeProvisioner>,
    pub store: HistoryStore,
}

pub async fn harness(behavior: Behavior, provisioner: Arc<FakeProvisioner>) -> Harness {
    let store = HistoryStore::open_in_memory().await.unwrap();
    let engines = FakeEngines::new(behavior);
    let orchestrator = Arc::new(Orchestrator::new(
        engines.clone(),
        provisioner.clone(),
        store.clone(),
        Settings::default(),
        ResourceTier::Standard,
    ));
    Harness {
        orchestrator,
        engines,
        provisioner,
        store,
    }
}

pub fn cat_request() -> GenerationRequest {
    GenerationRequest {
        prompt: "a cat".to_string(),
        negative_prompt: None,
        steps: 4,
        guidance_scale: 0.0,
        width: 1000,
        height: 700,
        seed: SeedPolicy::Fixed(42),
        output_format: OutputFormat::Png,
        model_id: "flux.1-schnell".to_string(),
    }
}

pub fn small_request(seed: SeedPolicy) -> GenerationRequest {
    GenerationRequest {
        width: 128,
        height: 64,
        seed,
        ..cat_request()
    }
}

pub fn events() -> (
    mpsc::UnboundedSender<GenerationEvent>,
    mpsc::UnboundedReceiver<GenerationEvent>,
) {
    mpsc::unbounded_channel()
}

pub fn drain(rx: &mut mpsc::UnboundedReceiver<GenerationEvent>) -> Vec<GenerationEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

/// Poll until the held engine has entered its first step.
pub async fn wait_until_started(trace: &EngineTrace) {
    wait_for(&trace.started, "engine never started").await;
}

/// Poll until the engine is blocked loading weights.
pub async fn wait_until_loading(trace: &EngineTrace) {
    wait_for(&trace.loading, "engine never started loading").await;
}

async fn wait_for(flag: &AtomicBool, message: &str) {
    for _ in 0..2000 {
        if flag.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("{message}");
}
