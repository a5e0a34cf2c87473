//! Generation orchestration.
//!
//! The [`Orchestrator`] accepts one request at a time and walks it through
//!
//! ```text
//! Idle -> Normalizing -> AwaitingModel -> Generating -> Finalizing
//!                                                        -> Completed | Failed | Cancelled -> Idle
//! ```
//!
//! Progress, previews and phase changes are streamed over an unbounded
//! channel so the pipeline never waits on the consumer. A second submission
//! while one is in flight is rejected with [`GenerationError::Busy`].

use std::sync::Arc;

use image::DynamicImage;
use parking_lot::RwLock;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::engine::{checkpoint, EngineConfig, EngineProvider};
use crate::provision::ModelProvisioner;
use crate::registry;
use crate::{
    EngineError, GenerationError, GenerationEvent, GenerationRequest, HistoryStore, NewRecord,
    NormalizedRequest, Phase, Progress, ProgressLabel, RecordId, ResourceTier, Settings,
    UnsavedImage,
};

/// A completed and persisted generation.
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub record_id: RecordId,
    pub image: DynamicImage,
    /// The image as persisted, in the requested output format.
    pub encoded: Vec<u8>,
    pub request: NormalizedRequest,
}

impl GenerationOutcome {
    /// The effective seed, suitable for replaying the generation.
    pub fn seed(&self) -> u64 {
        self.request.seed
    }
}

pub struct Orchestrator {
    engines: Arc<dyn EngineProvider>,
    provisioner: Arc<dyn ModelProvisioner>,
    history: HistoryStore,
    tier: ResourceTier,
    settings: RwLock<Settings>,
    /// Held for as long as an engine session may be alive.
    slot: Arc<Mutex<()>>,
    state: Arc<watch::Sender<Phase>>,
}

/// Occupancy of the generation slot for one run.
///
/// Whoever drops the ticket last settles the observable state: a run that
/// finishes normally publishes its own terminal phase first, an abandoned
/// one is reported as cancelled once its session is gone. The state is
/// published before the slot is released.
struct RunTicket {
    _slot: OwnedMutexGuard<()>,
    state: Arc<watch::Sender<Phase>>,
    settled: bool,
}

impl RunTicket {
    fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for RunTicket {
    fn drop(&mut self) {
        if !self.settled {
            tracing::info!("Abandoned generation stopped");
            self.state.send_replace(Phase::Cancelled);
            self.state.send_replace(Phase::Idle);
        }
    }
}

impl Orchestrator {
    /// Applies the tier's working-set budget before anything runs.
    pub fn new(
        engines: Arc<dyn EngineProvider>,
        provisioner: Arc<dyn ModelProvisioner>,
        history: HistoryStore,
        settings: Settings,
        tier: ResourceTier,
    ) -> Self {
        if tier.apply() {
            tracing::info!(
                %tier,
                working_set = tier.working_set_ceiling(),
                memory_ceiling = ?tier.memory_ceiling(),
                "Configured engine resources"
            );
        }
        let (state, _) = watch::channel(Phase::Idle);
        Self {
            engines,
            provisioner,
            history,
            tier,
            settings: RwLock::new(settings),
            slot: Arc::new(Mutex::new(())),
            state: Arc::new(state),
        }
    }

    pub fn tier(&self) -> ResourceTier {
        self.tier
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn settings(&self) -> Settings {
        self.settings.read().clone()
    }

    /// Replace the settings. Takes effect from the next submission.
    pub fn reload_settings(&self, settings: Settings) {
        tracing::info!(selected_model = %settings.selected_model_id, "Reloaded settings");
        *self.settings.write() = settings;
    }

    pub fn state(&self) -> Phase {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<Phase> {
        self.state.subscribe()
    }

    pub fn is_busy(&self) -> bool {
        self.slot.try_lock().is_err()
    }

    /// Run one generation to completion.
    ///
    /// Fails immediately with [`GenerationError::Busy`] if another
    /// generation is in flight. Dropping the returned future cancels the
    /// generation; the engine stops at the next step boundary and keeps the
    /// orchestrator busy until it has.
    pub async fn submit(
        &self,
        request: GenerationRequest,
        events: UnboundedSender<GenerationEvent>,
        cancel: CancellationToken,
    ) -> Result<GenerationOutcome, GenerationError> {
        let slot = Arc::clone(&self.slot).try_lock_owned().map_err(|_| {
            tracing::warn!("Rejected submission while a generation is in flight");
            GenerationError::Busy
        })?;
        let mut ticket = Some(RunTicket {
            _slot: slot,
            state: Arc::clone(&self.state),
            settled: false,
        });

        let cancel = cancel.child_token();
        let _abandon = cancel.clone().drop_guard();

        let result = self.run(request, &events, &cancel, &mut ticket).await;

        let terminal = match &result {
            Ok(outcome) => {
                tracing::info!(record_id = %outcome.record_id, seed = outcome.seed(), "Generation completed");
                Phase::Completed
            }
            Err(GenerationError::Cancelled) => {
                tracing::info!("Generation cancelled");
                Phase::Cancelled
            }
            Err(err) => {
                tracing::warn!(error = %err, "Generation failed");
                Phase::Failed
            }
        };
        self.transition(terminal, &events);
        self.transition(Phase::Idle, &events);
        if let Some(ticket) = ticket {
            ticket.settle();
        }
        result
    }

    async fn run(
        &self,
        request: GenerationRequest,
        events: &UnboundedSender<GenerationEvent>,
        cancel: &CancellationToken,
        ticket: &mut Option<RunTicket>,
    ) -> Result<GenerationOutcome, GenerationError> {
        self.transition(Phase::Normalizing, events);
        let settings = self.settings();
        let mut normalized = request.normalize()?;
        let model = registry::lookup(&normalized.model_id).ok_or_else(|| {
            GenerationError::Validation(format!("unknown model: {}", normalized.model_id))
        })?;
        normalized.model_id = model.id.to_string();
        tracing::info!(
            model_id = %normalized.model_id,
            seed = normalized.seed,
            width = normalized.width,
            height = normalized.height,
            steps = normalized.steps,
            "Dispatching generation"
        );

        self.transition(Phase::AwaitingModel, events);
        let cache_dir = settings.custom_model_cache_path;
        if !self
            .provisioner
            .is_cached(&normalized.model_id, cache_dir.as_deref())
        {
            tracing::info!(model_id = %normalized.model_id, "Model weights missing, downloading");
            let relay = |progress: Progress| {
                let _ = events.send(GenerationEvent::Progress {
                    label: ProgressLabel::Downloading,
                    progress,
                });
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(GenerationError::Cancelled),
                downloaded = self.provisioner.download(&normalized.model_id, cache_dir.as_deref(), &relay) => downloaded?,
            }
        }
        if cancel.is_cancelled() {
            return Err(GenerationError::Cancelled);
        }

        self.transition(Phase::Generating, events);
        let config = EngineConfig {
            model_id: normalized.model_id.clone(),
            tier: self.tier,
            cache_dir,
        };
        let engines = Arc::clone(&self.engines);
        let job = normalized.clone();
        let engine_events = events.clone();
        let engine_cancel = cancel.clone();
        // The ticket travels with the session so the slot stays occupied
        // until the session is gone, even if this future is dropped.
        let session_ticket = ticket.take();
        let (session_ticket, generated) = tokio::task::spawn_blocking(move || {
            let generated = run_session(
                engines.as_ref(),
                &config,
                &job,
                &engine_events,
                &engine_cancel,
            );
            (session_ticket, generated)
        })
        .await
        .map_err(|e| GenerationError::Pipeline {
            reason: format!("engine task failed: {e}"),
        })?;
        *ticket = session_ticket;
        let image = generated?;

        // Nothing is written once cancellation has been observed.
        if cancel.is_cancelled() {
            return Err(GenerationError::Cancelled);
        }

        self.transition(Phase::Finalizing, events);
        let encoded = normalized
            .output_format
            .encode(&image)
            .map_err(|e| GenerationError::Pipeline {
                reason: format!("failed to encode image: {e}"),
            })?;

        match self
            .history
            .append(NewRecord::new(normalized.clone(), encoded.clone()))
            .await
        {
            Ok(record_id) => Ok(GenerationOutcome {
                record_id,
                image,
                encoded,
                request: normalized,
            }),
            Err(source) => {
                tracing::error!(error = %source, "Failed to persist generation");
                Err(GenerationError::Store {
                    source,
                    unsaved: Box::new(UnsavedImage {
                        image,
                        encoded,
                        request: normalized,
                    }),
                })
            }
        }
    }

    fn transition(&self, phase: Phase, events: &UnboundedSender<GenerationEvent>) {
        tracing::debug!(?phase, "Orchestrator transition");
        self.state.send_replace(phase);
        let _ = events.send(GenerationEvent::Phase(phase));
    }
}

/// Open a session, run it, and tear it down. Runs on a blocking thread.
fn run_session(
    engines: &dyn EngineProvider,
    config: &EngineConfig,
    request: &NormalizedRequest,
    events: &UnboundedSender<GenerationEvent>,
    cancel: &CancellationToken,
) -> Result<DynamicImage, EngineError> {
    let mut session = engines.open(config, cancel)?;
    checkpoint(cancel)?;

    let mut on_progress = |progress: Progress| {
        let _ = events.send(GenerationEvent::Progress {
            label: ProgressLabel::Generating,
            progress,
        });
    };
    let mut on_preview = |image: DynamicImage| {
        let _ = events.send(GenerationEvent::Preview(Arc::new(image)));
    };
    session.generate(request, &mut on_progress, &mut on_preview, cancel)
}
