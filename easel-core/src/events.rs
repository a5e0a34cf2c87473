use std::sync::Arc;

use image::DynamicImage;
use serde::Serialize;

/// Observable state of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Normalizing,
    AwaitingModel,
    Generating,
    Finalizing,
    Completed,
    Failed,
    Cancelled,
}

/// What a progress report measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ProgressLabel {
    Downloading,
    Generating,
}

impl std::fmt::Display for ProgressLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgressLabel::Downloading => write!(f, "Downloading"),
            ProgressLabel::Generating => write!(f, "Generating"),
        }
    }
}

/// Completed units out of a known total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Progress {
    pub completed: u32,
    pub total: u32,
}

impl Progress {
    pub fn new(completed: u32, total: u32) -> Self {
        Self { completed, total }
    }

    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            return 0.0;
        }
        self.completed as f32 / self.total as f32
    }
}

/// Events streamed to the submitter of a generation, in order.
#[derive(Debug, Clone)]
pub enum GenerationEvent {
    Phase(Phase),
    Progress {
        label: ProgressLabel,
        progress: Progress,
    },
    /// An intermediate decode; advisory only.
    Preview(Arc<DynamicImage>),
}
