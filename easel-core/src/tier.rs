//! Host-memory driven resource strategy.
//!
//! The tier is chosen once per process from total system RAM and decides
//! whether quantized weights are used and how large the engine's internal
//! working-set cache may grow.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use sysinfo::{MemoryRefreshKind, RefreshKind, System};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Hosts with less total memory than this run the conservative tier.
pub const STANDARD_TIER_MIN_MEMORY: u64 = 8 * GIB;

/// Process-wide working-set budget in bytes. Zero means unset.
static WORKING_SET_BUDGET: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceTier {
    /// Quantized weights, small working set, hard ceiling around 3 GiB.
    Conservative,
    /// Full precision weights, 256 MiB working set, no artificial ceiling.
    Standard,
}

impl std::fmt::Display for ResourceTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceTier::Conservative => write!(f, "conservative"),
            ResourceTier::Standard => write!(f, "standard"),
        }
    }
}

impl ResourceTier {
    pub fn from_total_memory(total_bytes: u64) -> Self {
        if total_bytes < STANDARD_TIER_MIN_MEMORY {
            ResourceTier::Conservative
        } else {
            ResourceTier::Standard
        }
    }

    /// Inspect host memory and pick a tier.
    ///
    /// Runs synchronously; call it once at startup.
    pub fn detect() -> Self {
        let mut sys = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );
        sys.refresh_memory();
        let total = sys.total_memory();
        let tier = Self::from_total_memory(total);
        tracing::info!(total_memory = total, %tier, "Selected resource tier");
        tier
    }

    pub fn quantized(self) -> bool {
        matches!(self, ResourceTier::Conservative)
    }

    /// Ceiling for the engine's internal working-set cache.
    pub fn working_set_ceiling(self) -> u64 {
        match self {
            ResourceTier::Conservative => 64 * MIB,
            ResourceTier::Standard => 256 * MIB,
        }
    }

    /// Hard memory ceiling for a generation, if any.
    pub fn memory_ceiling(self) -> Option<u64> {
        match self {
            ResourceTier::Conservative => Some(3 * GIB),
            ResourceTier::Standard => None,
        }
    }

    /// Whether a generation needing `bytes` of working memory fits under
    /// the hard ceiling.
    pub fn admits(self, bytes: u64) -> bool {
        self.memory_ceiling().map_or(true, |ceiling| bytes <= ceiling)
    }

    /// Install this tier's working-set ceiling as the process-wide budget.
    ///
    /// Returns `false` when the budget already had this value.
    pub fn apply(self) -> bool {
        let ceiling = self.working_set_ceiling();
        let previous = WORKING_SET_BUDGET.swap(ceiling, Ordering::SeqCst);
        if previous == ceiling {
            return false;
        }
        tracing::debug!(tier = %self, budget = ceiling, "Applied working-set budget");
        true
    }
}

/// The process-wide working-set budget, once a tier has been applied.
pub fn working_set_budget() -> Option<u64> {
    match WORKING_SET_BUDGET.load(Ordering::SeqCst) {
        0 => None,
        budget => Some(budget),
    }
}
