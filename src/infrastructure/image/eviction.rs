//! Eviction policies shared by the cache tiers.

use chrono::{DateTime, Utc};

use crate::domain::entities::ImageId;

/// An entry considered for eviction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCandidate {
    /// The entry's identifier.
    pub id: ImageId,
    /// Bytes freed by evicting it.
    pub byte_size: u64,
    /// Last read or write.
    pub last_access: DateTime<Utc>,
}

/// Chooses which entry a tier gives up when over budget.
///
/// Tiers pass candidates ordered least recently used first.
pub trait EvictionPolicy: Send + Sync {
    /// Returns the index of the victim, or `None` to stop evicting.
    fn select_victim(&self, candidates: &[EvictionCandidate]) -> Option<usize>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Evicts the least recently used entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeastRecentlyUsed;

impl EvictionPolicy for LeastRecentlyUsed {
    fn select_victim(&self, candidates: &[EvictionCandidate]) -> Option<usize> {
        (!candidates.is_empty()).then_some(0)
    }

    fn name(&self) -> &'static str {
        "lru"
    }
}

/// Evicts the largest entry among the `window` least recently used ones.
///
/// Frees the budget in fewer evictions when large and small images mix.
#[derive(Debug, Clone, Copy)]
pub struct SizeWeightedLru {
    window: usize,
}

impl SizeWeightedLru {
    /// Default number of candidates compared.
    pub const DEFAULT_WINDOW: usize = 8;

    #[must_use]
    pub const fn new(window: usize) -> Self {
        Self {
            window: if window == 0 { 1 } else { window },
        }
    }
}

impl Default for SizeWeightedLru {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WINDOW)
    }
}

impl EvictionPolicy for SizeWeightedLru {
    fn select_victim(&self, candidates: &[EvictionCandidate]) -> Option<usize> {
        candidates
            .iter()
            .take(self.window)
            .enumerate()
            // max_by_key keeps the last maximum; reverse so ties go to the older entry
            .rev()
            .max_by_key(|(_, c)| c.byte_size)
            .map(|(index, _)| index)
    }

    fn name(&self) -> &'static str {
        "size-weighted-lru"
    }
}

/// Eviction policy selectable from configuration.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionKind {
    /// Least recently used.
    #[default]
    Lru,
    /// Largest of the oldest few.
    SizeWeightedLru,
}

impl EvictionKind {
    /// Instantiates the policy.
    #[must_use]
    pub fn policy(self) -> std::sync::Arc<dyn EvictionPolicy> {
        match self {
            Self::Lru => std::sync::Arc::new(LeastRecentlyUsed),
            Self::SizeWeightedLru => std::sync::Arc::new(SizeWeightedLru::default()),
        }
    }
}
