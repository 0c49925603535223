//! Cursor strategies decide which time window a trigger scans next.
//!
//! Strategies are pure: they read the trigger's metadata and the current
//! time and return the window plus the metadata to persist once the job for
//! that window exists.

mod default;
mod iterative;

use std::{collections::HashMap, fmt, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use harvest_model::{DbTrigger, ScanTags, TriggerMetadata};

use crate::config::CursorConfig;

pub use default::DefaultCursorStrategy;
pub use iterative::IterativeBackwardScanStrategy;

/// Metadata keys shared by the strategies.
pub mod keys {
    pub const LAST_FULL_SCAN: &str = "last_full_scan";
    pub const CURRENT_CURSOR: &str = "current_cursor";
    pub const FORWARD_CURSOR: &str = "forward_cursor";
    pub const BACKWARD_CURSOR: &str = "backward_cursor";
    pub const LAST_SCAN_TYPE: &str = "last_scan_type";
    pub const SHOULD_FETCH_HISTORY: &str = "should_fetch_history";
    pub const SHOULD_START_FETCHING_HISTORY: &str =
        "should_start_fetching_history";
    pub const HISTORICAL_CURSOR: &str = "historical_cursor";
    pub const HISTORICAL_UNTIL: &str = "historical_until";
}

/// Half-open scan interval `[from, to)` plus its classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub tags: ScanTags,
}

impl ScanWindow {
    pub fn partial(&self) -> bool {
        self.tags.partial
    }

    pub fn span(&self) -> Duration {
        self.to - self.from
    }
}

/// Output of one strategy evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorDecision {
    /// `None` when the computed window is empty; no job is created.
    pub window: Option<ScanWindow>,
    /// Metadata with the advanced cursor values.
    pub metadata: TriggerMetadata,
}

impl CursorDecision {
    pub(crate) fn skip(metadata: TriggerMetadata) -> Self {
        Self {
            window: None,
            metadata,
        }
    }

    pub fn metadata_changed(&self, previous: &TriggerMetadata) -> bool {
        &self.metadata != previous
    }
}

pub trait CursorStrategy: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn next_decision(
        &self,
        trigger: &DbTrigger,
        now: DateTime<Utc>,
    ) -> CursorDecision;
}

/// Earliest instant a trigger scans: its creation time, or the onboarding
/// horizon when the creation time is unknown.
pub(crate) fn scan_horizon(
    trigger: &DbTrigger,
    now: DateTime<Utc>,
    onboarding_span: Duration,
) -> DateTime<Utc> {
    trigger.created_at.unwrap_or(now - onboarding_span)
}

pub(crate) fn full_scan_due(
    metadata: &TriggerMetadata,
    now: DateTime<Utc>,
    frequency: Duration,
) -> bool {
    metadata
        .get_datetime(keys::LAST_FULL_SCAN)
        .is_none_or(|last| now - last >= frequency)
}

/// Maps trigger types to strategies, with a fallback for unknown types.
#[derive(Clone, Debug)]
pub struct StrategyRegistry {
    fallback: Arc<dyn CursorStrategy>,
    by_type: HashMap<String, Arc<dyn CursorStrategy>>,
}

impl StrategyRegistry {
    pub fn new(fallback: Arc<dyn CursorStrategy>) -> Self {
        Self {
            fallback,
            by_type: HashMap::new(),
        }
    }

    /// Default strategy for every type, iterative backward scans for the
    /// configured `iterative_trigger_types`.
    pub fn from_config(config: &CursorConfig) -> Self {
        let mut registry =
            Self::new(Arc::new(DefaultCursorStrategy::from_config(config)));
        let iterative: Arc<dyn CursorStrategy> =
            Arc::new(IterativeBackwardScanStrategy::from_config(config));
        for trigger_type in &config.iterative_trigger_types {
            registry.register(trigger_type.clone(), Arc::clone(&iterative));
        }
        registry
    }

    pub fn register(
        &mut self,
        trigger_type: impl Into<String>,
        strategy: Arc<dyn CursorStrategy>,
    ) {
        self.by_type.insert(trigger_type.into(), strategy);
    }

    pub fn for_trigger(&self, trigger: &DbTrigger) -> &Arc<dyn CursorStrategy> {
        self.by_type
            .get(&trigger.trigger_type)
            .unwrap_or(&self.fallback)
    }
}
