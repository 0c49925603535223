use chrono::{DateTime, Duration, Utc};
use harvest_model::{DbTrigger, ScanTags};

use super::{
    CursorDecision, CursorStrategy, ScanWindow, full_scan_due, keys,
    scan_horizon,
};
use crate::config::CursorConfig;

/// Periodic full rescans with incremental windows in between.
#[derive(Debug, Clone)]
pub struct DefaultCursorStrategy {
    full_scan_frequency: Duration,
    onboarding_span: Duration,
}

impl DefaultCursorStrategy {
    pub fn new(full_scan_frequency: Duration, onboarding_span: Duration) -> Self {
        Self {
            full_scan_frequency,
            onboarding_span,
        }
    }

    pub fn from_config(config: &CursorConfig) -> Self {
        Self::new(config.full_scan_frequency(), config.onboarding_span())
    }
}

impl CursorStrategy for DefaultCursorStrategy {
    fn name(&self) -> &'static str {
        "default"
    }

    fn next_decision(
        &self,
        trigger: &DbTrigger,
        now: DateTime<Utc>,
    ) -> CursorDecision {
        let mut metadata = trigger.metadata.clone();
        let cursor = metadata.get_datetime(keys::CURRENT_CURSOR);

        let full = cursor.is_none()
            || full_scan_due(&metadata, now, self.full_scan_frequency);

        let (from, tags) = match cursor {
            Some(cursor) if !full => (cursor, ScanTags::forward()),
            _ => (
                scan_horizon(trigger, now, self.onboarding_span),
                ScanTags::full(),
            ),
        };

        if from >= now {
            return CursorDecision::skip(metadata);
        }

        if full {
            metadata.set_datetime(keys::LAST_FULL_SCAN, now);
        }
        metadata.set_datetime(keys::CURRENT_CURSOR, now);

        CursorDecision {
            window: Some(ScanWindow {
                from,
                to: now,
                tags,
            }),
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use harvest_model::ScanType;

    use super::*;
    use crate::cursor::test_support::trigger;

    fn strategy() -> DefaultCursorStrategy {
        DefaultCursorStrategy::new(Duration::days(7), Duration::days(90))
    }

    #[test]
    fn fresh_trigger_gets_full_window_from_creation() {
        let created = Utc::now() - Duration::days(3);
        let now = created + Duration::days(3);
        let decision = strategy().next_decision(&trigger("poll", Some(created)), now);

        let window = decision.window.unwrap();
        assert_eq!(window.from, created);
        assert_eq!(window.to, now);
        assert!(!window.partial());
        assert_eq!(window.tags.scan_type, ScanType::Full);
        assert_eq!(decision.metadata.get_datetime(keys::LAST_FULL_SCAN), Some(now));
        assert_eq!(decision.metadata.get_datetime(keys::CURRENT_CURSOR), Some(now));
    }

    #[test]
    fn unknown_creation_time_falls_back_to_onboarding_horizon() {
        let now = Utc::now();
        let decision = strategy().next_decision(&trigger("poll", None), now);
        assert_eq!(decision.window.unwrap().from, now - Duration::days(90));
    }

    #[test]
    fn successive_windows_are_contiguous() {
        let strategy = strategy();
        let created = Utc::now() - Duration::days(1);
        let mut t = trigger("poll", Some(created));
        let mut now = created + Duration::hours(1);
        let mut previous_to = None;

        for _ in 0..24 {
            let decision = strategy.next_decision(&t, now);
            let window = decision.window.unwrap();
            if let Some(prev) = previous_to {
                assert_eq!(window.from, prev);
                assert!(window.partial());
            }
            previous_to = Some(window.to);
            t.metadata = decision.metadata;
            now += Duration::minutes(17);
        }
    }

    #[test]
    fn stale_full_scan_triggers_a_new_full_pass() {
        let strategy = strategy();
        let created = Utc::now() - Duration::days(30);
        let mut t = trigger("poll", Some(created));
        let first = created + Duration::days(1);
        t.metadata = strategy.next_decision(&t, first).metadata;

        let later = first + Duration::days(7);
        let window = strategy.next_decision(&t, later).window.unwrap();
        assert!(!window.partial());
        assert_eq!(window.from, created);
    }

    #[test]
    fn empty_window_is_skipped_without_touching_metadata() {
        let strategy = strategy();
        let now = Utc::now();
        let mut t = trigger("poll", Some(now));
        t.metadata.set_datetime(keys::LAST_FULL_SCAN, now);
        t.metadata.set_datetime(keys::CURRENT_CURSOR, now);

        let decision = strategy.next_decision(&t, now);
        assert!(decision.window.is_none());
        assert!(!decision.metadata_changed(&t.metadata));
    }

    #[test]
    fn trigger_created_at_now_is_skipped_until_time_passes() {
        let strategy = strategy();
        let now = Utc::now();
        let t = trigger("poll", Some(now));

        let decision = strategy.next_decision(&t, now);
        assert!(decision.window.is_none());
        assert!(decision.metadata.is_empty());

        let later = now + Duration::seconds(30);
        let window = strategy.next_decision(&t, later).window.unwrap();
        assert_eq!(window.tags.scan_type, ScanType::Full);
        assert_eq!((window.from, window.to), (now, later));
    }
}
