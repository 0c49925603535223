use chrono::{DateTime, Duration, Utc};
use harvest_model::{DbTrigger, ScanTags, ScanType, TriggerMetadata};

use super::{
    CursorDecision, CursorStrategy, ScanWindow, full_scan_due, keys,
    scan_horizon,
};
use crate::config::CursorConfig;

/// Alternates forward (catch up to now) and backward (re-sweep history in
/// bounded spans) passes, with periodic full scans and an on-demand
/// historical backfill that takes priority over both.
///
/// Historical mode is requested through the `should_start_fetching_history`
/// or `should_fetch_history` flags. It walks `[now - historical_span, now]`
/// one sub-job span per run and clears the flags once covered.
///
/// A full scan covers `[horizon, now]`, so it moves the forward cursor to
/// `now` rather than back to the horizon. Only the backward cursor restarts
/// from the horizon.
#[derive(Debug, Clone)]
pub struct IterativeBackwardScanStrategy {
    full_scan_frequency: Duration,
    onboarding_span: Duration,
    backward_sub_job_span: Duration,
    historical_span: Duration,
    historical_sub_job_span: Duration,
}

impl IterativeBackwardScanStrategy {
    pub fn from_config(config: &CursorConfig) -> Self {
        Self {
            full_scan_frequency: config.full_scan_frequency(),
            onboarding_span: config.onboarding_span(),
            backward_sub_job_span: config.backward_sub_job_span(),
            historical_span: config.historical_span(),
            historical_sub_job_span: config.historical_sub_job_span(),
        }
    }

    fn historical_pass(
        &self,
        metadata: &mut TriggerMetadata,
        now: DateTime<Utc>,
    ) -> Option<Option<ScanWindow>> {
        let starting = metadata.get_bool(keys::SHOULD_START_FETCHING_HISTORY)
            || (metadata.get_bool(keys::SHOULD_FETCH_HISTORY)
                && metadata.get_datetime(keys::HISTORICAL_CURSOR).is_none());
        if starting {
            metadata.remove(keys::SHOULD_START_FETCHING_HISTORY);
            metadata.set_bool(keys::SHOULD_FETCH_HISTORY, true);
            metadata.set_datetime(keys::HISTORICAL_CURSOR, now - self.historical_span);
            metadata.set_datetime(keys::HISTORICAL_UNTIL, now);
        }

        if !metadata.get_bool(keys::SHOULD_FETCH_HISTORY) {
            return None;
        }
        let from = metadata.get_datetime(keys::HISTORICAL_CURSOR)?;
        let until = metadata
            .get_datetime(keys::HISTORICAL_UNTIL)
            .unwrap_or(now)
            .min(now);
        let to = (from + self.historical_sub_job_span).min(until);

        if to >= until {
            metadata.set_bool(keys::SHOULD_FETCH_HISTORY, false);
            metadata.remove(keys::HISTORICAL_CURSOR);
            metadata.remove(keys::HISTORICAL_UNTIL);
        } else {
            metadata.set_datetime(keys::HISTORICAL_CURSOR, to);
        }

        Some((from < to).then_some(ScanWindow {
            from,
            to,
            tags: ScanTags::historical(),
        }))
    }
}

impl CursorStrategy for IterativeBackwardScanStrategy {
    fn name(&self) -> &'static str {
        "iterative_backward"
    }

    fn next_decision(
        &self,
        trigger: &DbTrigger,
        now: DateTime<Utc>,
    ) -> CursorDecision {
        let mut metadata = trigger.metadata.clone();

        if let Some(window) = self.historical_pass(&mut metadata, now) {
            return CursorDecision { window, metadata };
        }

        let horizon = scan_horizon(trigger, now, self.onboarding_span);

        if full_scan_due(&metadata, now, self.full_scan_frequency) {
            if horizon >= now {
                return CursorDecision::skip(trigger.metadata.clone());
            }
            metadata.set_datetime(keys::LAST_FULL_SCAN, now);
            // The full pass already covers up to now; only the backward
            // sweep restarts from the horizon.
            metadata.set_datetime(keys::FORWARD_CURSOR, now);
            metadata.set_datetime(keys::BACKWARD_CURSOR, horizon);
            metadata.set_str(keys::LAST_SCAN_TYPE, ScanType::Full.as_str());
            return CursorDecision {
                window: Some(ScanWindow {
                    from: horizon,
                    to: now,
                    tags: ScanTags::full(),
                }),
                metadata,
            };
        }

        let last = metadata
            .get_str(keys::LAST_SCAN_TYPE)
            .and_then(|raw| ScanType::parse(raw).ok())
            .unwrap_or(ScanType::Full);

        let window = match last {
            ScanType::Backward | ScanType::Full => {
                let from = metadata
                    .get_datetime(keys::FORWARD_CURSOR)
                    .unwrap_or(horizon);
                metadata.set_str(keys::LAST_SCAN_TYPE, ScanType::Forward.as_str());
                (from < now).then(|| {
                    metadata.set_datetime(keys::FORWARD_CURSOR, now);
                    ScanWindow {
                        from,
                        to: now,
                        tags: ScanTags::forward(),
                    }
                })
            }
            ScanType::Forward => {
                let from = metadata
                    .get_datetime(keys::BACKWARD_CURSOR)
                    .unwrap_or(horizon);
                let to = (from + self.backward_sub_job_span).min(now);
                metadata.set_str(keys::LAST_SCAN_TYPE, ScanType::Backward.as_str());
                (from < to).then(|| {
                    metadata.set_datetime(keys::BACKWARD_CURSOR, to);
                    ScanWindow {
                        from,
                        to,
                        tags: ScanTags::backward(),
                    }
                })
            }
        };

        CursorDecision { window, metadata }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::test_support::trigger;

    fn strategy() -> IterativeBackwardScanStrategy {
        IterativeBackwardScanStrategy {
            full_scan_frequency: Duration::days(7),
            onboarding_span: Duration::days(90),
            backward_sub_job_span: Duration::days(7),
            historical_span: Duration::days(365),
            historical_sub_job_span: Duration::days(30),
        }
    }

    fn run(
        strategy: &IterativeBackwardScanStrategy,
        t: &mut DbTrigger,
        now: DateTime<Utc>,
    ) -> Option<ScanWindow> {
        let decision = strategy.next_decision(t, now);
        t.metadata = decision.metadata;
        decision.window
    }

    #[test]
    fn first_run_is_a_full_scan() {
        let now = Utc::now();
        let created = now - Duration::days(20);
        let mut t = trigger("iterative_backward", Some(created));
        let window = run(&strategy(), &mut t, now).unwrap();
        assert_eq!(window.tags.scan_type, ScanType::Full);
        assert!(!window.partial());
        assert_eq!(window.from, created);
        assert_eq!(t.metadata.get_datetime(keys::BACKWARD_CURSOR), Some(created));
    }

    #[test]
    fn forward_and_backward_strictly_alternate() {
        let strategy = strategy();
        let mut now = Utc::now();
        let mut t = trigger("iterative_backward", Some(now - Duration::days(60)));
        run(&strategy, &mut t, now);

        let mut expected = ScanType::Forward;
        for _ in 0..8 {
            now += Duration::hours(1);
            let window = run(&strategy, &mut t, now).unwrap();
            assert_eq!(window.tags.scan_type, expected);
            assert!(window.partial());
            expected = match expected {
                ScanType::Forward => ScanType::Backward,
                _ => ScanType::Forward,
            };
        }
    }

    #[test]
    fn backward_windows_advance_by_span_and_clamp_to_now() {
        let strategy = strategy();
        let start = Utc::now();
        let created = start - Duration::days(10);
        let mut t = trigger("iterative_backward", Some(created));
        run(&strategy, &mut t, start);

        let mut now = start + Duration::minutes(1);
        run(&strategy, &mut t, now); // forward
        now += Duration::minutes(1);
        let first = run(&strategy, &mut t, now).unwrap();
        assert_eq!(first.from, created);
        assert_eq!(first.to, created + Duration::days(7));

        now += Duration::minutes(1);
        run(&strategy, &mut t, now); // forward
        now += Duration::minutes(1);
        let second = run(&strategy, &mut t, now).unwrap();
        assert_eq!(second.from, first.to);
        assert_eq!(second.to, now);
    }

    #[test]
    fn historical_backfill_completes_then_oscillation_resumes() {
        let strategy = strategy();
        let start = Utc::now();
        let mut t = trigger("iterative_backward", Some(start - Duration::days(30)));
        run(&strategy, &mut t, start);
        t.metadata.set_bool(keys::SHOULD_START_FETCHING_HISTORY, true);

        // ceil(365 / 30) = 13 historical runs.
        let mut now = start;
        let mut previous_to = None;
        for run_no in 0..13 {
            now += Duration::minutes(1);
            let window = run(&strategy, &mut t, now).unwrap();
            assert!(window.tags.historical, "run {run_no} left historical mode");
            if let Some(prev) = previous_to {
                assert_eq!(window.from, prev);
            }
            previous_to = Some(window.to);
        }
        assert!(!t.metadata.get_bool(keys::SHOULD_FETCH_HISTORY));
        assert!(!t.metadata.contains(keys::HISTORICAL_CURSOR));

        now += Duration::minutes(1);
        let next = run(&strategy, &mut t, now).unwrap();
        assert!(!next.tags.historical);
        assert_eq!(next.tags.scan_type, ScanType::Forward);
    }

    #[test]
    fn empty_direction_still_flips_the_alternation() {
        let strategy = strategy();
        let now = Utc::now();
        let mut t = trigger("iterative_backward", Some(now - Duration::days(1)));
        run(&strategy, &mut t, now);

        // Same instant: forward window is empty but the next run goes backward.
        assert!(run(&strategy, &mut t, now).is_none());
        let window = run(&strategy, &mut t, now).unwrap();
        assert_eq!(window.tags.scan_type, ScanType::Backward);
    }
}
