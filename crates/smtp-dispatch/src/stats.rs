use crate::session::{AttemptResult, Stage};
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Duration;

/// Collects attempt results from concurrently running units
#[derive(Debug, Default)]
pub struct StatsAggregator {
    results: Mutex<Vec<AttemptResult>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSummary {
    pub count: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failures_by_stage: BTreeMap<Stage, usize>,
    pub total: Duration,
    /// `None` when nothing was recorded
    pub average: Option<Duration>,
    pub min: Option<Duration>,
    pub max: Option<Duration>,
    pub p50: Option<Duration>,
    pub p90: Option<Duration>,
    pub p99: Option<Duration>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, result: AttemptResult) {
        self.results.lock().push(result);
    }

    pub fn len(&self) -> usize {
        self.results.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.lock().is_empty()
    }

    /// A copy of everything recorded so far
    pub fn results(&self) -> Vec<AttemptResult> {
        self.results.lock().clone()
    }

    pub fn summary(&self) -> StatsSummary {
        let results = self.results.lock();
        summarize(&results)
    }
}

fn summarize(results: &[AttemptResult]) -> StatsSummary {
    let mut summary = StatsSummary {
        count: results.len(),
        ..Default::default()
    };

    // Microsecond resolution, 3 significant figures; grows on record
    let mut histogram = match Histogram::<u64>::new(3) {
        Ok(h) => Some(h),
        Err(err) => {
            tracing::error!("unable to create latency histogram: {err:#}");
            None
        }
    };

    for result in results {
        match result.outcome.failed_stage() {
            None => summary.succeeded += 1,
            Some(stage) => {
                summary.failed += 1;
                *summary.failures_by_stage.entry(stage).or_insert(0) += 1;
            }
        }

        summary.total += result.duration;
        summary.max = summary.max.max(Some(result.duration));
        summary.min = Some(match summary.min {
            Some(min) => min.min(result.duration),
            None => result.duration,
        });
        if let Some(h) = histogram.as_mut() {
            let micros = result.duration.as_micros().try_into().unwrap_or(u64::MAX);
            if let Err(err) = h.record(micros) {
                tracing::error!("unable to record latency {micros}us: {err:#}");
            }
        }
    }

    if summary.count > 0 {
        summary.average = Some(summary.total / summary.count as u32);
        if let Some(h) = &histogram {
            let quantile = |q: f64| Some(Duration::from_micros(h.value_at_quantile(q)));
            summary.p50 = quantile(0.5);
            summary.p90 = quantile(0.9);
            summary.p99 = quantile(0.99);
        }
    }

    summary
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::session::Outcome;
    use chrono::Utc;
    use std::sync::Arc;

    fn result(ms: u64, outcome: Outcome) -> AttemptResult {
        AttemptResult {
            message_ref: format!("{ms}.eml"),
            sender: "from@example.com".to_string(),
            started: Utc::now(),
            duration: Duration::from_millis(ms),
            outcome,
        }
    }

    fn failed(ms: u64, stage: Stage) -> AttemptResult {
        result(
            ms,
            Outcome::Failure {
                stage,
                cause: "nope".to_string(),
            },
        )
    }

    #[test]
    fn empty_summary_has_no_average() {
        let stats = StatsAggregator::new();
        let summary = stats.summary();
        k9::assert_equal!(summary.count, 0);
        k9::assert_equal!(summary.total, Duration::ZERO);
        k9::assert_equal!(summary.average, None);
        k9::assert_equal!(summary.max, None);
        k9::assert_equal!(summary.p50, None);
    }

    #[test]
    fn aggregates() {
        let stats = StatsAggregator::new();
        stats.record(result(10, Outcome::Success));
        stats.record(result(30, Outcome::Success));
        stats.record(failed(20, Stage::Connect));
        stats.record(failed(40, Stage::Connect));
        stats.record(failed(50, Stage::RcptTo));

        let summary = stats.summary();
        k9::assert_equal!(summary.count, 5);
        k9::assert_equal!(summary.succeeded, 2);
        k9::assert_equal!(summary.failed, 3);
        k9::assert_equal!(
            summary.failures_by_stage,
            BTreeMap::from([(Stage::Connect, 2), (Stage::RcptTo, 1)])
        );
        k9::assert_equal!(summary.total, Duration::from_millis(150));
        k9::assert_equal!(summary.average, Some(Duration::from_millis(30)));
        k9::assert_equal!(summary.min, Some(Duration::from_millis(10)));
        k9::assert_equal!(summary.max, Some(Duration::from_millis(50)));

        // 3 significant figures
        let p50 = summary.p50.unwrap().as_micros();
        assert!((29_900..=30_100).contains(&p50), "{p50}");
        let p99 = summary.p99.unwrap().as_micros();
        assert!((49_900..=50_100).contains(&p99), "{p99}");
    }

    #[test]
    fn percentiles_track_recorded_latencies() {
        let stats = StatsAggregator::new();
        for secs in 1..=100 {
            stats.record(result(secs * 1000, Outcome::Success));
        }

        let summary = stats.summary();
        let within = |actual: Option<Duration>, expected: Duration| {
            let actual = actual.unwrap();
            let slack = expected / 100;
            assert!(
                actual + slack >= expected && actual <= expected + slack,
                "{actual:?} not within 1% of {expected:?}"
            );
        };
        within(summary.p50, Duration::from_secs(50));
        within(summary.p90, Duration::from_secs(90));
        within(summary.p99, Duration::from_secs(99));
        k9::assert_equal!(summary.max, Some(Duration::from_secs(100)));
    }

    #[test]
    fn concurrent_producers() {
        let stats = Arc::new(StatsAggregator::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for ms in 0..100 {
                        stats.record(result(ms, Outcome::Success));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        k9::assert_equal!(stats.len(), 800);
        k9::assert_equal!(stats.summary().succeeded, 800);
    }
}
