use crate::cancel::{CancelToken, StopReason};
use crate::error::SetupError;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};

#[derive(Debug, Clone)]
pub struct GovernorConfig {
    /// Upper bound on concurrently running units; must be >= 1
    pub max_in_flight: usize,
    /// Delay applied before each admission
    pub pacing: Duration,
    /// After a stop, wait for already admitted units to finish
    /// instead of returning immediately
    pub wait_for_inflight: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GovernorReport {
    pub admitted: usize,
    pub total: usize,
    pub stop_reason: Option<StopReason>,
    pub peak_in_flight: usize,
    /// Whether every admitted unit had finished when `run` returned
    pub drained: bool,
}

/// Admits units of work one at a time, in order, while keeping
/// at most `max_in_flight` of them running.
#[derive(Debug)]
pub struct ConcurrencyGovernor {
    config: GovernorConfig,
    slots: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

/// Tracks a running unit for the peak in-flight gauge
struct InFlight {
    in_flight: Arc<AtomicUsize>,
}

impl InFlight {
    fn enter(in_flight: &Arc<AtomicUsize>, peak: &AtomicUsize) -> Self {
        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self {
            in_flight: Arc::clone(in_flight),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConcurrencyGovernor {
    pub fn new(config: GovernorConfig) -> Result<Self, SetupError> {
        if config.max_in_flight == 0 {
            return Err(SetupError::ZeroThreads);
        }
        Ok(Self {
            slots: Arc::new(Semaphore::new(config.max_in_flight)),
            config,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Admit `admit(index, item)` for each item in order.
    ///
    /// Cancellation is checked before pacing and again once a slot
    /// has been obtained. After a stop, units that were already
    /// admitted keep running; they are detached rather than aborted
    /// unless `wait_for_inflight` is set. Without a stop, returns
    /// once every admitted unit has finished.
    pub async fn run<T, F, Fut>(
        &self,
        items: Vec<T>,
        cancel: &CancelToken,
        mut admit: F,
    ) -> GovernorReport
    where
        F: FnMut(usize, T) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let total = items.len();
        let mut admitted = 0;
        let mut stop_reason = None;
        let mut units = JoinSet::new();

        for (index, item) in items.into_iter().enumerate() {
            if let Some(reason) = cancel.stop_reason() {
                stop_reason.replace(reason);
                break;
            }

            if !self.config.pacing.is_zero() {
                tokio::time::sleep(self.config.pacing).await;
            }

            let permit = match Arc::clone(&self.slots).acquire_owned().await {
                Ok(permit) => permit,
                Err(err) => {
                    tracing::error!("admission slots closed: {err:#}");
                    break;
                }
            };

            if let Some(reason) = cancel.stop_reason() {
                stop_reason.replace(reason);
                break;
            }

            let unit = admit(index, item);
            let in_flight = InFlight::enter(&self.in_flight, &self.peak);
            units.spawn(async move {
                let _permit = permit;
                let _in_flight = in_flight;
                unit.await;
            });
            admitted += 1;

            while let Some(res) = units.try_join_next() {
                log_join_failure(res);
            }
        }

        let drained = match &stop_reason {
            Some(reason) if !self.config.wait_for_inflight => {
                tracing::warn!(
                    "{reason}: stopped after admitting {admitted} of {total}; \
                     {} still in flight",
                    units.len()
                );
                units.detach_all();
                false
            }
            _ => {
                if let Some(reason) = &stop_reason {
                    tracing::warn!(
                        "{reason}: stopped after admitting {admitted} of {total}; \
                         waiting for {} in flight",
                        units.len()
                    );
                }
                while let Some(res) = units.join_next().await {
                    log_join_failure(res);
                }
                true
            }
        };

        GovernorReport {
            admitted,
            total,
            stop_reason,
            peak_in_flight: self.peak.load(Ordering::SeqCst),
            drained,
        }
    }
}

fn log_join_failure(res: Result<(), JoinError>) {
    if let Err(err) = res {
        if err.is_panic() {
            tracing::error!("dispatch unit panicked: {err:#}");
        } else {
            tracing::error!("dispatch unit failed: {err:#}");
        }
    }
}
