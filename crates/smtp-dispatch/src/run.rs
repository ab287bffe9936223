use crate::accounts::{Account, AccountRotator};
use crate::cancel::{CancelToken, StopReason};
use crate::error::RunError;
use crate::governor::{ConcurrencyGovernor, GovernorConfig};
use crate::session::{AttemptResult, Outcome, SessionDispatcher, Stage};
use crate::source::MessageSource;
use crate::stats::{StatsAggregator, StatsSummary};
use crate::target::DispatchTarget;
use chrono::{DateTime, Local, Utc};
use futures::FutureExt;
use num_format::{Locale, ToFormattedString};
use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone, PartialEq, Eq)]
pub enum Mode {
    /// No authentication; the sender is the fixed or rotated address
    Anonymous,
    /// Every attempt authenticates, either as the fixed sender with
    /// `password` or as the rotated account
    Authenticated {
        password: String,
        abort_on_auth_failure: bool,
    },
    /// Messages are replayed from the analytical/object stores and
    /// always sent from the fixed sender
    Replay,
}

impl std::fmt::Debug for Mode {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Anonymous => write!(fmt, "Anonymous"),
            Self::Authenticated {
                abort_on_auth_failure,
                ..
            } => fmt
                .debug_struct("Authenticated")
                .field("abort_on_auth_failure", abort_on_auth_failure)
                .finish(),
            Self::Replay => write!(fmt, "Replay"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub target: DispatchTarget,
    pub mode: Mode,
    pub accounts: Vec<Account>,
    pub max_in_flight: usize,
    pub pacing: Duration,
    /// Stop admitting once this much time has passed
    pub time_threshold: Option<Duration>,
    pub wait_for_inflight: bool,
}

impl RunConfig {
    pub fn new(target: DispatchTarget, mode: Mode) -> Self {
        Self {
            target,
            mode,
            accounts: vec![],
            max_in_flight: 1,
            pacing: Duration::ZERO,
            time_threshold: None,
            wait_for_inflight: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub started: DateTime<Utc>,
    pub elapsed: Duration,
    pub admitted: usize,
    pub total: usize,
    pub stop_reason: Option<StopReason>,
    pub peak_in_flight: usize,
    pub stats: StatsSummary,
}

fn human(duration: Duration) -> humantime::FormattedDuration {
    // Sub-microsecond detail is noise at this scale
    humantime::format_duration(Duration::from_micros(duration.as_micros() as u64))
}

fn human_opt(duration: Option<Duration>) -> String {
    duration
        .map(|d| human(d).to_string())
        .unwrap_or_else(|| "-".to_string())
}

impl RunSummary {
    pub fn log(&self) {
        let stats = &self.stats;
        tracing::info!(
            started = %self.started,
            elapsed = %human(self.elapsed),
            admitted = self.admitted,
            total = self.total,
            recorded = stats.count,
            succeeded = stats.succeeded,
            failed = stats.failed,
            average = %human_opt(stats.average),
            max = %human_opt(stats.max),
            stop_reason = ?self.stop_reason,
            "run complete"
        );
    }

    pub fn print<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        let stats = &self.stats;
        let count = |n: usize| n.to_formatted_string(&Locale::en);

        writeln!(
            out,
            "started at {}, ran for {}",
            self.started.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
            human(self.elapsed)
        )?;
        if let Some(reason) = &self.stop_reason {
            writeln!(out, "stopped early: {reason}")?;
        }
        writeln!(
            out,
            "admitted {} of {} messages ({} recorded, peak {} in flight)",
            count(self.admitted),
            count(self.total),
            count(stats.count),
            self.peak_in_flight
        )?;
        writeln!(
            out,
            "succeeded {}, failed {}",
            count(stats.succeeded),
            count(stats.failed)
        )?;
        for (stage, n) in &stats.failures_by_stage {
            writeln!(out, "  {stage}: {}", count(*n))?;
        }
        writeln!(
            out,
            "latency: total {}, avg {}, min {}, max {}",
            human(stats.total),
            human_opt(stats.average),
            human_opt(stats.min),
            human_opt(stats.max)
        )?;
        writeln!(
            out,
            "latency percentiles: p50 {}, p90 {}, p99 {}",
            human_opt(stats.p50),
            human_opt(stats.p90),
            human_opt(stats.p99)
        )?;
        if !self.elapsed.is_zero() && stats.count > 0 {
            let per_second = (stats.count as f64 / self.elapsed.as_secs_f64()) as usize;
            writeln!(
                out,
                "overall rate: {} msgs/s, {} msgs/minute",
                count(per_second),
                count(per_second * 60)
            )?;
        }
        Ok(())
    }
}

/// Drives one run: lists the source, admits a unit per message
/// through the governor and summarizes the recorded attempts.
pub struct DispatchRun {
    config: RunConfig,
    source: Arc<dyn MessageSource>,
    stats: Arc<StatsAggregator>,
    cancel: CancelToken,
}

/// Everything an admitted unit needs, cloned per admission
#[derive(Clone)]
struct UnitContext {
    source: Arc<dyn MessageSource>,
    dispatcher: Arc<SessionDispatcher>,
    stats: Arc<StatsAggregator>,
    cancel: CancelToken,
    abort_on_auth_failure: bool,
}

impl DispatchRun {
    pub fn new(config: RunConfig, source: Arc<dyn MessageSource>, cancel: CancelToken) -> Self {
        Self {
            config,
            source,
            stats: Arc::new(StatsAggregator::new()),
            cancel,
        }
    }

    pub fn stats(&self) -> &Arc<StatsAggregator> {
        &self.stats
    }

    fn rotator(&self) -> Option<AccountRotator> {
        let sender = &self.config.target.sender;
        match &self.config.mode {
            Mode::Replay => {
                if !self.config.accounts.is_empty() {
                    tracing::warn!("replay mode does not rotate accounts; ignoring account file");
                }
                None
            }
            Mode::Anonymous => Some(AccountRotator::new(
                self.config.accounts.clone(),
                Account::new(sender.as_str(), ""),
            )),
            Mode::Authenticated { password, .. } => Some(AccountRotator::new(
                self.config.accounts.clone(),
                Account::new(sender.as_str(), password.as_str()),
            )),
        }
    }

    pub async fn run(&self) -> Result<RunSummary, RunError> {
        let started = Utc::now();
        let clock = Instant::now();
        tracing::info!("starting {:?} run against {}", self.config.mode, self.config.target.address());

        let governor = ConcurrencyGovernor::new(GovernorConfig {
            max_in_flight: self.config.max_in_flight,
            pacing: self.config.pacing,
            wait_for_inflight: self.config.wait_for_inflight,
        })?;

        let ids = self.source.list().await?;
        tracing::info!("{} messages to dispatch", ids.len());

        if let Some(threshold) = self.config.time_threshold {
            tracing::info!("admission stops after {}", human(threshold));
            self.cancel.set_deadline(threshold)?;
        }

        let rotator = self.rotator();
        let authenticate = matches!(self.config.mode, Mode::Authenticated { .. });
        let context = UnitContext {
            source: Arc::clone(&self.source),
            dispatcher: Arc::new(SessionDispatcher::new(self.config.target.clone())),
            stats: Arc::clone(&self.stats),
            cancel: self.cancel.clone(),
            abort_on_auth_failure: matches!(
                self.config.mode,
                Mode::Authenticated {
                    abort_on_auth_failure: true,
                    ..
                }
            ),
        };

        let report = governor
            .run(ids, &self.cancel, |index, id| {
                // Drawn at admission so that senders follow source order
                let account = rotator.as_ref().map(|r| r.next().clone());
                let sender = account
                    .as_ref()
                    .map(|a| a.address.clone())
                    .unwrap_or_else(|| self.config.target.sender.clone());
                let auth = if authenticate { account } else { None };
                tracing::info!("admitting #{} {id} from {sender}", index + 1);
                context.clone().dispatch_one(id, sender, auth)
            })
            .await;

        if let Some(StopReason::Fatal(reason)) = &report.stop_reason {
            return Err(RunError::AuthenticationFatal {
                reason: reason.clone(),
            });
        }

        let summary = RunSummary {
            started,
            elapsed: clock.elapsed(),
            admitted: report.admitted,
            total: report.total,
            stop_reason: report.stop_reason,
            peak_in_flight: report.peak_in_flight,
            stats: self.stats.summary(),
        };
        summary.log();
        Ok(summary)
    }
}

impl UnitContext {
    async fn dispatch_one(self, id: String, sender: String, auth: Option<Account>) {
        let started = Utc::now();
        let clock = Instant::now();

        let attempt = async {
            let message = match self.source.fetch(&id).await {
                Ok(message) => message,
                Err(err) => {
                    tracing::warn!(message_ref = %id, stage = %Stage::Fetch, error = %format!("{err:#}"), "fetch failed");
                    return AttemptResult::failed(
                        &id,
                        &sender,
                        started,
                        clock.elapsed(),
                        Stage::Fetch,
                        format!("{err:#}"),
                    );
                }
            };
            self.dispatcher
                .dispatch(&message.id, &message.content, &sender, auth.as_ref())
                .await
        };

        let result = match AssertUnwindSafe(attempt).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let cause = panic_message(payload.as_ref());
                tracing::error!(message_ref = %id, stage = %Stage::Fault, "attempt panicked: {cause}");
                AttemptResult::failed(&id, &sender, started, clock.elapsed(), Stage::Fault, cause)
            }
        };

        match &result.outcome {
            Outcome::Success => {
                tracing::info!(message_ref = %id, sender = %sender, elapsed = ?result.duration, "delivered");
            }
            Outcome::Failure { stage, cause } => {
                tracing::warn!(message_ref = %id, sender = %sender, stage = %stage, error = %cause, elapsed = ?result.duration, "attempt failed");
                if *stage == Stage::Auth && self.abort_on_auth_failure {
                    tracing::error!("authentication failed for {sender}; no further messages will be admitted");
                    self.cancel
                        .fatal(format!("authentication as {sender} failed: {cause}"));
                }
            }
        }

        self.stats.record(result);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "!?".to_string()
    }
}
