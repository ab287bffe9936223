//! Bulk SMTP dispatch: sends pre-formatted messages to a single
//! SMTP endpoint from many concurrent sessions, for load testing
//! and replaying captured mail.
pub mod accounts;
pub mod cancel;
pub mod error;
pub mod governor;
pub mod logging;
pub mod run;
pub mod session;
pub mod source;
pub mod stats;
pub mod target;

#[cfg(test)]
mod test_support;

pub use accounts::{load_accounts, Account, AccountRotator};
pub use cancel::{listen_for_signals, CancelToken, StopReason};
pub use error::{RunError, SetupError};
pub use governor::{ConcurrencyGovernor, GovernorConfig, GovernorReport};
pub use run::{DispatchRun, Mode, RunConfig, RunSummary};
pub use session::{AttemptResult, Outcome, SessionDispatcher, Stage};
pub use stats::{StatsAggregator, StatsSummary};
pub use target::{DispatchTarget, SleepUnit, TlsMode};
