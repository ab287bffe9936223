//! Cooperative cancellation for a dispatch run.
//!
//! Cancellation never interrupts an attempt that is already in
//! flight. The admission loop polls `CancelToken::stop_reason`
//! between admissions and stops handing out new work once any
//! of the stop conditions holds.
use crate::error::SetupError;
use anyhow::Context;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal::unix::SignalKind;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// SIGINT/SIGTERM, or an explicit `interrupt()`
    Interrupted,
    /// The configured time threshold elapsed
    TimeThreshold,
    /// An attempt requested that the whole run be aborted
    Fatal(String),
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Interrupted => write!(fmt, "interrupted"),
            Self::TimeThreshold => write!(fmt, "time threshold reached"),
            Self::Fatal(reason) => write!(fmt, "fatal: {reason}"),
        }
    }
}

#[derive(Debug, Default)]
struct CancelState {
    interrupted: AtomicBool,
    fatal: Mutex<Option<String>>,
    deadline: Mutex<Option<Instant>>,
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.state.interrupted.store(true, Ordering::SeqCst);
    }

    /// Abort the run. The first reason recorded wins.
    pub fn fatal<S: Into<String>>(&self, reason: S) {
        let mut fatal = self.state.fatal.lock();
        if fatal.is_none() {
            fatal.replace(reason.into());
        }
    }

    /// Stop admitting once `after` has elapsed from now
    pub fn set_deadline(&self, after: Duration) -> Result<(), SetupError> {
        let deadline = Instant::now()
            .checked_add(after)
            .ok_or(SetupError::DeadlineOutOfRange { after })?;
        self.state.deadline.lock().replace(deadline);
        Ok(())
    }

    /// Fatal escalation outranks an interrupt, which outranks
    /// the time threshold.
    pub fn stop_reason(&self) -> Option<StopReason> {
        if let Some(reason) = self.state.fatal.lock().as_ref() {
            return Some(StopReason::Fatal(reason.clone()));
        }
        if self.state.interrupted.load(Ordering::SeqCst) {
            return Some(StopReason::Interrupted);
        }
        match *self.state.deadline.lock() {
            Some(deadline) if Instant::now() >= deadline => Some(StopReason::TimeThreshold),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.stop_reason().is_some()
    }
}

/// Interrupt `token` when the process receives SIGINT or SIGTERM.
/// Must be called from within the runtime.
pub fn listen_for_signals(token: CancelToken) -> anyhow::Result<JoinHandle<()>> {
    let mut sig_term =
        tokio::signal::unix::signal(SignalKind::terminate()).context("listen for SIGTERM")?;

    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = sig_term.recv() => {}
            res = tokio::signal::ctrl_c() => {
                if let Err(err) = res {
                    tracing::error!("unable to listen for SIGINT: {err:#}");
                    return;
                }
            }
        };
        tracing::info!("interrupt received, no further messages will be admitted");
        token.interrupt();
    }))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fresh_token_is_not_cancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        k9::assert_equal!(token.stop_reason(), None);
    }

    #[test]
    fn interrupt_is_shared_between_clones() {
        let token = CancelToken::new();
        let other = token.clone();
        other.interrupt();
        k9::assert_equal!(token.stop_reason(), Some(StopReason::Interrupted));
    }

    #[test]
    fn first_fatal_reason_wins() {
        let token = CancelToken::new();
        token.interrupt();
        token.fatal("bad credentials for a@example.com");
        token.fatal("something else");
        k9::assert_equal!(
            token.stop_reason(),
            Some(StopReason::Fatal(
                "bad credentials for a@example.com".to_string()
            ))
        );
    }

    #[test]
    fn deadline() {
        let token = CancelToken::new();
        token.set_deadline(Duration::from_secs(3600)).unwrap();
        assert!(!token.is_cancelled());
        token.set_deadline(Duration::ZERO).unwrap();
        k9::assert_equal!(token.stop_reason(), Some(StopReason::TimeThreshold));
    }

    #[test]
    fn unrepresentable_deadline_is_rejected() {
        let token = CancelToken::new();
        assert!(matches!(
            token.set_deadline(Duration::MAX),
            Err(SetupError::DeadlineOutOfRange { .. })
        ));
        k9::assert_equal!(token.stop_reason(), None);
    }
}
