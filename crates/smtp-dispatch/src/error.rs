use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Problems detected before any message is dispatched.
/// All of these are fatal for the process.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("{}: not a directory", path.display())]
    NotADirectory { path: PathBuf },
    #[error("failed to list {}: {reason}", path.display())]
    Listing { path: PathBuf, reason: String },
    #[error("failed to read account file {}: {error}", path.display())]
    ReadAccounts {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },
    #[error("{}:{line}: expected 2 comma separated fields (address,secret) but found {found}", path.display())]
    MalformedAccount {
        path: PathBuf,
        line: usize,
        found: usize,
    },
    #[error("invalid {which} '{value}': expected YYYY-MM-DD HH:MM:SS")]
    InvalidTime { which: &'static str, value: String },
    #[error("{which} '{value}' is not a valid identifier")]
    InvalidIdentifier { which: &'static str, value: String },
    #[error("--thread must be at least 1")]
    ZeroThreads,
    #[error("--time-threshold {minutes} minutes is out of range")]
    TimeThresholdOutOfRange { minutes: u64 },
    #[error("a deadline {after:?} from now is out of range")]
    DeadlineOutOfRange { after: Duration },
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),
    #[error("query against {endpoint} failed: {reason}")]
    Query { endpoint: String, reason: String },
}

/// Reasons a run ends without producing a summary.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error("authentication failed, aborting run: {reason}")]
    AuthenticationFatal { reason: String },
}
