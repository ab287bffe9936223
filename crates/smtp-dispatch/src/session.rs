use crate::accounts::Account;
use crate::target::DispatchTarget;
use chrono::{DateTime, Utc};
use rfc5321::tokio_rustls::TlsConnector;
use rfc5321::{ClientError, SmtpClient, TlsOptions};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The step of an attempt at which it failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Fetch,
    Connect,
    Greeting,
    Auth,
    MailFrom,
    RcptTo,
    Data,
    Fault,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Connect => "connect",
            Self::Greeting => "greeting",
            Self::Auth => "auth",
            Self::MailFrom => "mail-from",
            Self::RcptTo => "rcpt-to",
            Self::Data => "data",
            Self::Fault => "fault",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure { stage: Stage, cause: String },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn failed_stage(&self) -> Option<Stage> {
        match self {
            Self::Success => None,
            Self::Failure { stage, .. } => Some(*stage),
        }
    }
}

/// The record of one delivery attempt
#[derive(Debug, Clone)]
pub struct AttemptResult {
    pub message_ref: String,
    /// The envelope sender used for the attempt
    pub sender: String,
    pub started: DateTime<Utc>,
    pub duration: Duration,
    pub outcome: Outcome,
}

impl AttemptResult {
    pub fn failed<C: std::fmt::Display>(
        message_ref: &str,
        sender: &str,
        started: DateTime<Utc>,
        duration: Duration,
        stage: Stage,
        cause: C,
    ) -> Self {
        Self {
            message_ref: message_ref.to_string(),
            sender: sender.to_string(),
            started,
            duration,
            outcome: Outcome::Failure {
                stage,
                cause: cause.to_string(),
            },
        }
    }
}

/// Performs single delivery attempts against a fixed target.
///
/// Every attempt opens its own connection; nothing is pooled or
/// shared between attempts apart from the TLS configuration.
#[derive(Clone)]
pub struct SessionDispatcher {
    target: Arc<DispatchTarget>,
    tls: Option<TlsConnector>,
}

impl std::fmt::Debug for SessionDispatcher {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("SessionDispatcher")
            .field("target", &self.target)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl SessionDispatcher {
    pub fn new(target: DispatchTarget) -> Self {
        let tls = target.use_tls().then(|| {
            TlsOptions {
                insecure: target.insecure,
            }
            .build_tls_connector()
        });
        Self {
            target: Arc::new(target),
            tls,
        }
    }

    async fn connect(&self) -> Result<SmtpClient, ClientError> {
        let target = &self.target;
        match &self.tls {
            Some(connector) => {
                SmtpClient::connect_implicit_tls(
                    &target.host,
                    target.port,
                    connector,
                    &target.host,
                    target.timeouts,
                )
                .await
            }
            None => SmtpClient::connect_plain(&target.host, target.port, target.timeouts).await,
        }
    }

    /// Deliver `content` once.
    ///
    /// Connect and greeting failures end the attempt. Later steps
    /// are attempted even if an earlier one was rejected; the outcome
    /// names the first step that failed. When `auth` is supplied the
    /// session authenticates with AUTH PLAIN before the envelope.
    pub async fn dispatch(
        &self,
        message_ref: &str,
        content: &[u8],
        sender: &str,
        auth: Option<&Account>,
    ) -> AttemptResult {
        let started = Utc::now();
        let clock = Instant::now();

        let (outcome, duration) = match self.connect().await {
            Err(err) => {
                tracing::warn!(
                    message_ref,
                    stage = %Stage::Connect,
                    error = %err,
                    "unable to connect to {}",
                    self.target.address()
                );
                (failure(Stage::Connect, err), clock.elapsed())
            }
            Ok(mut client) => {
                let outcome = self
                    .converse(&mut client, message_ref, content, sender, auth)
                    .await;
                let duration = clock.elapsed();

                if client.is_connected() {
                    if let Err(err) = client.quit().await {
                        tracing::trace!(message_ref, "QUIT: {err:#}");
                    }
                }
                client.close().await;
                (outcome, duration)
            }
        };

        AttemptResult {
            message_ref: message_ref.to_string(),
            sender: sender.to_string(),
            started,
            duration,
            outcome,
        }
    }

    async fn converse(
        &self,
        client: &mut SmtpClient,
        message_ref: &str,
        content: &[u8],
        sender: &str,
        auth: Option<&Account>,
    ) -> Outcome {
        let greeting = match client.read_banner().await {
            Ok(_) => client.ehlo(&self.target.ehlo_name).await,
            Err(err) => Err(err),
        };
        if let Err(err) = greeting {
            tracing::warn!(message_ref, stage = %Stage::Greeting, error = %err, "no session");
            return failure(Stage::Greeting, err);
        }

        let mut first_failure = None;
        let mut note = |stage: Stage, err: ClientError| {
            tracing::warn!(message_ref, stage = %stage, error = %err, "step failed");
            if first_failure.is_none() {
                first_failure.replace(failure(stage, err));
            }
        };

        if let Some(account) = auth {
            if let Err(err) = client
                .auth_plain(&account.address, Some(&account.secret))
                .await
            {
                note(Stage::Auth, err);
            }
        }

        if let Err(err) = client.mail_from(sender).await {
            note(Stage::MailFrom, err);
        }

        if let Err(err) = client.rcpt_to(&self.target.recipient).await {
            note(Stage::RcptTo, err);
        }

        // Content is only written once the server has agreed to take it
        match client.data().await {
            Ok(_) => {
                if let Err(err) = client.send_data(content).await {
                    note(Stage::Data, err);
                }
            }
            Err(err) => note(Stage::Data, err),
        }

        first_failure.unwrap_or(Outcome::Success)
    }
}

fn failure(stage: Stage, err: ClientError) -> Outcome {
    Outcome::Failure {
        stage,
        cause: format!("{err:#}"),
    }
}
