use anyhow::Context;
use chrono::Local;
use clap::{Parser, Subcommand};
use rfc5321::SmtpClientTimeouts;
use smtp_dispatch::logging::{register_panic_hook, DiagnosticFormat, LoggingConfig};
use smtp_dispatch::source::{
    parse_time_literal, ClickHouseConfig, ClickHouseQuery, DirSource, MessageSource, ObjectStore,
    ObjectStoreConfig, ReplaySource,
};
use smtp_dispatch::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(about = "Dispatch raw eml messages to an SMTP server", version)]
struct Opt {
    /// Envelope sender, used when no account file is given
    #[arg(long, global = true, default_value = "from@example.com")]
    from: String,

    /// Envelope recipient for every message
    #[arg(long, global = true, default_value = "to@example.com")]
    to: String,

    /// The SMTP server to deliver to
    #[arg(long, global = true, default_value = "127.0.0.1")]
    server: String,

    /// Port 25 is spoken in plaintext, any other port uses
    /// implicit TLS unless overridden by --tls
    #[arg(long, global = true, default_value_t = 25)]
    port: u16,

    /// Delay before each message is admitted, in --sleep-unit units
    #[arg(long, global = true, default_value_t = 0)]
    sleep: u64,

    #[arg(long, alias = "sleepUnit", global = true, value_enum, default_value_t = SleepUnit::S)]
    sleep_unit: SleepUnit,

    /// Stop admitting new messages after this many minutes.
    /// 0 means run until the source is exhausted.
    #[arg(long, alias = "timeThreshold", global = true, default_value_t = 0)]
    time_threshold: u64,

    /// A file of `address,secret` lines; senders are rotated
    /// through it in order
    #[arg(long, alias = "accountConfig", global = true)]
    account_config: Option<PathBuf>,

    /// Maximum number of concurrent sessions
    #[arg(long, global = true, default_value_t = 1)]
    thread: usize,

    /// The name to present in EHLO/HELO
    #[arg(long, global = true, default_value = "localhost")]
    ehlo_name: String,

    #[arg(long, global = true, value_enum, default_value_t = TlsMode::Auto)]
    tls: TlsMode,

    /// Do not verify the server certificate. Only use this against
    /// lab or test servers.
    #[arg(long, global = true)]
    insecure_skip_verify: bool,

    /// Use this many seconds as the timeout for every SMTP step
    #[arg(long, global = true)]
    smtp_timeout: Option<u64>,

    /// When stopped early, wait for in-flight sessions to complete
    /// before summarizing
    #[arg(long, global = true)]
    wait_for_inflight: bool,

    /// The format of the diagnostic log. Its verbosity is controlled
    /// by the SMTP_DISPATCH_LOG environment variable.
    #[arg(long, global = true, value_enum, default_value_t = DiagnosticFormat::Json)]
    diag_format: DiagnosticFormat,

    /// Write diagnostics to hourly rotated files in this directory
    #[arg(long, global = true)]
    diag_log_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: SubCommand,
}

#[derive(Debug, Subcommand)]
enum SubCommand {
    /// Send every eml file in a directory without authenticating
    #[command(alias = "Anonymous")]
    Anonymous(AnonymousCommand),
    /// Authenticate before sending every eml file in a directory
    #[command(aliases = ["Login", "authenticated"])]
    Login(LoginCommand),
    /// Replay captured messages listed in ClickHouse from MinIO/S3
    #[command(alias = "Replay")]
    Replay(ReplayCommand),
}

#[derive(Debug, clap::Args)]
struct AnonymousCommand {
    /// The directory holding the eml files
    #[arg(long)]
    dir: PathBuf,
}

#[derive(Debug, clap::Args)]
struct LoginCommand {
    /// Password for --from, used when no account file is given
    #[arg(long, default_value = "")]
    password: String,

    /// The directory holding the eml files
    #[arg(long)]
    dir: PathBuf,

    /// Abort the whole run on the first authentication failure
    #[arg(long)]
    abort_on_auth_failure: bool,
}

#[derive(Debug, clap::Args)]
struct ReplayCommand {
    #[arg(long, default_value = "127.0.0.1")]
    minio: String,
    #[arg(long, alias = "minioPort", default_value_t = 7000)]
    minio_port: u16,
    #[arg(long, alias = "minioUser", default_value = "minioadmin")]
    minio_user: String,
    #[arg(long, alias = "minioPassword", default_value = "minioadmin")]
    minio_password: String,
    #[arg(long, default_value = "eml")]
    minio_bucket: String,
    #[arg(long, default_value = "us-east-1")]
    minio_region: String,

    /// ClickHouse host; queried over its HTTP interface
    #[arg(long, default_value = "127.0.0.1")]
    clickhouse: String,
    #[arg(long, alias = "ckPort", default_value_t = 8123)]
    ck_port: u16,
    #[arg(long, alias = "ckUser", default_value = "default")]
    ck_user: String,
    #[arg(long, alias = "ckPassword", default_value = "password")]
    ck_password: String,
    #[arg(long, alias = "ckDatabase", default_value = "default")]
    ck_database: String,
    #[arg(long, default_value = "primitive_mail")]
    ck_table: String,
    /// Column holding the base64 encoded object key
    #[arg(long, default_value = "emlFile")]
    ck_column: String,
    #[arg(long, default_value = "ts")]
    ck_time_column: String,

    /// Start of the capture window, YYYY-MM-DD HH:MM:SS (inclusive)
    #[arg(long, alias = "startTime", default_value = "2006-01-02 15:04:05")]
    start_time: String,
    /// End of the capture window, YYYY-MM-DD HH:MM:SS (inclusive).
    /// Defaults to now.
    #[arg(long, alias = "endTime")]
    end_time: Option<String>,
}

impl ReplayCommand {
    fn source(&self) -> Result<ReplaySource, SetupError> {
        let start = parse_time_literal("start time", &self.start_time)?;
        let end = match &self.end_time {
            Some(end) => parse_time_literal("end time", end)?,
            None => Local::now().naive_local(),
        };

        let index = ClickHouseQuery::new(ClickHouseConfig {
            host: self.clickhouse.clone(),
            port: self.ck_port,
            user: self.ck_user.clone(),
            password: self.ck_password.clone(),
            database: self.ck_database.clone(),
            table: self.ck_table.clone(),
            column: self.ck_column.clone(),
            time_column: self.ck_time_column.clone(),
            start,
            end,
        })?;
        let store = ObjectStore::new(ObjectStoreConfig {
            host: self.minio.clone(),
            port: self.minio_port,
            access_key: self.minio_user.clone(),
            secret_key: self.minio_password.clone(),
            bucket: self.minio_bucket.clone(),
            region: self.minio_region.clone(),
        })?;
        Ok(ReplaySource::new(index, store))
    }
}

impl SubCommand {
    fn mode(&self) -> Mode {
        match self {
            Self::Anonymous(_) => Mode::Anonymous,
            Self::Login(login) => Mode::Authenticated {
                password: login.password.clone(),
                abort_on_auth_failure: login.abort_on_auth_failure,
            },
            Self::Replay(_) => Mode::Replay,
        }
    }

    fn source(&self) -> Result<Arc<dyn MessageSource>, SetupError> {
        let source: Arc<dyn MessageSource> = match self {
            Self::Anonymous(cmd) => Arc::new(DirSource::new(&cmd.dir)?),
            Self::Login(cmd) => Arc::new(DirSource::new(&cmd.dir)?),
            Self::Replay(cmd) => Arc::new(cmd.source()?),
        };
        Ok(source)
    }
}

impl Opt {
    fn run_config(&self) -> anyhow::Result<RunConfig> {
        if self.thread == 0 {
            return Err(SetupError::ZeroThreads.into());
        }

        let mut target = DispatchTarget::new(self.server.as_str(), self.port);
        target.tls_mode = self.tls;
        target.insecure = self.insecure_skip_verify;
        target.sender = self.from.clone();
        target.recipient = self.to.clone();
        target.ehlo_name = self.ehlo_name.clone();
        if let Some(secs) = self.smtp_timeout {
            target.timeouts = SmtpClientTimeouts::uniform(Duration::from_secs(secs));
        }
        if target.use_tls() && target.insecure {
            tracing::warn!("server certificate verification is disabled");
        }

        let mode = self.cmd.mode();
        if let Mode::Authenticated { password, .. } = &mode {
            if password.is_empty() && self.account_config.is_none() {
                tracing::warn!("login mode without --password or --account-config");
            }
        }

        let mut config = RunConfig::new(target, mode);
        if let Some(path) = &self.account_config {
            config.accounts = load_accounts(path)?;
            tracing::info!(
                "loaded {} accounts from {}",
                config.accounts.len(),
                path.display()
            );
        }
        config.max_in_flight = self.thread;
        config.pacing = self.sleep_unit.pacing(self.sleep);
        if self.time_threshold > 0 {
            let secs = self.time_threshold.checked_mul(60).ok_or(
                SetupError::TimeThresholdOutOfRange {
                    minutes: self.time_threshold,
                },
            )?;
            config.time_threshold = Some(Duration::from_secs(secs));
        }
        config.wait_for_inflight = self.wait_for_inflight;
        Ok(config)
    }

    async fn run(&self) -> anyhow::Result<RunSummary> {
        let config = self.run_config()?;
        let source = self.cmd.source()?;

        let cancel = CancelToken::new();
        listen_for_signals(cancel.clone())?;

        let run = DispatchRun::new(config, source, cancel);
        Ok(run.run().await?)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();

    let _log_guard = LoggingConfig {
        log_dir: opts.diag_log_dir.clone(),
        diag_format: opts.diag_format,
        ..Default::default()
    }
    .init()
    .context("initialize logging")?;
    register_panic_hook();

    let summary = opts.run().await?;
    summary
        .print(&mut std::io::stdout().lock())
        .context("writing summary")?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_consistent() {
        Opt::command().debug_assert();
    }

    #[test]
    fn legacy_spellings_are_accepted() {
        let opts = Opt::try_parse_from([
            "smtp-dispatch",
            "--server",
            "10.0.0.1",
            "--sleepUnit",
            "ms",
            "--sleep",
            "5",
            "--timeThreshold",
            "2",
            "--thread",
            "4",
            "Login",
            "--password",
            "pw",
            "--dir",
            "/tmp",
        ])
        .unwrap();
        let config = opts.run_config().unwrap();
        k9::assert_equal!(config.pacing, Duration::from_millis(5));
        k9::assert_equal!(config.time_threshold, Some(Duration::from_secs(120)));
        k9::assert_equal!(config.max_in_flight, 4);
        k9::assert_equal!(config.target.host, "10.0.0.1");
        k9::assert_equal!(
            config.mode,
            Mode::Authenticated {
                password: "pw".to_string(),
                abort_on_auth_failure: false
            }
        );
    }

    #[test]
    fn defaults() {
        let opts = Opt::try_parse_from(["smtp-dispatch", "anonymous", "--dir", "/tmp"]).unwrap();
        let config = opts.run_config().unwrap();
        k9::assert_equal!(config.target.sender, "from@example.com");
        k9::assert_equal!(config.target.recipient, "to@example.com");
        k9::assert_equal!(config.target.port, 25);
        assert!(!config.target.use_tls());
        k9::assert_equal!(config.max_in_flight, 1);
        k9::assert_equal!(config.pacing, Duration::ZERO);
        k9::assert_equal!(config.time_threshold, None);
        k9::assert_equal!(config.mode, Mode::Anonymous);
    }

    #[test]
    fn zero_threads_is_rejected() {
        let opts =
            Opt::try_parse_from(["smtp-dispatch", "--thread", "0", "anonymous", "--dir", "/tmp"])
                .unwrap();
        assert!(opts.run_config().is_err());
    }

    #[test]
    fn oversized_time_threshold_is_rejected() {
        let threshold = u64::MAX.to_string();
        let opts = Opt::try_parse_from([
            "smtp-dispatch",
            "--time-threshold",
            threshold.as_str(),
            "anonymous",
            "--dir",
            "/tmp",
        ])
        .unwrap();
        let err = opts.run_config().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SetupError>(),
            Some(SetupError::TimeThresholdOutOfRange { .. })
        ));
    }

    #[test]
    fn dir_is_required() {
        assert!(Opt::try_parse_from(["smtp-dispatch", "anonymous"]).is_err());
    }

    #[test]
    fn replay_rejects_bad_time() {
        let opts = Opt::try_parse_from([
            "smtp-dispatch",
            "replay",
            "--start-time",
            "last tuesday",
        ])
        .unwrap();
        assert!(matches!(
            opts.cmd.source(),
            Err(SetupError::InvalidTime { .. })
        ));
    }
}
