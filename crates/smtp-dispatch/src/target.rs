use clap::ValueEnum;
use rfc5321::SmtpClientTimeouts;
use std::time::Duration;

/// The conventional SMTP relay port; the only port on which
/// `TlsMode::Auto` speaks plaintext.
pub const PLAINTEXT_SMTP_PORT: u16 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
#[clap(rename_all = "kebab_case")]
pub enum TlsMode {
    /// Plaintext on port 25, implicit TLS on any other port
    #[default]
    Auto,
    /// Never negotiate TLS
    Plain,
    /// Negotiate TLS immediately after connecting
    Implicit,
}

/// Where and as whom every message in a run is delivered.
#[derive(Debug, Clone)]
pub struct DispatchTarget {
    pub host: String,
    pub port: u16,
    pub tls_mode: TlsMode,
    /// Skip server certificate verification (lab use only)
    pub insecure: bool,
    pub sender: String,
    pub recipient: String,
    pub ehlo_name: String,
    pub timeouts: SmtpClientTimeouts,
}

impl DispatchTarget {
    pub fn new<H: Into<String>>(host: H, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls_mode: TlsMode::Auto,
            insecure: false,
            sender: "from@example.com".to_string(),
            recipient: "to@example.com".to_string(),
            ehlo_name: "localhost".to_string(),
            timeouts: SmtpClientTimeouts::default(),
        }
    }

    pub fn use_tls(&self) -> bool {
        match self.tls_mode {
            TlsMode::Auto => self.port != PLAINTEXT_SMTP_PORT,
            TlsMode::Plain => false,
            TlsMode::Implicit => true,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Unit applied to the inter-admission delay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
#[clap(rename_all = "lower")]
pub enum SleepUnit {
    #[default]
    S,
    Ms,
    Us,
    Ns,
}

impl SleepUnit {
    pub fn pacing(self, value: u64) -> Duration {
        match self {
            Self::S => Duration::from_secs(value),
            Self::Ms => Duration::from_millis(value),
            Self::Us => Duration::from_micros(value),
            Self::Ns => Duration::from_nanos(value),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tls_is_derived_from_port() {
        let target = DispatchTarget::new("127.0.0.1", 25);
        assert!(!target.use_tls());
        let target = DispatchTarget::new("127.0.0.1", 465);
        assert!(target.use_tls());
        let target = DispatchTarget::new("127.0.0.1", 587);
        assert!(target.use_tls());
    }

    #[test]
    fn tls_mode_overrides_port() {
        let mut target = DispatchTarget::new("127.0.0.1", 2525);
        target.tls_mode = TlsMode::Plain;
        assert!(!target.use_tls());

        let mut target = DispatchTarget::new("127.0.0.1", 25);
        target.tls_mode = TlsMode::Implicit;
        assert!(target.use_tls());
    }

    #[test]
    fn sleep_units() {
        k9::assert_equal!(SleepUnit::S.pacing(2), Duration::from_secs(2));
        k9::assert_equal!(SleepUnit::Ms.pacing(15), Duration::from_millis(15));
        k9::assert_equal!(SleepUnit::Us.pacing(7), Duration::from_micros(7));
        k9::assert_equal!(SleepUnit::Ns.pacing(0), Duration::ZERO);
    }

    #[test]
    fn sleep_unit_names() {
        k9::assert_equal!(SleepUnit::from_str("ms", false).unwrap(), SleepUnit::Ms);
        k9::assert_equal!(SleepUnit::from_str("s", false).unwrap(), SleepUnit::S);
        assert!(SleepUnit::from_str("minutes", false).is_err());
    }
}
