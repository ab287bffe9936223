use crate::SmtpClientTimeouts;
use std::time::Duration;

/// The subset of RFC 5321 verbs issued by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ehlo(String),
    Helo(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    DataDot,
    Quit,
    Auth {
        sasl_mech: String,
        initial_response: Option<String>,
    },
}

impl Command {
    pub fn encode(&self) -> String {
        match self {
            Self::Ehlo(domain) => format!("EHLO {domain}\r\n"),
            Self::Helo(domain) => format!("HELO {domain}\r\n"),
            Self::MailFrom(address) => format!("MAIL FROM:<{address}>\r\n"),
            Self::RcptTo(address) => format!("RCPT TO:<{address}>\r\n"),
            Self::Data => "DATA\r\n".to_string(),
            Self::DataDot => ".\r\n".to_string(),
            Self::Quit => "QUIT\r\n".to_string(),
            Self::Auth {
                sasl_mech,
                initial_response: None,
            } => format!("AUTH {sasl_mech}\r\n"),
            Self::Auth {
                sasl_mech,
                initial_response: Some(resp),
            } => format!("AUTH {sasl_mech} {resp}\r\n"),
        }
    }

    /// The encoded form with credentials masked, suitable for logs
    pub fn redacted(&self) -> String {
        match self {
            Self::Auth {
                sasl_mech,
                initial_response: Some(_),
            } => format!("AUTH {sasl_mech} <redacted>"),
            cmd => cmd.encode().trim_end().to_string(),
        }
    }

    /// Timeouts for reading the response
    pub fn client_timeout(&self, timeouts: &SmtpClientTimeouts) -> Duration {
        match self {
            Self::Helo(_) | Self::Ehlo(_) => timeouts.ehlo_timeout,
            Self::MailFrom(_) => timeouts.mail_from_timeout,
            Self::RcptTo(_) => timeouts.rcpt_to_timeout,
            Self::Data => timeouts.data_timeout,
            Self::DataDot => timeouts.data_dot_timeout,
            Self::Quit => timeouts.idle_timeout,
            Self::Auth { .. } => timeouts.auth_timeout,
        }
    }

    /// Timeouts for writing the request
    pub fn client_timeout_request(&self, timeouts: &SmtpClientTimeouts) -> Duration {
        let one_minute = Duration::from_secs(60);
        self.client_timeout(timeouts).min(one_minute)
    }
}
