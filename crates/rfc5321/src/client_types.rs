use crate::client::ClientError;
use std::time::Duration;

/// Upper bounds for each phase of a client session.
/// Every network operation performed by `SmtpClient` is wrapped
/// in one of these.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SmtpClientTimeouts {
    pub connect_timeout: Duration,
    pub banner_timeout: Duration,
    pub ehlo_timeout: Duration,
    pub auth_timeout: Duration,
    pub mail_from_timeout: Duration,
    pub rcpt_to_timeout: Duration,
    pub data_timeout: Duration,
    pub data_dot_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for SmtpClientTimeouts {
    fn default() -> Self {
        Self {
            connect_timeout: Self::default_connect_timeout(),
            banner_timeout: Self::default_banner_timeout(),
            ehlo_timeout: Self::default_ehlo_timeout(),
            auth_timeout: Self::default_auth_timeout(),
            mail_from_timeout: Self::default_mail_from_timeout(),
            rcpt_to_timeout: Self::default_rcpt_to_timeout(),
            data_timeout: Self::default_data_timeout(),
            data_dot_timeout: Self::default_data_dot_timeout(),
            idle_timeout: Self::default_idle_timeout(),
        }
    }
}

impl SmtpClientTimeouts {
    fn default_connect_timeout() -> Duration {
        Duration::from_secs(60)
    }
    fn default_banner_timeout() -> Duration {
        Duration::from_secs(60)
    }
    fn default_auth_timeout() -> Duration {
        Duration::from_secs(60)
    }
    fn default_ehlo_timeout() -> Duration {
        Duration::from_secs(300)
    }
    fn default_mail_from_timeout() -> Duration {
        Duration::from_secs(300)
    }
    fn default_rcpt_to_timeout() -> Duration {
        Duration::from_secs(300)
    }
    fn default_data_timeout() -> Duration {
        Duration::from_secs(300)
    }
    fn default_data_dot_timeout() -> Duration {
        Duration::from_secs(300)
    }
    fn default_idle_timeout() -> Duration {
        Duration::from_secs(5)
    }

    /// Use the same duration for every phase
    pub fn uniform(duration: Duration) -> Self {
        Self {
            connect_timeout: duration,
            banner_timeout: duration,
            ehlo_timeout: duration,
            auth_timeout: duration,
            mail_from_timeout: duration,
            rcpt_to_timeout: duration,
            data_timeout: duration,
            data_dot_timeout: duration,
            idle_timeout: duration,
        }
    }

    pub fn short_timeouts() -> Self {
        Self::uniform(Duration::from_secs(20))
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub struct Response {
    pub code: u16,
    pub enhanced_code: Option<EnhancedStatusCode>,
    pub content: String,
    pub command: Option<String>,
}

impl Response {
    pub fn to_single_line(&self) -> String {
        let mut line = format!("{} ", self.code);

        if let Some(enh) = &self.enhanced_code {
            line.push_str(&format!("{}.{}.{} ", enh.class, enh.subject, enh.detail));
        }

        line.push_str(&remove_line_break(&self.content));

        line
    }

    pub fn is_permanent(&self) -> bool {
        self.code >= 500 && self.code < 600
    }
}

impl std::fmt::Display for Response {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.write_str(&self.to_single_line())
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub struct EnhancedStatusCode {
    pub class: u8,
    pub subject: u16,
    pub detail: u16,
}

fn parse_enhanced_status_code(line: &str) -> Option<(EnhancedStatusCode, &str)> {
    let mut fields = line.splitn(3, '.');
    let class = fields.next()?.parse::<u8>().ok()?;
    if !matches!(class, 2 | 4 | 5) {
        // No other classes are defined
        return None;
    }
    let subject = fields.next()?.parse::<u16>().ok()?;

    let remainder = fields.next()?;
    let mut fields = remainder.splitn(2, ' ');
    let detail = fields.next()?.parse::<u16>().ok()?;
    let remainder = fields.next()?;

    Some((
        EnhancedStatusCode {
            class,
            subject,
            detail,
        },
        remainder,
    ))
}

fn remove_line_break(data: &str) -> String {
    let mut normalized = String::with_capacity(data.len());
    let mut chars = data.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\r' => {
                if chars.peek() != Some(&'\n') {
                    normalized.push(' ');
                }
            }
            '\n' => normalized.push(' '),
            c => normalized.push(c),
        }
    }
    normalized
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ResponseLine<'a> {
    pub code: u16,
    pub is_final: bool,
    pub content: &'a str,
}

impl<'a> ResponseLine<'a> {
    /// Reconsitute the original line that we parsed
    fn to_original_line(&self) -> String {
        format!(
            "{}{}{}",
            self.code,
            if self.is_final { " " } else { "-" },
            self.content
        )
    }
}

pub(crate) fn parse_response_line(line: &str) -> Result<ResponseLine, ClientError> {
    if line.len() < 4 {
        return Err(ClientError::MalformedResponseLine(line.to_string()));
    }

    match line.as_bytes()[3] {
        b' ' | b'-' => match line[0..3].parse::<u16>() {
            Ok(code) => Ok(ResponseLine {
                code,
                is_final: line.as_bytes()[3] == b' ',
                content: &line[4..],
            }),
            Err(_) => Err(ClientError::MalformedResponseLine(line.to_string())),
        },
        _ => Err(ClientError::MalformedResponseLine(line.to_string())),
    }
}

pub(crate) struct ResponseBuilder {
    pub code: u16,
    pub enhanced_code: Option<EnhancedStatusCode>,
    pub content: String,
}

impl ResponseBuilder {
    pub fn new(parsed: &ResponseLine) -> Self {
        let code = parsed.code;
        let (enhanced_code, content) = match parse_enhanced_status_code(parsed.content) {
            Some((enhanced, content)) => (Some(enhanced), content.to_string()),
            None => (None, parsed.content.to_string()),
        };

        Self {
            code,
            enhanced_code,
            content,
        }
    }

    pub fn add_line(&mut self, parsed: &ResponseLine) -> Result<(), String> {
        if parsed.code != self.code {
            return Err(parsed.to_original_line());
        }

        self.content.push('\n');

        let mut content = parsed.content;

        if let Some(enh) = &self.enhanced_code {
            let prefix = format!("{}.{}.{} ", enh.class, enh.subject, enh.detail);
            if let Some(remainder) = parsed.content.strip_prefix(&prefix) {
                content = remainder;
            }
        }

        self.content.push_str(content);
        Ok(())
    }

    pub fn build(self, command: Option<String>) -> Response {
        Response {
            code: self.code,
            content: self.content,
            enhanced_code: self.enhanced_code,
            command,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn remove_crlf() {
        fn remove(s: &str, expect: &str) {
            assert_eq!(remove_line_break(s), expect, "input: {s:?}");
        }

        remove("hello\r\nthere\r\n", "hello there ");
        remove("hello\r", "hello ");
        remove("hello\nthere\r\n", "hello there ");
        remove("hello\r\r\r\nthere\n", "hello   there ");
    }

    #[test]
    fn response_parsing() {
        assert_eq!(
            parse_enhanced_status_code("2.0.1 w00t"),
            Some((
                EnhancedStatusCode {
                    class: 2,
                    subject: 0,
                    detail: 1
                },
                "w00t"
            ))
        );

        assert_eq!(parse_enhanced_status_code("3.0.0 w00t"), None);

        assert_eq!(parse_enhanced_status_code("2.0.0.1 w00t"), None);

        assert_eq!(parse_enhanced_status_code("2.0.0.1w00t"), None);
    }

    #[test]
    fn response_line_parsing() {
        assert_eq!(
            parse_response_line("220 woot").unwrap(),
            ResponseLine {
                code: 220,
                is_final: true,
                content: "woot"
            }
        );
        assert_eq!(
            parse_response_line("220-woot").unwrap(),
            ResponseLine {
                code: 220,
                is_final: false,
                content: "woot"
            }
        );

        assert!(matches!(
            parse_response_line("220_woot"),
            Err(ClientError::MalformedResponseLine(_))
        ));
        assert!(matches!(
            parse_response_line("not really"),
            Err(ClientError::MalformedResponseLine(_))
        ));
    }

    #[test]
    fn multi_line_response_strips_repeated_enhanced_code() {
        let first = parse_response_line("250-2.1.0 first").unwrap();
        let mut builder = ResponseBuilder::new(&first);
        builder
            .add_line(&parse_response_line("250 2.1.0 second").unwrap())
            .unwrap();
        let response = builder.build(Some("MAIL FROM:<a@b>\r\n".to_string()));
        assert_eq!(response.content, "first\nsecond");
        assert_eq!(response.to_single_line(), "250 2.1.0 first second");
    }

    #[test]
    fn mismatched_continuation_code_is_rejected() {
        let first = parse_response_line("250-hello").unwrap();
        let mut builder = ResponseBuilder::new(&first);
        assert_eq!(
            builder.add_line(&parse_response_line("251 nope").unwrap()),
            Err("251 nope".to_string())
        );
    }

    #[test]
    fn uniform_timeouts() {
        let t = SmtpClientTimeouts::uniform(Duration::from_secs(2));
        assert_eq!(t.connect_timeout, Duration::from_secs(2));
        assert_eq!(t.data_dot_timeout, Duration::from_secs(2));
    }
}
