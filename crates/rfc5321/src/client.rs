use crate::client_types::{parse_response_line, ResponseBuilder};
use crate::{AsyncReadAndWrite, BoxedAsyncReadAndWrite, Command, Response, SmtpClientTimeouts};
use data_encoding::BASE64;
use memchr::memmem::Finder;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

const MAX_LINE_LEN: usize = 4096;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("response is not UTF8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed Response: {0}")]
    MalformedResponseLine(String),
    #[error("Response line is too long")]
    ResponseTooLong,
    #[error("Not connected")]
    NotConnected,
    #[error("Command rejected: {0}")]
    Rejected(Response),
    #[error("TLS: {0} is not a valid server name")]
    InvalidDnsName(String),
    #[error("Timed Out connecting to {address} after {duration:?}")]
    TimeOutConnect { address: String, duration: Duration },
    #[error("failed to connect to {address}: {error}")]
    Connect {
        address: String,
        #[source]
        error: std::io::Error,
    },
    #[error("TLS handshake with {address} failed: {error}")]
    TlsHandshake {
        address: String,
        #[source]
        error: std::io::Error,
    },
    #[error("Timed Out waiting {duration:?} for response to {command:?}")]
    TimeOutResponse {
        command: Option<Command>,
        duration: Duration,
    },
    #[error("Timed Out writing {duration:?} {command:?}")]
    TimeOutRequest {
        command: Command,
        duration: Duration,
    },
    #[error("Timed Out sending message payload data")]
    TimeOutData,
}

/// A single SMTP client session over one transport.
///
/// The session is driven one verb at a time by the caller; each
/// method sends exactly one command and reads its response, so a
/// failure in one step leaves the session usable for the next.
/// The transport is released when the client is dropped.
#[derive(Debug)]
pub struct SmtpClient {
    socket: Option<BoxedAsyncReadAndWrite>,
    hostname: String,
    read_buffer: Vec<u8>,
    timeouts: SmtpClientTimeouts,
}

async fn dial(host: &str, port: u16, connect_timeout: Duration) -> Result<TcpStream, ClientError> {
    let address = format!("{host}:{port}");
    let stream = match timeout(connect_timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(error)) => return Err(ClientError::Connect { address, error }),
        Err(_) => {
            return Err(ClientError::TimeOutConnect {
                address,
                duration: connect_timeout,
            })
        }
    };
    // No need for Nagle with SMTP request/response
    stream.set_nodelay(true)?;
    Ok(stream)
}

impl SmtpClient {
    /// Connect without any transport encryption
    pub async fn connect_plain(
        host: &str,
        port: u16,
        timeouts: SmtpClientTimeouts,
    ) -> Result<Self, ClientError> {
        let stream = dial(host, port, timeouts.connect_timeout).await?;
        Ok(Self::with_stream(stream, host, timeouts))
    }

    /// Connect and negotiate TLS immediately, before any SMTP
    /// traffic (implicit TLS, as used on the submissions port).
    /// `server_name` is presented via SNI and used for verification
    /// when the connector verifies certificates.
    pub async fn connect_implicit_tls(
        host: &str,
        port: u16,
        connector: &TlsConnector,
        server_name: &str,
        timeouts: SmtpClientTimeouts,
    ) -> Result<Self, ClientError> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| ClientError::InvalidDnsName(server_name.to_string()))?;

        let stream = dial(host, port, timeouts.connect_timeout).await?;
        let address = format!("{host}:{port}");
        let stream = match timeout(timeouts.connect_timeout, connector.connect(name, stream)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(error)) => return Err(ClientError::TlsHandshake { address, error }),
            Err(_) => {
                return Err(ClientError::TimeOutConnect {
                    address,
                    duration: timeouts.connect_timeout,
                })
            }
        };

        Ok(Self::with_stream(stream, host, timeouts))
    }

    pub fn with_stream<S: AsyncReadAndWrite + 'static, H: AsRef<str>>(
        stream: S,
        peer_hostname: H,
        timeouts: SmtpClientTimeouts,
    ) -> Self {
        Self {
            socket: Some(Box::new(stream)),
            hostname: peer_hostname.as_ref().to_string(),
            read_buffer: Vec::with_capacity(1024),
            timeouts,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    async fn read_line(
        &mut self,
        timeout_duration: Duration,
        cmd: Option<&Command>,
    ) -> Result<String, ClientError> {
        let mut too_long = false;
        loop {
            let mut iter = self.read_buffer.iter().enumerate();
            while let Some((i, &b)) = iter.next() {
                if b != b'\r' {
                    continue;
                }
                if let Some((_, b'\n')) = iter.next() {
                    if too_long {
                        self.read_buffer.drain(0..i + 2);
                        return Err(ClientError::ResponseTooLong);
                    }

                    let line = String::from_utf8(self.read_buffer[0..i].to_vec());
                    self.read_buffer.drain(0..i + 2);
                    return Ok(line?);
                }
            }
            if self.read_buffer.len() > MAX_LINE_LEN {
                self.read_buffer.clear();
                too_long = true;
            }

            // Didn't find a complete line, fill up the rest of the buffer
            let mut data = [0u8; MAX_LINE_LEN];
            let size = match self.socket.as_mut() {
                Some(s) => match timeout(timeout_duration, s.read(&mut data)).await {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(ClientError::TimeOutResponse {
                            command: cmd.cloned(),
                            duration: timeout_duration,
                        })
                    }
                },
                None => return Err(ClientError::NotConnected),
            };
            if size == 0 {
                self.socket.take();
                return Err(ClientError::NotConnected);
            }
            self.read_buffer.extend_from_slice(&data[0..size]);
        }
    }

    pub async fn read_response(
        &mut self,
        command: Option<&Command>,
        timeout_duration: Duration,
    ) -> Result<Response, ClientError> {
        if let Some(sock) = self.socket.as_mut() {
            sock.flush().await?;
        }

        let mut line = self.read_line(timeout_duration, command).await?;
        tracing::trace!("recv<-{}: {line}", self.hostname);
        let mut parsed = parse_response_line(&line)?;
        let mut builder = ResponseBuilder::new(&parsed);

        let subsequent_line_timeout_duration = Duration::from_secs(60).min(timeout_duration);
        while !parsed.is_final {
            line = self
                .read_line(subsequent_line_timeout_duration, command)
                .await?;
            tracing::trace!("recv<-{}: {line}", self.hostname);
            parsed = parse_response_line(&line)?;
            builder
                .add_line(&parsed)
                .map_err(ClientError::MalformedResponseLine)?;
        }

        let response = builder.build(command.map(|cmd| cmd.redacted()));

        tracing::trace!(
            "{}: {command:?} response: {}",
            self.hostname,
            response.to_single_line()
        );

        Ok(response)
    }

    async fn write_with_timeout(
        &mut self,
        data: &[u8],
        duration: Duration,
    ) -> Result<(), Option<ClientError>> {
        match self.socket.as_mut() {
            Some(socket) => match timeout(duration, socket.write_all(data)).await {
                Ok(result) => result.map_err(|_| Some(ClientError::NotConnected)),
                Err(_) => Err(None),
            },
            None => Err(Some(ClientError::NotConnected)),
        }
    }

    pub async fn send_command(&mut self, command: &Command) -> Result<Response, ClientError> {
        let line = command.encode();
        tracing::trace!("send->{}: {}", self.hostname, command.redacted());
        let duration = command.client_timeout_request(&self.timeouts);
        self.write_with_timeout(line.as_bytes(), duration)
            .await
            .map_err(|err| {
                err.unwrap_or_else(|| ClientError::TimeOutRequest {
                    command: command.clone(),
                    duration,
                })
            })?;

        self.read_response(Some(command), command.client_timeout(&self.timeouts))
            .await
    }

    async fn expect(&mut self, command: Command, codes: &[u16]) -> Result<Response, ClientError> {
        let response = self.send_command(&command).await?;
        if !codes.contains(&response.code) {
            return Err(ClientError::Rejected(response));
        }
        Ok(response)
    }

    /// Read the initial greeting; anything other than 220 is a rejection
    pub async fn read_banner(&mut self) -> Result<Response, ClientError> {
        let banner_timeout = self.timeouts.banner_timeout;
        let banner = self.read_response(None, banner_timeout).await?;
        if banner.code != 220 {
            return Err(ClientError::Rejected(banner));
        }
        Ok(banner)
    }

    /// Identify ourselves with EHLO, falling back to HELO if the
    /// server does not understand EHLO.
    pub async fn ehlo(&mut self, ehlo_name: &str) -> Result<Response, ClientError> {
        let response = self
            .send_command(&Command::Ehlo(ehlo_name.to_string()))
            .await?;
        if response.code == 250 {
            return Ok(response);
        }
        if !response.is_permanent() {
            return Err(ClientError::Rejected(response));
        }

        tracing::debug!(
            "{}: EHLO rejected ({}), trying HELO",
            self.hostname,
            response.to_single_line()
        );
        self.expect(Command::Helo(ehlo_name.to_string()), &[250])
            .await
    }

    pub async fn auth_plain(
        &mut self,
        username: &str,
        password: Option<&str>,
    ) -> Result<Response, ClientError> {
        // RFC 4616 says that the format is:
        // [authzid] NUL authcid NUL passwd
        let password = password.unwrap_or("");
        let payload = format!("\x00{username}\x00{password}");
        let payload = BASE64.encode(payload.as_bytes());

        self.expect(
            Command::Auth {
                sasl_mech: "PLAIN".to_string(),
                initial_response: Some(payload),
            },
            &[235],
        )
        .await
    }

    pub async fn mail_from(&mut self, address: &str) -> Result<Response, ClientError> {
        self.expect(Command::MailFrom(address.to_string()), &[250])
            .await
    }

    pub async fn rcpt_to(&mut self, address: &str) -> Result<Response, ClientError> {
        self.expect(Command::RcptTo(address.to_string()), &[250, 251])
            .await
    }

    /// Open the data channel. The server must answer 354 before
    /// any content may be written.
    pub async fn data(&mut self) -> Result<Response, ClientError> {
        self.expect(Command::Data, &[354]).await
    }

    /// Write the message content into an open data channel and
    /// close it with the end-of-data marker.
    /// Dot transparency (RFC 5321 4.5.2) is applied on the wire only;
    /// the receiver recovers `data` unchanged.
    pub async fn send_data<B: AsRef<[u8]>>(&mut self, data: B) -> Result<Response, ClientError> {
        let data: &[u8] = data.as_ref();
        let stuffed;

        let data = match apply_dot_stuffing(data) {
            Some(d) => {
                stuffed = d;
                &stuffed
            }
            None => data,
        };
        let needs_newline = data.last().map(|&b| b != b'\n').unwrap_or(true);

        tracing::trace!("message data is {} bytes", data.len());

        let duration = Command::Data.client_timeout_request(&self.timeouts);
        self.write_with_timeout(data, duration)
            .await
            .map_err(|err| err.unwrap_or(ClientError::TimeOutData))?;

        let marker = if needs_newline { "\r\n.\r\n" } else { ".\r\n" };

        tracing::trace!("send->{}: {}", self.hostname, marker.escape_debug());

        self.write_with_timeout(marker.as_bytes(), duration)
            .await
            .map_err(|err| {
                err.unwrap_or_else(|| ClientError::TimeOutRequest {
                    command: Command::DataDot,
                    duration,
                })
            })?;

        let data_dot = Command::DataDot;
        let resp = self
            .read_response(Some(&data_dot), data_dot.client_timeout(&self.timeouts))
            .await?;
        if resp.code != 250 {
            return Err(ClientError::Rejected(resp));
        }

        Ok(resp)
    }

    /// Politely end the session
    pub async fn quit(&mut self) -> Result<Response, ClientError> {
        self.send_command(&Command::Quit).await
    }

    /// Shut down and release the transport.
    /// Safe to call on an already closed client.
    pub async fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            if let Err(err) = socket.shutdown().await {
                tracing::trace!("{}: error during shutdown: {err:#}", self.hostname);
            }
        }
    }
}

fn apply_dot_stuffing(data: &[u8]) -> Option<Vec<u8>> {
    static LFDOT: LazyLock<Finder> = LazyLock::new(|| Finder::new("\n."));

    if !data.starts_with(b".") && LFDOT.find(data).is_none() {
        return None;
    }

    let mut stuffed = vec![];
    if data.starts_with(b".") {
        stuffed.push(b'.');
    }
    let mut last_idx = 0;
    for i in LFDOT.find_iter(data) {
        stuffed.extend_from_slice(&data[last_idx..=i]);
        stuffed.push(b'.');
        last_idx = i + 1;
    }
    stuffed.extend_from_slice(&data[last_idx..]);
    Some(stuffed)
}
