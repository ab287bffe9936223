//! An in-process SMTP sink and HTTP responder for exercising the
//! dispatcher and the replay adapters without external services.
use data_encoding::BASE64;
use parking_lot::Mutex;
use rfc5321::tokio_rustls::rustls::crypto::aws_lc_rs;
use rfc5321::tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rfc5321::tokio_rustls::rustls::ServerConfig;
use rfc5321::tokio_rustls::TlsAcceptor;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// A message as the sink received it, with dot transparency removed
#[derive(Debug, Clone, Default)]
pub struct Delivery {
    pub auth: Option<(String, String)>,
    pub mail_from: String,
    pub rcpt_to: Vec<String>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SinkBehavior {
    pub reject_banner: bool,
    pub reject_auth: bool,
    pub reject_rcpt: bool,
}

pub struct FakeSink {
    port: u16,
    deliveries: Arc<Mutex<Vec<Delivery>>>,
    task: JoinHandle<()>,
}

impl Drop for FakeSink {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl FakeSink {
    pub async fn start(behavior: SinkBehavior) -> Self {
        Self::start_with(behavior, None).await
    }

    /// Like `start`, but every connection negotiates TLS first using
    /// a freshly generated self-signed certificate for `localhost`
    pub async fn start_implicit_tls(behavior: SinkBehavior) -> Self {
        Self::start_with(behavior, Some(self_signed_acceptor())).await
    }

    async fn start_with(behavior: SinkBehavior, tls: Option<TlsAcceptor>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let deliveries = Arc::new(Mutex::new(vec![]));

        let task = tokio::spawn({
            let deliveries = Arc::clone(&deliveries);
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let deliveries = Arc::clone(&deliveries);
                    let tls = tls.clone();
                    tokio::spawn(async move {
                        let result = match tls {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(stream) => serve_smtp(stream, behavior, deliveries).await,
                                Err(err) => Err(err.into()),
                            },
                            None => serve_smtp(stream, behavior, deliveries).await,
                        };
                        if let Err(err) = result {
                            eprintln!("sink session error: {err:#}");
                        }
                    });
                }
            }
        });

        Self {
            port,
            deliveries,
            task,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().clone()
    }
}

fn self_signed_acceptor() -> TlsAcceptor {
    let key = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert = CertificateDer::from_slice(key.cert.der()).into_owned();
    let private_key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key.key_pair.serialize_der()));

    let config = ServerConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert], private_key)
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

async fn serve_smtp<S: AsyncRead + AsyncWrite + Unpin>(
    stream: S,
    behavior: SinkBehavior,
    deliveries: Arc<Mutex<Vec<Delivery>>>,
) -> anyhow::Result<()> {
    let (read, mut write) = tokio::io::split(stream);
    let mut reader = BufReader::new(read);

    if behavior.reject_banner {
        write.write_all(b"554 5.3.2 not today\r\n").await?;
        return Ok(());
    }
    write.write_all(b"220 sink ESMTP ready\r\n").await?;

    let mut current = Delivery::default();
    loop {
        let mut line = vec![];
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Ok(());
        }
        let line = String::from_utf8(line)?;
        let line = line.trim_end();
        let upper = line.to_ascii_uppercase();

        let reply: &[u8] = if upper.starts_with("EHLO") {
            b"250-sink\r\n250 AUTH PLAIN\r\n"
        } else if upper.starts_with("HELO") {
            b"250 sink\r\n"
        } else if let Some(payload) = line.strip_prefix("AUTH PLAIN ") {
            let decoded = BASE64.decode(payload.as_bytes())?;
            let decoded = String::from_utf8(decoded)?;
            let mut fields = decoded.split('\0').skip(1);
            current.auth = Some((
                fields.next().unwrap_or_default().to_string(),
                fields.next().unwrap_or_default().to_string(),
            ));
            if behavior.reject_auth {
                b"535 5.7.8 authentication failed\r\n"
            } else {
                b"235 2.7.0 ok\r\n"
            }
        } else if let Some(addr) = upper
            .starts_with("MAIL FROM:")
            .then(|| envelope_address(line))
        {
            current.mail_from = addr;
            b"250 ok\r\n"
        } else if let Some(addr) = upper.starts_with("RCPT TO:").then(|| envelope_address(line)) {
            if behavior.reject_rcpt {
                b"550 5.1.1 no such user\r\n"
            } else {
                current.rcpt_to.push(addr);
                b"250 ok\r\n"
            }
        } else if upper == "DATA" {
            if current.rcpt_to.is_empty() {
                b"503 5.5.1 no valid recipients\r\n"
            } else {
                write.write_all(b"354 go ahead\r\n").await?;
                current.data = read_data(&mut reader).await?;
                let delivery = std::mem::take(&mut current);
                deliveries.lock().push(delivery);
                b"250 2.0.0 queued\r\n"
            }
        } else if upper == "QUIT" {
            write.write_all(b"221 bye\r\n").await?;
            return Ok(());
        } else {
            b"500 5.5.2 what?\r\n"
        };
        write.write_all(reply).await?;
    }
}

fn envelope_address(line: &str) -> String {
    let start = line.find('<').map(|i| i + 1).unwrap_or(0);
    let end = line.rfind('>').unwrap_or(line.len());
    line[start..end].to_string()
}

/// Read the content up to the terminating dot, undoing dot stuffing
async fn read_data<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> anyhow::Result<Vec<u8>> {
    let mut data = vec![];
    loop {
        let mut line = vec![];
        anyhow::ensure!(
            reader.read_until(b'\n', &mut line).await? > 0,
            "eof during DATA"
        );
        if line == b".\r\n" {
            return Ok(data);
        }
        if line.starts_with(b".") {
            line.remove(0);
        }
        data.extend_from_slice(&line);
    }
}

/// A one-shot HTTP/1.1 server; answers every request with `status`
/// and `body` and keeps the raw request text for inspection.
pub struct HttpResponder {
    port: u16,
    requests: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl Drop for HttpResponder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl HttpResponder {
    pub async fn start(status: u16, body: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(Mutex::new(vec![]));
        let response = format!(
            "HTTP/1.1 {status} Whatever\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );

        let task = tokio::spawn({
            let requests = Arc::clone(&requests);
            async move {
                while let Ok((mut stream, _)) = listener.accept().await {
                    match read_http_request(&mut stream).await {
                        Ok(request) => requests.lock().push(request),
                        Err(err) => eprintln!("responder: {err:#}"),
                    }
                    stream.write_all(response.as_bytes()).await.ok();
                    stream.shutdown().await.ok();
                }
            }
        });

        Self {
            port,
            requests,
            task,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

async fn read_http_request(stream: &mut TcpStream) -> anyhow::Result<String> {
    let mut buf = vec![];
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        anyhow::ensure!(n > 0, "eof before end of request");
        buf.extend_from_slice(&chunk[..n]);

        let Some(header_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let headers = String::from_utf8_lossy(&buf[..header_end]).to_ascii_lowercase();
        let content_length = headers
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if buf.len() >= header_end + 4 + content_length {
            return Ok(String::from_utf8_lossy(&buf).to_string());
        }
    }
}
