//! Monoio-native HTTPS transport
//!
//! - Single-threaded async with monoio
//! - Direct TLS integration with rustls
//! - HTTP/1.1, one connection per request (`Connection: close`)
//! - Every round trip bounded by a timeout
//!
//! The REST client only talks to [`HttpTransport`], so tests can swap in a
//! scripted transport.

use crate::errors::{ExchangeError, Result};
use async_trait::async_trait;
use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use monoio::net::TcpStream;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection};
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

const USER_AGENT: &str = "futlink/0.1";
const READ_CHUNK: usize = 16 * 1024;

/// HTTP verbs used by the exchange API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outgoing request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// First header value with a case-insensitive name match
    pub fn header_value(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

/// HTTP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

/// One request, one response
#[async_trait(?Send)]
pub trait HttpTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// TLS client configuration trusting the webpki root set
pub fn default_tls_config() -> Arc<ClientConfig> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    )
}

/// Monoio-native HTTPS client
pub struct MonoioHttpsClient {
    tls_config: Arc<ClientConfig>,
    timeout: Duration,
}

impl MonoioHttpsClient {
    /// Client with the webpki roots and the given per-request timeout.
    ///
    /// Requests must run on a runtime with timers enabled.
    pub fn new(timeout: Duration) -> Self {
        Self {
            tls_config: default_tls_config(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn round_trip(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let host = request
            .url
            .host_str()
            .ok_or_else(|| ExchangeError::InvalidUrl("No host in URL".to_string()))?;
        let port = request.url.port_or_known_default().unwrap_or(443);

        let mut tls_stream = TlsStream::connect(self.tls_config.clone(), host, port).await?;

        let raw = build_request(request)?;
        tls_stream.write_all(raw.as_bytes()).await?;

        let response_data = tls_stream.read_to_end().await?;
        parse_http_response(&response_data)
    }
}

#[async_trait(?Send)]
impl HttpTransport for MonoioHttpsClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        debug!("📡 {} {}", request.method, request.url);

        match monoio::time::timeout(self.timeout, self.round_trip(&request)).await {
            Ok(result) => result,
            Err(_) => Err(ExchangeError::Timeout(format!(
                "{} {} exceeded {}ms",
                request.method,
                request.url.path(),
                self.timeout.as_millis()
            ))),
        }
    }
}

/// Serialize the request line, headers and body
pub fn build_request(request: &HttpRequest) -> Result<String> {
    let url = &request.url;
    let host = url
        .host_str()
        .ok_or_else(|| ExchangeError::InvalidUrl("No host in URL".to_string()))?;
    let host_header = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    let mut target = if url.path().is_empty() { "/".to_string() } else { url.path().to_string() };
    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }

    let body = request.body.as_deref().unwrap_or("");
    let mut raw = format!(
        "{} {target} HTTP/1.1\r\n\
         Host: {host_header}\r\n\
         User-Agent: {USER_AGENT}\r\n\
         Accept: application/json\r\n\
         Connection: close\r\n\
         Content-Length: {}\r\n",
        request.method,
        body.len()
    );

    for (key, value) in &request.headers {
        raw.push_str(&format!("{key}: {value}\r\n"));
    }

    raw.push_str("\r\n");
    raw.push_str(body);
    Ok(raw)
}

/// Parse a complete HTTP/1.1 response read until connection close
pub fn parse_http_response(data: &[u8]) -> Result<HttpResponse> {
    let header_end = data
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| ExchangeError::Network("Invalid HTTP response: no header terminator".to_string()))?;

    let header_part = String::from_utf8_lossy(&data[..header_end]);
    let raw_body = &data[header_end + 4..];

    let mut lines = header_part.lines();
    let status_line = lines
        .next()
        .ok_or_else(|| ExchangeError::Network("Empty response".to_string()))?;

    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| ExchangeError::Network(format!("Invalid status line: {status_line}")))?;

    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    let find = |name: &str| {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    };

    let body = if find("transfer-encoding").is_some_and(|v| v.to_ascii_lowercase().contains("chunked")) {
        decode_chunked(raw_body)?
    } else if let Some(len) = find("content-length").and_then(|v| v.parse::<usize>().ok()) {
        raw_body[..len.min(raw_body.len())].to_vec()
    } else {
        raw_body.to_vec()
    };

    Ok(HttpResponse {
        status,
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

/// Decode a `Transfer-Encoding: chunked` body
pub fn decode_chunked(mut data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len());

    loop {
        let line_end = data
            .windows(2)
            .position(|w| w == b"\r\n")
            .ok_or_else(|| ExchangeError::Network("Truncated chunk header".to_string()))?;

        let size_line = String::from_utf8_lossy(&data[..line_end]);
        let size_hex = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_hex, 16)
            .map_err(|_| ExchangeError::Network(format!("Invalid chunk size: {size_hex}")))?;

        data = &data[line_end + 2..];
        if size == 0 {
            return Ok(out);
        }
        if data.len() < size {
            return Err(ExchangeError::Network("Truncated chunk body".to_string()));
        }

        out.extend_from_slice(&data[..size]);
        data = data.get(size + 2..).unwrap_or(&[]);
    }
}

/// TLS stream over a monoio TCP socket
pub struct TlsStream {
    stream: TcpStream,
    tls_conn: ClientConnection,
    write_buf: Vec<u8>,
    read_buf: Vec<u8>,
    plaintext: Vec<u8>,
    eof: bool,
}

impl TlsStream {
    /// Connect over TCP and complete the TLS handshake
    pub async fn connect(config: Arc<ClientConfig>, host: &str, port: u16) -> Result<Self> {
        let tcp_stream = TcpStream::connect(format!("{host}:{port}"))
            .await
            .map_err(|e| ExchangeError::Network(format!("TCP connect to {host}:{port} failed: {e}")))?;

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| ExchangeError::Network(format!("Invalid server name: {e:?}")))?;

        let tls_conn = ClientConnection::new(config, server_name)
            .map_err(|e| ExchangeError::Network(format!("TLS setup failed: {e}")))?;

        let mut stream = Self {
            stream: tcp_stream,
            tls_conn,
            write_buf: Vec::with_capacity(8192),
            read_buf: Vec::with_capacity(READ_CHUNK),
            plaintext: Vec::new(),
            eof: false,
        };
        stream.complete_handshake().await?;
        Ok(stream)
    }

    async fn complete_handshake(&mut self) -> Result<()> {
        while self.tls_conn.is_handshaking() {
            self.flush_tls().await?;

            if !self.tls_conn.is_handshaking() {
                break;
            }

            if self.tls_conn.wants_read() {
                if self.read_tcp().await? == 0 {
                    return Err(ExchangeError::Network("Connection closed during TLS handshake".to_string()));
                }
            } else if !self.tls_conn.wants_write() {
                return Err(ExchangeError::Network("TLS handshake stalled".to_string()));
            }
        }

        self.flush_tls().await
    }

    /// Send everything rustls has queued for the peer
    async fn flush_tls(&mut self) -> Result<()> {
        while self.tls_conn.wants_write() {
            self.write_buf.clear();
            self.tls_conn
                .write_tls(&mut self.write_buf)
                .map_err(|e| ExchangeError::Network(format!("TLS write failed: {e}")))?;

            if self.write_buf.is_empty() {
                break;
            }

            let buf = std::mem::take(&mut self.write_buf);
            let (result, buf) = self.stream.write_all(buf).await;
            self.write_buf = buf;
            result.map_err(|e| ExchangeError::Network(format!("TCP write failed: {e}")))?;
        }
        Ok(())
    }

    /// Read one TCP chunk into rustls and move decrypted bytes into
    /// `plaintext`. Returns the number of TCP bytes read (0 on EOF).
    async fn read_tcp(&mut self) -> Result<usize> {
        let mut buf = std::mem::take(&mut self.read_buf);
        buf.clear();
        let (result, buf) = self.stream.read(buf).await;
        let bytes_read = match result {
            Ok(n) => n,
            Err(e) => {
                self.read_buf = buf;
                return Err(ExchangeError::Network(format!("TCP read failed: {e}")));
            }
        };

        if bytes_read == 0 {
            self.read_buf = buf;
            self.eof = true;
            return Ok(0);
        }

        // The chunk stays out of `self` while rustls consumes it.
        let fed = self.feed_tls(&buf[..bytes_read]);
        self.read_buf = buf;
        fed?;

        self.flush_tls().await?;
        Ok(bytes_read)
    }

    fn feed_tls(&mut self, data: &[u8]) -> Result<()> {
        let mut cursor = std::io::Cursor::new(data);
        while (cursor.position() as usize) < data.len() {
            self.tls_conn
                .read_tls(&mut cursor)
                .map_err(|e| ExchangeError::Network(format!("TLS read failed: {e}")))?;
            self.tls_conn
                .process_new_packets()
                .map_err(|e| ExchangeError::Network(format!("TLS process failed: {e}")))?;
            self.drain_plaintext()?;
        }
        Ok(())
    }

    fn drain_plaintext(&mut self) -> Result<()> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.tls_conn.reader().read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(());
                }
                Ok(n) => self.plaintext.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(ExchangeError::Network(format!("TLS read failed: {e}"))),
            }
        }
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.tls_conn
            .writer()
            .write_all(data)
            .map_err(|e| ExchangeError::Network(format!("TLS application write failed: {e}")))?;
        self.flush_tls().await
    }

    /// Read decrypted bytes into `buf`. Returns 0 once the peer has closed.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        while self.plaintext.is_empty() {
            if self.eof {
                return Ok(0);
            }
            self.read_tcp().await?;
        }

        let n = buf.len().min(self.plaintext.len());
        buf[..n].copy_from_slice(&self.plaintext[..n]);
        self.plaintext.drain(..n);
        Ok(n)
    }

    /// Wait until `read` can make progress without consuming anything.
    /// Safe to cancel, unlike `read`.
    pub async fn readable(&self) -> Result<()> {
        if !self.plaintext.is_empty() || self.eof {
            return Ok(());
        }
        self.stream
            .readable(false)
            .await
            .map_err(|e| ExchangeError::Network(format!("TCP poll failed: {e}")))
    }

    /// Read until the peer closes the connection
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        while !self.eof {
            self.read_tcp().await?;
        }
        Ok(std::mem::take(&mut self.plaintext))
    }
}
