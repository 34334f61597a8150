//! Monoio-native WebSocket client
//!
//! RFC 6455 client over [`TlsStream`]. Frames are masked with random keys,
//! pings are answered inline and fragmented messages are reassembled before
//! they reach the caller.
//!
//! The stream worker only sees [`StreamConnector`] and [`StreamConnection`],
//! so it can be driven by a scripted connection in tests.

use crate::errors::{ExchangeError, Result};
use crate::http::{TlsStream, default_tls_config};
use async_trait::async_trait;
use base64::Engine;
use futlink_core::PerfTimer;
use rustls::ClientConfig;
use sha1::{Digest, Sha1};
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

/// WebSocket opcode constants
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xa,
}

impl OpCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xa => Some(OpCode::Pong),
            _ => None,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

/// A single WebSocket frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub mask: Option<[u8; 4]>,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Client frame with a fresh random mask
    pub fn client(opcode: OpCode, payload: Vec<u8>) -> Self {
        Self {
            fin: true,
            opcode,
            mask: Some(random_mask()),
            payload,
        }
    }

    pub fn text(data: String) -> Self {
        Self::client(OpCode::Text, data.into_bytes())
    }

    pub fn pong(data: Vec<u8>) -> Self {
        Self::client(OpCode::Pong, data)
    }

    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        Self::client(OpCode::Close, payload)
    }

    fn apply_mask(payload: &mut [u8], mask: &[u8; 4]) {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }
    }

    /// Serialize, masking the payload when a mask is set
    pub fn encode(&self) -> Vec<u8> {
        let len = self.payload.len();
        let mut out = Vec::with_capacity(len + 14);

        out.push(if self.fin { 0x80 } else { 0x00 } | self.opcode as u8);

        let mask_bit = if self.mask.is_some() { 0x80 } else { 0x00 };
        if len < 126 {
            out.push(mask_bit | len as u8);
        } else if len <= u16::MAX as usize {
            out.push(mask_bit | 126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            out.push(mask_bit | 127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }

        let start = out.len();
        if let Some(mask) = self.mask {
            out.extend_from_slice(&mask);
            out.extend_from_slice(&self.payload);
            Self::apply_mask(&mut out[start + 4..], &mask);
        } else {
            out.extend_from_slice(&self.payload);
        }
        out
    }

    /// Parse one frame from the front of `data`.
    ///
    /// Returns `Ok(None)` when `data` does not yet hold a complete frame,
    /// otherwise the frame and the number of bytes it used.
    pub fn decode(data: &[u8]) -> Result<Option<(Self, usize)>> {
        if data.len() < 2 {
            return Ok(None);
        }

        let first_byte = data[0];
        let second_byte = data[1];

        if first_byte & 0x70 != 0 {
            return Err(ExchangeError::InvalidResponse("Reserved WebSocket bits set".to_string()));
        }

        let fin = first_byte & 0x80 != 0;
        let opcode = OpCode::from_u8(first_byte & 0x0f).ok_or_else(|| {
            ExchangeError::InvalidResponse(format!("Invalid WebSocket opcode {:#x}", first_byte & 0x0f))
        })?;

        let masked = second_byte & 0x80 != 0;
        let mut offset = 2;
        let payload_len = match second_byte & 0x7f {
            126 => {
                let Some(bytes) = data.get(offset..offset + 2) else { return Ok(None) };
                offset += 2;
                u16::from_be_bytes([bytes[0], bytes[1]]) as usize
            }
            127 => {
                let Some(bytes) = data.get(offset..offset + 8) else { return Ok(None) };
                offset += 8;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                usize::try_from(u64::from_be_bytes(raw))
                    .map_err(|_| ExchangeError::InvalidResponse("WebSocket frame too large".to_string()))?
            }
            len => len as usize,
        };

        if payload_len > MAX_MESSAGE_LEN {
            return Err(ExchangeError::InvalidResponse(format!("WebSocket frame of {payload_len} bytes")));
        }

        let mask = if masked {
            let Some(bytes) = data.get(offset..offset + 4) else { return Ok(None) };
            offset += 4;
            Some([bytes[0], bytes[1], bytes[2], bytes[3]])
        } else {
            None
        };

        let Some(body) = data.get(offset..offset + payload_len) else { return Ok(None) };
        let mut payload = body.to_vec();
        if let Some(mask) = &mask {
            Self::apply_mask(&mut payload, mask);
        }

        Ok(Some((Frame { fin, opcode, mask, payload }, offset + payload_len)))
    }
}

fn random_mask() -> [u8; 4] {
    let bytes = nanoid::rngs::default(4);
    [bytes[0], bytes[1], bytes[2], bytes[3]]
}

/// Base64 of 16 random bytes for `Sec-WebSocket-Key`
pub fn generate_websocket_key() -> String {
    base64::engine::general_purpose::STANDARD.encode(nanoid::rngs::default(16))
}

/// Expected `Sec-WebSocket-Accept` for a handshake key
pub fn calculate_accept_key(ws_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(ws_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Check the server's reply to the upgrade request
pub fn validate_handshake_response(response: &str, ws_key: &str) -> Result<()> {
    let status_ok = response
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        == Some("101");
    if !status_ok {
        let status_line = response.lines().next().unwrap_or("");
        return Err(ExchangeError::ConnectionFailed(format!("WebSocket upgrade rejected: {status_line}")));
    }

    let expected = calculate_accept_key(ws_key);
    let accepted = response
        .lines()
        .filter_map(|line| line.split_once(':'))
        .any(|(k, v)| k.trim().eq_ignore_ascii_case("sec-websocket-accept") && v.trim() == expected);

    if !accepted {
        return Err(ExchangeError::ConnectionFailed("WebSocket handshake: invalid accept key".to_string()));
    }
    Ok(())
}

/// An open message stream
#[async_trait(?Send)]
pub trait StreamConnection {
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Next complete text message. `None` once the peer has closed.
    /// Not cancellation safe: a read dropped midway can lose frame bytes.
    async fn next_message(&mut self) -> Result<Option<String>>;

    /// Resolve once inbound data (or a close) is waiting for
    /// [`next_message`](Self::next_message). Consumes nothing, so it can be
    /// raced against other events and dropped.
    async fn readable(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Opens [`StreamConnection`]s. Moved into the worker thread that owns the stream.
#[async_trait(?Send)]
pub trait StreamConnector: Send + 'static {
    type Connection: StreamConnection;

    async fn connect(&self, url: &Url) -> Result<Self::Connection>;
}

/// Monoio-native WebSocket client
pub struct MonoioWebSocket {
    stream: TlsStream,
    buffer: Vec<u8>,
    fragments: Vec<u8>,
    fragmented: bool,
    close_sent: bool,
    closed: bool,
}

impl MonoioWebSocket {
    /// TLS connect and perform the upgrade handshake
    pub async fn connect(config: Arc<ClientConfig>, url: &Url) -> Result<Self> {
        let _timer = PerfTimer::start("websocket_connect");
        info!("🔗 Connecting to WebSocket: {}", url);

        let host = url
            .host_str()
            .ok_or_else(|| ExchangeError::InvalidUrl("No host in WebSocket URL".to_string()))?;
        let port = url.port_or_known_default().unwrap_or(443);

        let stream = TlsStream::connect(config, host, port)
            .await
            .map_err(|e| ExchangeError::ConnectionFailed(e.to_string()))?;

        let mut websocket = Self {
            stream,
            buffer: Vec::with_capacity(8192),
            fragments: Vec::new(),
            fragmented: false,
            close_sent: false,
            closed: false,
        };
        websocket.handshake(url, host).await?;

        info!("✅ WebSocket connection established to {}", url);
        Ok(websocket)
    }

    async fn handshake(&mut self, url: &Url, host: &str) -> Result<()> {
        let ws_key = generate_websocket_key();
        let path = if url.path().is_empty() { "/" } else { url.path() };
        let query = url.query().map(|q| format!("?{q}")).unwrap_or_default();

        let request = format!(
            "GET {path}{query} HTTP/1.1\r\n\
             Host: {host}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {ws_key}\r\n\
             Sec-WebSocket-Version: 13\r\n\
             \r\n"
        );
        self.stream.write_all(request.as_bytes()).await?;

        // Read until the end of the response head; anything after it is frame data.
        let mut chunk = [0u8; 4096];
        let header_end = loop {
            if let Some(pos) = self.buffer.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos;
            }
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(ExchangeError::ConnectionFailed("Connection closed during WebSocket handshake".to_string()));
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        };

        let response = String::from_utf8_lossy(&self.buffer[..header_end]).into_owned();
        self.buffer.drain(..header_end + 4);
        validate_handshake_response(&response, &ws_key)?;

        debug!("✅ WebSocket handshake completed");
        Ok(())
    }

    async fn send_frame(&mut self, frame: Frame) -> Result<()> {
        if self.close_sent {
            return Err(ExchangeError::ConnectionFailed("WebSocket already closing".to_string()));
        }
        self.stream.write_all(&frame.encode()).await?;
        if frame.opcode == OpCode::Close {
            self.close_sent = true;
        }
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<Option<Frame>> {
        let mut chunk = [0u8; 8192];
        loop {
            if let Some((frame, used)) = Frame::decode(&self.buffer)? {
                self.buffer.drain(..used);
                return Ok(Some(frame));
            }

            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    /// Fold one data frame into the message being assembled
    fn assemble(&mut self, frame: Frame) -> Result<Option<String>> {
        match frame.opcode {
            OpCode::Text | OpCode::Binary if self.fragmented => {
                return Err(ExchangeError::InvalidResponse("New message inside a fragmented message".to_string()));
            }
            OpCode::Continuation if !self.fragmented => {
                return Err(ExchangeError::InvalidResponse("Continuation without a message".to_string()));
            }
            _ => {}
        }

        if frame.fin && !self.fragmented {
            return String::from_utf8(frame.payload)
                .map(Some)
                .map_err(|e| ExchangeError::InvalidResponse(format!("Invalid UTF-8 in message: {e}")));
        }

        if self.fragments.len() + frame.payload.len() > MAX_MESSAGE_LEN {
            return Err(ExchangeError::InvalidResponse("Fragmented message too large".to_string()));
        }
        self.fragments.extend_from_slice(&frame.payload);
        self.fragmented = !frame.fin;

        if frame.fin {
            let payload = std::mem::take(&mut self.fragments);
            return String::from_utf8(payload)
                .map(Some)
                .map_err(|e| ExchangeError::InvalidResponse(format!("Invalid UTF-8 in message: {e}")));
        }
        Ok(None)
    }
}

#[async_trait(?Send)]
impl StreamConnection for MonoioWebSocket {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.send_frame(Frame::text(text)).await
    }

    async fn next_message(&mut self) -> Result<Option<String>> {
        while !self.closed {
            let Some(frame) = self.read_frame().await? else {
                self.closed = true;
                return Ok(None);
            };

            match frame.opcode {
                OpCode::Ping => {
                    debug!("Received ping, sending pong");
                    self.send_frame(Frame::pong(frame.payload)).await?;
                }
                OpCode::Pong => {}
                OpCode::Close => {
                    debug!("Received close frame");
                    if !self.close_sent {
                        let _ = self.send_frame(Frame::close(1000, "")).await;
                    }
                    self.closed = true;
                }
                _ => {
                    if let Some(message) = self.assemble(frame)? {
                        return Ok(Some(message));
                    }
                }
            }
        }
        Ok(None)
    }

    async fn readable(&mut self) -> Result<()> {
        if self.closed || !self.buffer.is_empty() {
            return Ok(());
        }
        self.stream.readable().await
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed || self.close_sent {
            return Ok(());
        }
        info!("🔌 Closing WebSocket connection");
        self.send_frame(Frame::close(1000, "Normal closure")).await
    }
}

/// Connects [`MonoioWebSocket`]s with a shared TLS configuration
#[derive(Clone)]
pub struct WssConnector {
    tls_config: Arc<ClientConfig>,
}

impl WssConnector {
    pub fn new() -> Self {
        Self {
            tls_config: default_tls_config(),
        }
    }
}

impl Default for WssConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl StreamConnector for WssConnector {
    type Connection = MonoioWebSocket;

    async fn connect(&self, url: &Url) -> Result<MonoioWebSocket> {
        MonoioWebSocket::connect(self.tls_config.clone(), url).await
    }
}
