//! Byte-level message transports.
//!
//! A [`Transport`] buffers a single outgoing message, field by field, and
//! holds the body of the last received message. Actual delivery is done by
//! one of the inner transports:
//!
//! - `udp`: one datagram per message, with the textual header,
//! - `tcp`: a stream of messages framed by the same header,
//! - `channel`: in-process pair of endpoints, no header.
//!
//! [`Transport`]: struct.Transport.html

pub mod header;

mod channel;
mod tcp;
mod udp;

pub use header::{Header, HeaderConfig, HEADER_SIZE, STATUS_OK};

use std::fmt::{Display, Formatter};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::codec::{BodyParser, FieldValue, Fields};
use crate::connection::Mode;
use crate::error::{Error, Result};

pub const DEFAULT_PORT: u16 = 39036;
pub const DEFAULT_HOSTNAME: &str = "127.0.0.1";
/// Maximum size of a message body.
pub const DEFAULT_MAX_MESSAGE: usize = 1500;
pub const DEFAULT_CONNECT_RETRIES: u32 = 3;
pub const DEFAULT_MAX_RETRY: u32 = 3;

/// Available transport implementations.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Udp,
    Tcp,
    Channel,
}

impl Display for TransportKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportKind::Udp => "udp",
            TransportKind::Tcp => "tcp",
            TransportKind::Channel => "channel",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for TransportKind {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let t = match s.trim().to_lowercase().as_str() {
            "udp" => TransportKind::Udp,
            "tcp" => TransportKind::Tcp,
            "channel" | "chan" | "inproc" => TransportKind::Channel,
            _ => return Err(Error::ParsingError(format!("unknown transport: {}", s))),
        };
        Ok(t)
    }
}

/// What to do when receiving fails.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Fail the receive
    Abort,
    /// Try again, up to the configured number of retries
    Retry,
    /// Report an empty message
    Ignore,
}

impl FromStr for ErrorPolicy {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let p = match s.trim().to_lowercase().as_str() {
            "abort" => ErrorPolicy::Abort,
            "retry" => ErrorPolicy::Retry,
            "ignore" => ErrorPolicy::Ignore,
            _ => {
                return Err(Error::InvalidOption(format!(
                    "on_error must be abort, retry or ignore, got {}",
                    s
                )))
            }
        };
        Ok(p)
    }
}

enum InnerTransport {
    Udp(udp::UdpTransport),
    Tcp(tcp::TcpTransport),
    Channel(channel::ChannelTransport),
}

/// Message buffering and delivery over one of the inner transports.
pub struct Transport {
    kind: TransportKind,
    inner: InnerTransport,
    mode: Mode,

    pub header: HeaderConfig,
    hostname: String,
    port: u16,
    uri: Option<String>,
    debug_level: u32,
    on_error: ErrorPolicy,
    /// `None` retries without limit
    max_retry: Option<u32>,
    connect_retries: u32,

    output: String,
    field_count: usize,
    delimiter: Option<String>,
    max_message: usize,
    open: bool,

    input: String,
    has_input: bool,
    preloaded: Option<Vec<u8>>,
    parser: Option<Arc<dyn BodyParser>>,
    translation: Option<Fields>,
    scope: Vec<String>,
}

impl Transport {
    /// Creates an uninitialized transport of the given kind.
    ///
    /// Channel transports created this way are disconnected, use
    /// [`Transport::channel_pair`] instead.
    ///
    /// [`Transport::channel_pair`]: struct.Transport.html#method.channel_pair
    pub fn new(kind: TransportKind) -> Self {
        let inner = match kind {
            TransportKind::Udp => InnerTransport::Udp(udp::UdpTransport::new()),
            TransportKind::Tcp => InnerTransport::Tcp(tcp::TcpTransport::new()),
            TransportKind::Channel => {
                InnerTransport::Channel(channel::ChannelTransport::disconnected())
            }
        };
        Self::with_inner(kind, inner)
    }

    fn with_inner(kind: TransportKind, inner: InnerTransport) -> Self {
        Transport {
            kind,
            inner,
            mode: Mode::Client,
            header: HeaderConfig::default(),
            hostname: DEFAULT_HOSTNAME.to_string(),
            port: DEFAULT_PORT,
            uri: None,
            debug_level: 0,
            on_error: ErrorPolicy::Abort,
            max_retry: Some(DEFAULT_MAX_RETRY),
            connect_retries: DEFAULT_CONNECT_RETRIES,
            output: String::with_capacity(DEFAULT_MAX_MESSAGE),
            field_count: 0,
            delimiter: None,
            max_message: DEFAULT_MAX_MESSAGE,
            open: false,
            input: String::new(),
            has_input: false,
            preloaded: None,
            parser: None,
            translation: None,
            scope: Vec::new(),
        }
    }

    /// Creates two connected in-process transports.
    pub fn channel_pair() -> (Transport, Transport) {
        let (a, b) = channel::ChannelTransport::pair();
        (
            Self::with_inner(TransportKind::Channel, InnerTransport::Channel(a)),
            Self::with_inner(TransportKind::Channel, InnerTransport::Channel(b)),
        )
    }

    /// Wraps a stream accepted by a listener. The transport is in server
    /// mode and needs no further initialization.
    pub fn from_tcp_stream(stream: TcpStream) -> Result<Transport> {
        let inner = InnerTransport::Tcp(tcp::TcpTransport::from_stream(stream)?);
        let mut transport = Self::with_inner(TransportKind::Tcp, inner);
        transport.set_mode(Mode::Server);
        Ok(transport)
    }

    /// Wraps a datagram received by a listener. The datagram is processed
    /// by the next `recv` and responses go back to `peer`.
    pub fn from_udp_datagram(socket: UdpSocket, peer: SocketAddr, datagram: Vec<u8>) -> Transport {
        let inner = InnerTransport::Udp(udp::UdpTransport::from_socket(socket, peer));
        let mut transport = Self::with_inner(TransportKind::Udp, inner);
        transport.set_mode(Mode::Server);
        transport.preload(datagram);
        transport
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
        self.header.set_mode(mode);
    }

    pub fn set_delimiter(&mut self, delimiter: Option<&str>) {
        self.delimiter = delimiter.map(|d| d.to_string());
    }

    pub fn delimiter(&self) -> Option<&str> {
        self.delimiter.as_deref()
    }

    /// Registers the parser used to translate every received body.
    pub fn set_parser(&mut self, parser: Option<Arc<dyn BodyParser>>) {
        self.parser = parser;
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.header.timeout = timeout;
    }

    pub fn set_error_policy(&mut self, policy: ErrorPolicy, max_retry: Option<u32>) {
        self.on_error = policy;
        self.max_retry = max_retry;
    }

    pub fn set_connect_retries(&mut self, retries: u32) {
        self.connect_retries = retries;
    }

    /// Sets the address to bind to (server) or connect to (client).
    pub fn set_address(&mut self, hostname: &str, port: u16) {
        self.hostname = hostname.to_string();
        self.port = port;
    }

    /// Applies one or more `key=value` settings separated by `,` or `;`.
    pub fn option(&mut self, command: &str) -> Result<()> {
        for setting in command.split(|c| c == ',' || c == ';') {
            let setting = setting.trim();
            if setting.is_empty() {
                continue;
            }
            let split = setting
                .find(|c: char| c == '=' || c.is_whitespace())
                .ok_or_else(|| {
                    Error::InvalidOption(format!("{}: '{}' has no value", self.kind, setting))
                })?;
            let key = setting[..split].trim();
            let value = setting[split..]
                .trim_start_matches(|c: char| c == '=' || c.is_whitespace())
                .trim();
            if value.is_empty() {
                return Err(Error::InvalidOption(format!(
                    "{}: '{}' has no value",
                    self.kind, setting
                )));
            }
            self.set_option(key, value)?;
            debug!("{}: {} set to {}", self.kind, key, value);
        }
        Ok(())
    }

    fn set_option(&mut self, key: &str, value: &str) -> Result<()> {
        match key.to_lowercase().as_str() {
            "port" => self.port = value.parse()?,
            "hostname" | "host" => self.hostname = value.to_string(),
            "header_version" => self.header.version = value.parse()?,
            "timeout" => self.header.timeout = Duration::from_millis(value.parse()?),
            "uri" => self.set_uri(value)?,
            "debug_level" => self.debug_level = value.parse()?,
            "on_error" => self.on_error = value.parse()?,
            "maxretry" => {
                self.max_retry = match value.to_lowercase().as_str() {
                    "none" => None,
                    n => Some(n.parse()?),
                }
            }
            "delimiter" => {
                self.delimiter = match value {
                    "none" => None,
                    d => Some(d.trim_matches('"').to_string()),
                }
            }
            "format" => {
                if value.len() > header::MAX_FORMAT_LEN {
                    return Err(Error::InvalidOption(format!(
                        "{}: format '{}' is longer than {} characters",
                        self.kind,
                        value,
                        header::MAX_FORMAT_LEN
                    )));
                }
                self.header.format = value.to_string();
            }
            "format_version" => self.header.format_version = value.parse()?,
            "maxsize" => self.max_message = value.parse()?,
            _ => {
                return Err(Error::InvalidOption(format!(
                    "{}: option '{}' not recognized",
                    self.kind, key
                )))
            }
        }
        Ok(())
    }

    /// Takes host and port out of `scheme://host:port`.
    fn set_uri(&mut self, uri: &str) -> Result<()> {
        let address = match uri.find("://") {
            Some(i) => &uri[i + 3..],
            None => uri,
        };
        let address = address.trim_end_matches('/');
        match address.rfind(':') {
            Some(i) => {
                self.hostname = address[..i].to_string();
                self.port = address[i + 1..].parse()?;
            }
            None => self.hostname = address.to_string(),
        }
        self.uri = Some(uri.to_string());
        Ok(())
    }

    fn target_address(&self) -> Result<SocketAddr> {
        (self.hostname.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| {
                Error::Transport(format!(
                    "unable to resolve {}:{}: {}",
                    self.hostname, self.port, e
                ))
            })?
            .next()
            .ok_or_else(|| {
                Error::Transport(format!("no address found for {}", self.hostname))
            })
    }

    /// Opens the underlying socket. Clients connect to the configured
    /// address, servers bind to it.
    pub fn init(&mut self) -> Result<()> {
        let mode = self.mode;
        let retries = self.connect_retries;
        let timeout = self.header.timeout;
        if let InnerTransport::Channel(c) = &self.inner {
            if !c.is_connected() {
                return Err(Error::Transport("channel transport has no peer".to_string()));
            }
        } else {
            let address = self.target_address()?;
            match &mut self.inner {
                InnerTransport::Udp(u) => u.init(mode, address, retries)?,
                InnerTransport::Tcp(t) => t.init(mode, address, retries, timeout)?,
                InnerTransport::Channel(_) => (),
            }
        }
        info!("{}: initialized as {} on {}:{}", self.kind, mode, self.hostname, self.port);
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        match &self.inner {
            InnerTransport::Udp(u) => u.local_addr(),
            InnerTransport::Tcp(t) => t.local_addr(),
            InnerTransport::Channel(_) => Err(Error::TransportUnavailable(self.kind)),
        }
    }

    /// Starts a new outgoing message.
    pub fn message_open(&mut self) -> Result<()> {
        if self.open {
            return Err(Error::Exchange(
                "new message opened while another one is pending".to_string(),
            ));
        }
        self.output.clear();
        self.field_count = 0;
        self.open = true;
        Ok(())
    }

    /// Appends a field, preceded by the delimiter unless it's the first
    /// field since the last reset. Returns the new message length.
    pub fn message_append(&mut self, field: &str) -> Result<usize> {
        if !self.open {
            return Err(Error::Exchange("no message is open".to_string()));
        }
        let delimiter = match &self.delimiter {
            Some(d) if self.field_count > 0 => d.as_str(),
            _ => "",
        };
        let len = self.output.len() + delimiter.len() + field.len();
        if len > self.max_message {
            return Err(Error::MessageOverflow {
                len,
                max: self.max_message,
            });
        }
        self.output.push_str(delimiter);
        self.output.push_str(field);
        self.field_count += 1;
        Ok(len)
    }

    pub fn message_continue(&mut self) -> Result<()> {
        if !self.open {
            return Err(Error::Exchange("no message to continue".to_string()));
        }
        Ok(())
    }

    pub fn message_close(&mut self) -> Result<()> {
        if !self.open {
            return Err(Error::Exchange("no message to close".to_string()));
        }
        self.open = false;
        Ok(())
    }

    /// Drops the pending outgoing message.
    pub fn message_discard(&mut self) {
        self.output.clear();
        self.field_count = 0;
        self.open = false;
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn reset_field_count(&mut self) {
        self.field_count = 0;
    }

    pub fn field_count(&self) -> usize {
        self.field_count
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    /// Body of the last received message.
    pub fn input(&self) -> &str {
        &self.input
    }

    /// Whether a received message is waiting to be decoded. Preloaded
    /// bytes only count once `recv` has processed them.
    pub fn has_input(&self) -> bool {
        self.has_input
    }

    /// Marks the received message as consumed.
    pub fn consume_input(&mut self) {
        self.has_input = false;
        self.scope.clear();
    }

    /// Parsed form of the last received body.
    pub fn translation(&self) -> Option<&Fields> {
        self.translation.as_ref()
    }

    pub fn reset_scope(&mut self) {
        self.scope.clear();
    }

    /// Descends into a nested group of the received body.
    pub fn enter_group(&mut self, name: &str) -> Result<()> {
        let exists = self
            .translation
            .as_ref()
            .and_then(|t| t.walk(&self.scope))
            .and_then(|g| g.group(name))
            .is_some();
        if !exists {
            return Err(Error::TagNotFound(name.to_string()));
        }
        self.scope.push(name.to_string());
        Ok(())
    }

    pub fn leave_group(&mut self) {
        self.scope.pop();
    }

    /// Looks up a tag in the current group of the received body.
    pub fn lookup(&self, tag: &str) -> Option<&FieldValue> {
        self.translation
            .as_ref()
            .and_then(|t| t.walk(&self.scope))
            .and_then(|g| g.get(tag))
    }

    /// Queues raw bytes to be processed by the next `recv`.
    pub fn preload(&mut self, raw: Vec<u8>) {
        self.preloaded = Some(raw);
    }

    fn frame(&self, body: &str) -> Result<Vec<u8>> {
        match self.inner {
            InnerTransport::Channel(_) => Ok(body.as_bytes().to_vec()),
            _ => {
                let mut framed = self.header.encode(body.len())?.into_bytes();
                framed.extend_from_slice(body.as_bytes());
                Ok(framed)
            }
        }
    }

    /// Sends the closed output message, returning the number of bytes put
    /// on the wire.
    pub fn send(&mut self) -> Result<usize> {
        if self.open {
            return Err(Error::Exchange(
                "message must be closed before sending".to_string(),
            ));
        }
        let framed = self.frame(&self.output)?;
        if self.debug_level > 0 {
            debug!("{}: sending '{}'", self.kind, String::from_utf8_lossy(&framed));
        }
        let sent = match &mut self.inner {
            InnerTransport::Udp(u) => u.send(&framed)?,
            InnerTransport::Tcp(t) => t.send(&framed)?,
            InnerTransport::Channel(c) => c.send(framed)?,
        };
        trace!("{}: sent {} bytes", self.kind, sent);
        Ok(sent)
    }

    fn recv_raw(&mut self) -> Result<Vec<u8>> {
        let timeout = self.header.timeout;
        match &mut self.inner {
            InnerTransport::Udp(u) => u.recv(timeout),
            InnerTransport::Tcp(t) => t.recv(timeout, &self.header, self.max_message),
            InnerTransport::Channel(c) => c.recv(timeout),
        }
    }

    /// Receives the next message, validating its header.
    ///
    /// Failures to receive are handled according to the error policy.
    /// Under `ignore` an empty message is reported by returning 0. Header
    /// validation failures always fail the receive.
    pub fn recv(&mut self) -> Result<usize> {
        let raw = match self.preloaded.take() {
            Some(raw) => raw,
            None => {
                let mut attempt = 0;
                loop {
                    match self.recv_raw() {
                        Ok(raw) => break raw,
                        Err(e @ Error::Protocol(_)) => {
                            warn!("{}: {}", self.kind, e);
                            return Err(e);
                        }
                        Err(e) => match self.on_error {
                            ErrorPolicy::Abort => {
                                debug!("{}: receive failed: {}", self.kind, e);
                                return Err(e);
                            }
                            ErrorPolicy::Ignore => {
                                debug!("{}: ignoring failed receive: {}", self.kind, e);
                                self.clear_input();
                                return Ok(0);
                            }
                            ErrorPolicy::Retry => {
                                if let Some(max) = self.max_retry {
                                    if attempt >= max {
                                        warn!(
                                            "{}: receive failed after {} retries: {}",
                                            self.kind, max, e
                                        );
                                        return Err(e);
                                    }
                                }
                                attempt += 1;
                                debug!("{}: receive failed ({}), retry {}", self.kind, e, attempt);
                            }
                        },
                    }
                }
            }
        };
        self.accept(raw)
    }

    fn clear_input(&mut self) {
        self.input.clear();
        self.translation = None;
        self.has_input = false;
        self.scope.clear();
    }

    fn accept(&mut self, raw: Vec<u8>) -> Result<usize> {
        self.clear_input();
        if self.debug_level > 0 {
            debug!("{}: received '{}'", self.kind, String::from_utf8_lossy(&raw));
        }
        let body = match self.inner {
            InnerTransport::Channel(_) => raw,
            _ => {
                let header = Header::parse(&raw, self.header.size)?;
                if let Err(e) = self.header.validate(&header) {
                    warn!("{}: {}", self.kind, e);
                    return Err(e);
                }
                self.header.body(&header, &raw)?.to_vec()
            }
        };
        self.input = String::from_utf8(body)
            .map_err(|_| Error::Protocol("message body is not valid utf-8".to_string()))?;
        if let Some(parser) = &self.parser {
            self.translation = Some(parser.parse(&self.input)?);
        }
        self.has_input = true;
        Ok(self.input.len())
    }

    /// Shuts down the underlying socket.
    pub fn close(&mut self) {
        match &mut self.inner {
            InnerTransport::Udp(u) => u.close(),
            InnerTransport::Tcp(t) => t.close(),
            InnerTransport::Channel(c) => c.close(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_are_applied() {
        let mut transport = Transport::new(TransportKind::Udp);
        transport
            .option("port=6267; hostname localhost, timeout=250")
            .unwrap();
        assert_eq!(transport.port, 6267);
        assert_eq!(transport.hostname, "localhost");
        assert_eq!(transport.header.timeout, Duration::from_millis(250));

        transport.option("on_error=retry,maxretry=none").unwrap();
        assert_eq!(transport.on_error, ErrorPolicy::Retry);
        assert_eq!(transport.max_retry, None);

        transport.option("uri=udp://10.0.0.2:5570").unwrap();
        assert_eq!(transport.hostname, "10.0.0.2");
        assert_eq!(transport.port, 5570);

        assert!(transport.option("bogus=1").is_err());
        assert!(transport.option("port").is_err());
        assert!(transport.option("format=TOOLONG").is_err());
        assert!(transport.option("on_error=halt").is_err());
    }

    #[test]
    fn append_respects_size_limit() {
        let mut transport = Transport::new(TransportKind::Udp);
        transport.option("maxsize=10").unwrap();
        transport.set_delimiter(Some(","));
        assert!(transport.message_append("x").is_err());
        transport.message_open().unwrap();
        assert_eq!(transport.message_append("abcd").unwrap(), 4);
        assert_eq!(transport.message_append("efgh").unwrap(), 9);
        assert!(transport.message_append("ij").is_err());
        assert_eq!(transport.output(), "abcd,efgh");
        assert!(transport.message_open().is_err());
        transport.message_close().unwrap();
        transport.message_open().unwrap();
        assert_eq!(transport.output(), "");
    }

    #[test]
    fn channel_pair_exchanges_bodies() {
        let (mut a, mut b) = Transport::channel_pair();
        b.set_parser(Some(Arc::new(crate::codec::PlainParser)));
        a.message_open().unwrap();
        a.message_append("{x=1}").unwrap();
        a.message_close().unwrap();
        a.send().unwrap();
        assert_eq!(b.recv().unwrap(), 5);
        assert_eq!(b.input(), "{x=1}");
        assert_eq!(b.lookup("x"), Some(&FieldValue::Text("1".to_string())));
    }

    fn serve_raw_header(header: &str) -> Result<usize> {
        use std::io::Write;
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, _) = listener.accept().unwrap();
        let mut server = Transport::from_tcp_stream(stream).unwrap();
        client.write_all(header.as_bytes()).unwrap();
        server.recv()
    }

    #[test]
    fn tcp_header_is_checked_before_body() {
        let oversized = "0 32  9999999 NONE  0.0 9 0     ";
        assert_eq!(oversized.len(), header::HEADER_SIZE);
        match serve_raw_header(oversized) {
            Err(Error::Protocol(msg)) => assert!(msg.contains("exceeds limit")),
            other => panic!("unexpected result: {:?}", other),
        }

        let malformed = format!("{:<32}", "0 32 9999999999999999 N 0 9 0");
        match serve_raw_header(&malformed) {
            Err(Error::Protocol(_)) => (),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}

