use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::thread::sleep;
use std::time::Duration;

use crate::connection::Mode;
use crate::error::{Error, Result};
use crate::transport::header::{Header, HeaderConfig};

const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Stream transport. Messages are framed by the textual header, which
/// carries the body length.
pub(crate) struct TcpTransport {
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new() -> Self {
        TcpTransport { stream: None }
    }

    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        Ok(TcpTransport {
            stream: Some(stream),
        })
    }

    /// Clients connect to `address`. Servers bind to it and block until a
    /// single peer connects.
    pub fn init(
        &mut self,
        mode: Mode,
        address: SocketAddr,
        retries: u32,
        timeout: Duration,
    ) -> Result<()> {
        let stream = match mode {
            Mode::Client => {
                let mut attempt = 0;
                loop {
                    let result = if timeout > Duration::from_secs(0) {
                        TcpStream::connect_timeout(&address, timeout)
                    } else {
                        TcpStream::connect(address)
                    };
                    match result {
                        Ok(stream) => break stream,
                        Err(e) if attempt < retries => {
                            attempt += 1;
                            debug!("tcp: connect to {} failed ({}), retry {}", address, e, attempt);
                            sleep(CONNECT_RETRY_DELAY);
                        }
                        Err(e) => {
                            return Err(Error::Transport(format!(
                                "tcp: unable to connect to {}: {}",
                                address, e
                            )))
                        }
                    }
                }
            }
            Mode::Server => {
                let listener = TcpListener::bind(address).map_err(|e| {
                    Error::Transport(format!("tcp: unable to bind to {}: {}", address, e))
                })?;
                trace!("tcp: waiting for a peer on {}", address);
                let (stream, peer) = listener.accept()?;
                debug!("tcp: accepted connection from {}", peer);
                stream
            }
        };
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        Ok(())
    }

    fn stream(&mut self) -> Result<&mut TcpStream> {
        self.stream.as_mut().ok_or(Error::NotInitialized)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        match &self.stream {
            Some(s) => Ok(s.local_addr()?),
            None => Err(Error::NotInitialized),
        }
    }

    pub fn send(&mut self, bytes: &[u8]) -> Result<usize> {
        let stream = self.stream()?;
        stream.write_all(bytes).map_err(map_io)?;
        stream.flush()?;
        Ok(bytes.len())
    }

    /// Reads a single framed message, header included.
    ///
    /// The header is validated before the body is read, and bodies longer
    /// than `max_length` are refused. Framing is lost after a rejected
    /// header, so the stream is shut down.
    pub fn recv(
        &mut self,
        timeout: Duration,
        config: &HeaderConfig,
        max_length: usize,
    ) -> Result<Vec<u8>> {
        let mut raw = vec![0; config.size];
        {
            let stream = self.stream()?;
            stream.set_read_timeout(if timeout == Duration::from_secs(0) {
                None
            } else {
                Some(timeout)
            })?;
            stream.read_exact(&mut raw).map_err(map_io)?;
        }
        let header = match Header::parse(&raw, config.size).and_then(|h| {
            config.validate(&h)?;
            Ok(h)
        }) {
            Ok(header) => header,
            Err(e) => {
                self.close();
                return Err(e);
            }
        };
        if header.length > max_length {
            self.close();
            return Err(Error::Protocol(format!(
                "message length {} exceeds limit of {}",
                header.length, max_length
            )));
        }
        let mut body = vec![0; header.length];
        self.stream()?.read_exact(&mut body).map_err(map_io)?;
        raw.extend_from_slice(&body);
        Ok(raw)
    }

    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.shutdown(Shutdown::Both).ok();
        }
    }
}

fn map_io(e: std::io::Error) -> Error {
    match e.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => Error::TimedOut,
        ErrorKind::UnexpectedEof
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe => Error::PeerDisconnected,
        _ => Error::Io(e),
    }
}
