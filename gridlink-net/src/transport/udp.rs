use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::thread::sleep;
use std::time::Duration;

use crate::connection::Mode;
use crate::error::{Error, Result};

/// Largest datagram accepted on receive.
const RECV_BUFFER_SIZE: usize = 65536;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

pub(crate) struct UdpTransport {
    socket: Option<UdpSocket>,
    peer: Option<SocketAddr>,
    connected: bool,
}

impl UdpTransport {
    pub fn new() -> Self {
        UdpTransport {
            socket: None,
            peer: None,
            connected: false,
        }
    }

    /// Server side transport answering a known peer over a shared socket.
    pub fn from_socket(socket: UdpSocket, peer: SocketAddr) -> Self {
        UdpTransport {
            socket: Some(socket),
            peer: Some(peer),
            connected: false,
        }
    }

    pub fn init(&mut self, mode: Mode, address: SocketAddr, retries: u32) -> Result<()> {
        match mode {
            Mode::Server => {
                let socket = UdpSocket::bind(address).map_err(|e| {
                    Error::Transport(format!("udp: unable to bind to {}: {}", address, e))
                })?;
                trace!("udp: bound to {}", address);
                self.socket = Some(socket);
                self.connected = false;
            }
            Mode::Client => {
                let local: SocketAddr = if address.is_ipv4() {
                    ([0u8; 4], 0).into()
                } else {
                    ([0u16; 8], 0).into()
                };
                let socket = UdpSocket::bind(local)
                    .map_err(|e| Error::Transport(format!("udp: unable to create socket: {}", e)))?;
                let mut attempt = 0;
                loop {
                    match socket.connect(address) {
                        Ok(()) => break,
                        Err(e) if attempt < retries => {
                            attempt += 1;
                            debug!("udp: connect to {} failed ({}), retry {}", address, e, attempt);
                            sleep(CONNECT_RETRY_DELAY);
                        }
                        Err(e) => {
                            return Err(Error::Transport(format!(
                                "udp: unable to connect to {}: {}",
                                address, e
                            )))
                        }
                    }
                }
                self.socket = Some(socket);
                self.peer = Some(address);
                self.connected = true;
            }
        }
        Ok(())
    }

    fn socket(&self) -> Result<&UdpSocket> {
        self.socket.as_ref().ok_or(Error::NotInitialized)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket()?.local_addr()?)
    }

    pub fn send(&mut self, bytes: &[u8]) -> Result<usize> {
        let socket = self.socket()?;
        let sent = if self.connected {
            socket.send(bytes)?
        } else {
            let peer = self.peer.ok_or(Error::NoPeerAddress)?;
            socket.send_to(bytes, peer)?
        };
        Ok(sent)
    }

    /// Waits up to `timeout` for a single datagram. A zero timeout waits
    /// forever.
    pub fn recv(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let socket = self.socket()?;
        socket.set_read_timeout(if timeout == Duration::from_secs(0) {
            None
        } else {
            Some(timeout)
        })?;
        let mut buf = vec![0; RECV_BUFFER_SIZE];
        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(r) => r,
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                return Err(Error::TimedOut)
            }
            Err(e) => return Err(e.into()),
        };
        if !self.connected {
            self.peer = Some(from);
        }
        buf.truncate(len);
        Ok(buf)
    }

    pub fn close(&mut self) {
        self.socket = None;
        self.connected = false;
    }
}
