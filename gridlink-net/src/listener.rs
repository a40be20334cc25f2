//! Supervised server listener.
//!
//! A [`Listener`] accepts TCP connections and UDP datagrams on one thread
//! per listening socket and hands them over a job queue to a fixed pool of
//! worker threads. Each worker runs a server-mode [`Connection`] for the
//! job, asking the [`SessionHandler`] for the variable map to serve.
//!
//! [`Listener::shutdown`] raises the stop flag, closes the job queue and
//! joins every thread.
//!
//! [`Listener`]: struct.Listener.html
//! [`Listener::shutdown`]: struct.Listener.html#method.shutdown
//! [`Connection`]: ../connection/struct.Connection.html
//! [`SessionHandler`]: trait.SessionHandler.html

use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use gridlink_core::VarMap;

use crate::connection::{Connection, Mode};
use crate::error::{Error, Result};
use crate::transport::Transport;

/// Largest datagram accepted by the udp listener.
const DATAGRAM_SIZE: usize = 65536;

/// Configuration settings for the listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Address for accepting tcp connections
    pub tcp_address: Option<String>,
    /// Address for receiving udp datagrams
    pub udp_address: Option<String>,
    /// Number of worker threads
    pub workers: usize,
    /// Maximum number of queued jobs
    pub queue_size: usize,
    /// Time between polls in the accept loops
    #[serde(with = "millis")]
    pub poll_wait: Duration,
    /// Receive timeout of session transports
    #[serde(with = "millis")]
    pub session_timeout: Duration,
    /// Construction tokens applied to every session connection, e.g.
    /// `on_error=halt` or `readcache:size 1024`
    pub options: Vec<String>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        ListenerConfig {
            tcp_address: None,
            udp_address: None,
            workers: 4,
            queue_size: 64,
            poll_wait: Duration::from_millis(10),
            session_timeout: Duration::from_millis(500),
            options: Vec::new(),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Server side application logic.
pub trait SessionHandler: Send + Sync {
    /// Prepares a new session, returning the map of values it exchanges.
    ///
    /// The handler is expected to resolve the map and link it to the
    /// connection's caches.
    fn open_session(&self, connection: &mut Connection) -> Result<VarMap>;

    /// Called after every answered message.
    fn handled(&self, method: &str, connection: &Connection) {}
}

enum Job {
    Stream(std::net::TcpStream),
    Datagram {
        socket: UdpSocket,
        peer: SocketAddr,
        datagram: Vec<u8>,
    },
}

/// Running listener.
pub struct Listener {
    running: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    tcp_addr: Option<SocketAddr>,
    udp_addr: Option<SocketAddr>,
}

impl Listener {
    /// Binds the configured sockets and starts all threads.
    pub fn start(config: ListenerConfig, handler: Arc<dyn SessionHandler>) -> Result<Listener> {
        if config.tcp_address.is_none() && config.udp_address.is_none() {
            return Err(Error::Transport(
                "listener needs a tcp or udp address".to_string(),
            ));
        }
        let config = Arc::new(config);
        let running = Arc::new(AtomicBool::new(true));
        let (sender, receiver) = bounded::<Job>(config.queue_size.max(1));
        let mut threads = Vec::new();

        let mut tcp_addr = None;
        if let Some(address) = &config.tcp_address {
            let listener = TcpListener::bind(address.as_str()).map_err(|e| {
                Error::Transport(format!("tcp: unable to listen on {}: {}", address, e))
            })?;
            listener.set_nonblocking(true)?;
            tcp_addr = Some(listener.local_addr()?);
            info!("listener: accepting tcp connections on {}", listener.local_addr()?);
            let running = running.clone();
            let sender = sender.clone();
            let poll_wait = config.poll_wait;
            threads.push(
                thread::Builder::new()
                    .name("gridlink-tcp-accept".to_string())
                    .spawn(move || accept_tcp(listener, sender, running, poll_wait))?,
            );
        }

        let mut udp_addr = None;
        if let Some(address) = &config.udp_address {
            let socket = UdpSocket::bind(address.as_str()).map_err(|e| {
                Error::Transport(format!("udp: unable to bind to {}: {}", address, e))
            })?;
            socket.set_read_timeout(Some(config.poll_wait.max(Duration::from_millis(1))))?;
            udp_addr = Some(socket.local_addr()?);
            info!("listener: receiving udp datagrams on {}", socket.local_addr()?);
            let running = running.clone();
            let sender = sender.clone();
            threads.push(
                thread::Builder::new()
                    .name("gridlink-udp-recv".to_string())
                    .spawn(move || receive_udp(socket, sender, running))?,
            );
        }
        // acceptors own the remaining senders
        drop(sender);

        for n in 0..config.workers.max(1) {
            let receiver = receiver.clone();
            let running = running.clone();
            let handler = handler.clone();
            let config = config.clone();
            threads.push(
                thread::Builder::new()
                    .name(format!("gridlink-worker-{}", n))
                    .spawn(move || work(receiver, running, handler, config))?,
            );
        }

        Ok(Listener {
            running,
            threads,
            tcp_addr,
            udp_addr,
        })
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp_addr
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp_addr
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stops accepting, lets workers finish their current job and joins
    /// all threads.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("").to_string();
            if handle.join().is_err() {
                error!("listener: thread {} panicked", name);
            }
        }
        debug!("listener: all threads joined");
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.shutdown();
        }
    }
}

fn accept_tcp(listener: TcpListener, sender: Sender<Job>, running: Arc<AtomicBool>, poll_wait: Duration) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("listener: tcp connection from {}", peer);
                if sender.send(Job::Stream(stream)).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(poll_wait),
            Err(e) => {
                warn!("listener: tcp accept failed: {}", e);
                thread::sleep(poll_wait);
            }
        }
    }
}

fn receive_udp(socket: UdpSocket, sender: Sender<Job>, running: Arc<AtomicBool>) {
    let mut buf = vec![0; DATAGRAM_SIZE];
    while running.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((len, peer)) => {
                trace!("listener: {} byte datagram from {}", len, peer);
                let reply_socket = match socket.try_clone() {
                    Ok(s) => s,
                    Err(e) => {
                        error!("listener: unable to share udp socket: {}", e);
                        continue;
                    }
                };
                let job = Job::Datagram {
                    socket: reply_socket,
                    peer,
                    datagram: buf[..len].to_vec(),
                };
                if sender.send(job).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => (),
            Err(e) => warn!("listener: udp receive failed: {}", e),
        }
    }
}

fn work(
    receiver: Receiver<Job>,
    running: Arc<AtomicBool>,
    handler: Arc<dyn SessionHandler>,
    config: Arc<ListenerConfig>,
) {
    while running.load(Ordering::SeqCst) {
        let job = match receiver.recv_timeout(config.poll_wait) {
            Ok(job) => job,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let result = match job {
            Job::Stream(stream) => Transport::from_tcp_stream(stream)
                .and_then(|t| serve(t, &running, handler.as_ref(), &config, true)),
            Job::Datagram {
                socket,
                peer,
                datagram,
            } => {
                let transport = Transport::from_udp_datagram(socket, peer, datagram);
                serve(transport, &running, handler.as_ref(), &config, false)
            }
        };
        if let Err(e) = result {
            warn!("listener: session ended with error: {}", e);
        }
    }
}

/// Runs a single session. Stream sessions answer messages until the peer
/// disconnects, datagram sessions answer the queued datagram only.
fn serve(
    mut transport: Transport,
    running: &AtomicBool,
    handler: &dyn SessionHandler,
    config: &ListenerConfig,
    stream: bool,
) -> Result<()> {
    transport.set_timeout(config.session_timeout);
    let mut connection = Connection::with_transport(Mode::Server, transport);
    for token in &config.options {
        connection.configure(token)?;
    }
    let mut map = handler.open_session(&mut connection)?;
    loop {
        match connection.respond(&mut map, None) {
            Ok(method) => handler.handled(&method, &connection),
            Err(Error::TimedOut) if stream => (),
            Err(Error::PeerDisconnected) => {
                debug!("listener: peer disconnected");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        if !stream || !running.load(Ordering::SeqCst) {
            return Ok(());
        }
    }
}
