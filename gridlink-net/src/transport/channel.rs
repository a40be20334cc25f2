use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::error::{Error, Result};

/// One end of an in-process message pipe.
pub(crate) struct ChannelTransport {
    sender: Option<Sender<Vec<u8>>>,
    receiver: Option<Receiver<Vec<u8>>>,
}

impl ChannelTransport {
    pub fn disconnected() -> Self {
        ChannelTransport {
            sender: None,
            receiver: None,
        }
    }

    pub fn pair() -> (Self, Self) {
        let (a_send, b_recv) = unbounded();
        let (b_send, a_recv) = unbounded();
        (
            ChannelTransport {
                sender: Some(a_send),
                receiver: Some(a_recv),
            },
            ChannelTransport {
                sender: Some(b_send),
                receiver: Some(b_recv),
            },
        )
    }

    pub fn is_connected(&self) -> bool {
        self.sender.is_some() && self.receiver.is_some()
    }

    pub fn send(&mut self, bytes: Vec<u8>) -> Result<usize> {
        let len = bytes.len();
        self.sender
            .as_ref()
            .ok_or(Error::NotInitialized)?
            .send(bytes)
            .map_err(|_| Error::PeerDisconnected)?;
        Ok(len)
    }

    pub fn recv(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let receiver = self.receiver.as_ref().ok_or(Error::NotInitialized)?;
        if timeout == Duration::from_secs(0) {
            return receiver.recv().map_err(|_| Error::PeerDisconnected);
        }
        receiver.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => Error::TimedOut,
            RecvTimeoutError::Disconnected => Error::PeerDisconnected,
        })
    }

    pub fn close(&mut self) {
        self.sender = None;
        self.receiver = None;
    }
}
