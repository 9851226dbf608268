//! Socket channels: the polymorphic wrapper the reactor owns per connection.
//!
//! A channel is either a plain pass-through or a TLS channel driving its own
//! handshake state machine. Both expose the same operation set; the TLS
//! operations are no-ops on plain channels.

pub(crate) mod engine;
mod plain;
mod secure;

pub use plain::PlainChannel;
pub use secure::SecureChannel;

use crate::poll::PollHandle;
use mio::net::TcpStream;
use mio::{Interest, Token};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Notified when a channel's TLS handshake reaches FINISHED.
///
/// Implemented by the selector handle, which re-arms write interest if
/// application data was queued while the handshake was pending.
pub trait HandshakeListener: Send + Sync {
    fn handshake_complete(&self, token: Token);
}

/// The only channel state readable from other threads.
///
/// Both flags are published with release/acquire ordering; everything else a
/// channel owns is touched exclusively by the reactor thread (or, for the
/// engine, by the task worker while task_pending is set).
pub struct ChannelShared {
    handshake_pending: AtomicBool,
    task_pending: AtomicBool,
}

impl ChannelShared {
    fn new(handshake_pending: bool) -> Self {
        ChannelShared {
            handshake_pending: AtomicBool::new(handshake_pending),
            task_pending: AtomicBool::new(false),
        }
    }

    pub fn handshake_pending(&self) -> bool {
        self.handshake_pending.load(Ordering::Acquire)
    }

    pub(crate) fn set_handshake_pending(&self, pending: bool) {
        self.handshake_pending.store(pending, Ordering::Release);
    }

    pub(crate) fn task_pending(&self) -> bool {
        self.task_pending.load(Ordering::Acquire)
    }

    pub(crate) fn set_task_pending(&self, pending: bool) {
        self.task_pending.store(pending, Ordering::Release);
    }
}

/// Cheap, cloneable identity of a live channel.
///
/// Handed to packet listeners and accepted by send; consumers track their own
/// refs to detect disconnection. Equality and hashing are by token.
#[derive(Clone)]
pub struct ChannelRef {
    token: Token,
    shared: Arc<ChannelShared>,
}

impl ChannelRef {
    pub(crate) fn new(token: Token, shared: Arc<ChannelShared>) -> Self {
        ChannelRef { token, shared }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// False once FINISHED has been observed since the last session
    /// invalidation. Always false for plain channels.
    pub fn handshake_pending(&self) -> bool {
        self.shared.handshake_pending()
    }

    pub(crate) fn shared(&self) -> &Arc<ChannelShared> {
        &self.shared
    }

    #[cfg(test)]
    pub(crate) fn test_ref(token: Token) -> Self {
        ChannelRef::new(token, Arc::new(ChannelShared::new(false)))
    }
}

impl PartialEq for ChannelRef {
    fn eq(&self, other: &Self) -> bool {
        self.token == other.token
    }
}

impl Eq for ChannelRef {}

impl std::hash::Hash for ChannelRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.token.hash(state);
    }
}

impl fmt::Debug for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRef")
            .field("token", &self.token)
            .field("handshake_pending", &self.shared.handshake_pending())
            .finish()
    }
}

/// A registered connection: plain TCP or TLS over TCP.
pub enum Channel {
    Plain(PlainChannel),
    Secure(SecureChannel),
}

impl Channel {
    pub fn reference(&self) -> &ChannelRef {
        match self {
            Channel::Plain(c) => c.reference(),
            Channel::Secure(c) => c.reference(),
        }
    }

    pub(crate) fn stream_mut(&mut self) -> &mut TcpStream {
        match self {
            Channel::Plain(c) => c.stream_mut(),
            Channel::Secure(c) => c.stream_mut(),
        }
    }

    pub(crate) fn stream(&self) -> &TcpStream {
        match self {
            Channel::Plain(c) => c.stream(),
            Channel::Secure(c) => c.stream(),
        }
    }

    pub(crate) fn register(
        &mut self,
        poll: &PollHandle,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        poll.register(self.stream_mut(), token, interest)
    }

    pub(crate) fn reregister(
        &mut self,
        poll: &PollHandle,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        poll.reregister(self.stream_mut(), token, interest)
    }

    pub(crate) fn deregister(&mut self, poll: &PollHandle) -> io::Result<()> {
        poll.deregister(self.stream_mut())
    }

    /// Read decrypted application bytes. Ok(0) means the peer is gone;
    /// WouldBlock means no plaintext can be produced right now.
    pub(crate) fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        match self {
            Channel::Plain(c) => c.read(dst),
            Channel::Secure(c) => c.read(dst),
        }
    }

    /// Write application bytes, encrypting on TLS channels. Returns the
    /// number of plaintext bytes consumed.
    pub(crate) fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        match self {
            Channel::Plain(c) => c.write(src),
            Channel::Secure(c) => c.write(src),
        }
    }

    /// Drain any ciphertext still staged for the socket. Ok(true) when
    /// nothing remains buffered.
    pub(crate) fn flush_pending(&mut self) -> io::Result<bool> {
        match self {
            Channel::Plain(_) => Ok(true),
            Channel::Secure(c) => c.flush_pending(),
        }
    }

    /// Complete a non-blocking connect. Ok(true) once the socket is
    /// established; TLS channels then initiate their handshake.
    pub(crate) fn finish_connect(&mut self) -> io::Result<bool> {
        match self {
            Channel::Plain(c) => c.finish_connect(),
            Channel::Secure(c) => c.finish_connect(),
        }
    }

    pub(crate) fn close(&mut self) -> io::Result<()> {
        match self {
            Channel::Plain(c) => c.close(),
            Channel::Secure(c) => c.close(),
        }
    }

    pub fn handshake_pending(&self) -> bool {
        self.reference().handshake_pending()
    }

    pub(crate) fn init_handshake(&mut self) -> io::Result<()> {
        match self {
            Channel::Plain(_) => Ok(()),
            Channel::Secure(c) => c.init_handshake(),
        }
    }

    pub(crate) fn process_handshake(&mut self) -> io::Result<()> {
        match self {
            Channel::Plain(_) => Ok(()),
            Channel::Secure(c) => c.process_handshake(),
        }
    }

    pub(crate) fn invalidate_session(&mut self) {
        match self {
            Channel::Plain(_) => {}
            Channel::Secure(c) => c.invalidate_session(),
        }
    }

    /// Refresh the stored handshake result after a delegated task completed.
    pub(crate) fn update_result(&mut self) {
        match self {
            Channel::Plain(_) => {}
            Channel::Secure(c) => c.update_result(),
        }
    }
}

/// Shared non-blocking finish_connect check.
///
/// A connect error is reported through take_error; a still-in-progress
/// connect shows up as NotConnected from peer_addr.
pub(crate) fn finish_connect_check(stream: &TcpStream) -> io::Result<bool> {
    if let Some(err) = stream.take_error()? {
        return Err(err);
    }
    match stream.peer_addr() {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
        Err(e) => Err(e),
    }
}
