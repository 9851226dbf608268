use crate::error::Result;
use bytes::{Buf, BufMut, BytesMut};
use log::warn;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection};
use std::io::{self, Read, Write};
use std::sync::Arc;

/// Largest plaintext run the engine produces or consumes per record.
pub const MAX_PLAINTEXT_SIZE: usize = 16 * 1024;
/// Largest wire record, including header, MAC and padding margin.
pub const MAX_RECORD_SIZE: usize = MAX_PLAINTEXT_SIZE + 2 * 1024;

/// What the engine needs next to make handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// A delegated cryptographic task must run before anything else
    NeedTask,
    /// Ciphertext from the peer must be fed in
    NeedUnwrap,
    /// Pending records must be produced and flushed
    NeedWrap,
    /// The handshake just completed; reported exactly once
    Finished,
    NotHandshaking,
}

/// Outcome classification of a wrap or unwrap step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Ok,
    /// Not enough ciphertext for a complete record
    BufferUnderflow,
    /// No room in the destination buffer to make progress
    BufferOverflow,
    /// close_notify has been exchanged in the relevant direction
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineResult {
    pub status: EngineStatus,
    pub handshake: HandshakeStatus,
}

/// Retained construction data so a session invalidation can rebuild the
/// connection state in place.
pub(crate) enum EngineConfig {
    Client {
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    },
    Server {
        config: Arc<ServerConfig>,
    },
}

impl EngineConfig {
    fn connect(&self) -> Result<Connection> {
        match self {
            EngineConfig::Client {
                config,
                server_name,
            } => Ok(Connection::Client(ClientConnection::new(
                config.clone(),
                server_name.clone(),
            )?)),
            EngineConfig::Server { config } => {
                Ok(Connection::Server(ServerConnection::new(config.clone())?))
            }
        }
    }
}

/// Sans-io TLS engine.
///
/// Wraps a rustls connection behind wrap/unwrap operations over caller-owned
/// byte buffers. In off-thread mode, record processing during the handshake is
/// deferred: unwrap stages the ciphertext and reports NeedTask, and the
/// delegated-task worker performs the processing via run_delegated_tasks.
pub struct TlsEngine {
    conn: Connection,
    config: EngineConfig,
    defer_tasks: bool,
    task_ready: bool,
    finished_pending: bool,
    was_handshaking: bool,
    peer_closed: bool,
    sent_close_notify: bool,
    deferred_error: Option<rustls::Error>,
}

impl TlsEngine {
    pub(crate) fn new(config: EngineConfig, defer_tasks: bool) -> Result<Self> {
        let conn = config.connect()?;
        Ok(TlsEngine {
            conn,
            config,
            defer_tasks,
            task_ready: false,
            finished_pending: false,
            was_handshaking: true,
            peer_closed: false,
            sent_close_notify: false,
            deferred_error: None,
        })
    }

    /// Discard the session and prepare a fresh handshake on the same
    /// transport. TLS 1.3 has no renegotiation, so invalidation rebuilds the
    /// connection from the retained configuration.
    pub(crate) fn reset(&mut self) -> Result<()> {
        self.conn = self.config.connect()?;
        self.task_ready = false;
        self.finished_pending = false;
        self.was_handshaking = true;
        self.peer_closed = false;
        self.sent_close_notify = false;
        self.deferred_error = None;
        Ok(())
    }

    pub(crate) fn handshake_status(&self) -> HandshakeStatus {
        if self.task_ready {
            HandshakeStatus::NeedTask
        } else if self.finished_pending {
            HandshakeStatus::Finished
        } else if self.conn.is_handshaking() {
            if self.conn.wants_write() {
                HandshakeStatus::NeedWrap
            } else {
                HandshakeStatus::NeedUnwrap
            }
        } else if self.sent_close_notify && self.conn.wants_write() {
            // a queued close_notify still needs wrapping out
            HandshakeStatus::NeedWrap
        } else {
            HandshakeStatus::NotHandshaking
        }
    }

    /// The FINISHED transition is reported once; the channel acknowledges it
    /// after notifying its handshake listener.
    pub(crate) fn acknowledge_finished(&mut self) {
        self.finished_pending = false;
    }

    pub(crate) fn is_inbound_done(&self) -> bool {
        self.peer_closed
    }

    pub(crate) fn is_outbound_done(&self) -> bool {
        self.sent_close_notify && !self.conn.wants_write()
    }

    /// Queue a close_notify for the outbound half.
    pub(crate) fn close_outbound(&mut self) {
        if !self.sent_close_notify {
            self.conn.send_close_notify();
            self.sent_close_notify = true;
        }
    }

    /// Fails when the peer dropped the link without sending close_notify.
    pub(crate) fn close_inbound(&mut self) -> io::Result<()> {
        if self.peer_closed {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "peer closed without close_notify",
            ))
        }
    }

    /// Feed ciphertext from src into the engine and decrypt into dst.
    pub(crate) fn unwrap(
        &mut self,
        src: &mut BytesMut,
        dst: &mut BytesMut,
    ) -> io::Result<EngineResult> {
        let mut fed = 0;
        while !src.is_empty() {
            let mut reader = (&mut *src).reader();
            let n = self.conn.read_tls(&mut reader)?;
            if n == 0 {
                break;
            }
            fed += n;
        }
        if self.defer_tasks && self.conn.is_handshaking() && (self.task_ready || fed > 0) {
            // record processing is the delegated task; it stays queued for
            // the task worker even if more ciphertext arrives meanwhile
            self.task_ready = true;
            return Ok(EngineResult {
                status: EngineStatus::Ok,
                handshake: HandshakeStatus::NeedTask,
            });
        }
        self.process(dst)
    }

    fn process(&mut self, dst: &mut BytesMut) -> io::Result<EngineResult> {
        if let Some(err) = self.deferred_error.take() {
            return Err(tls_to_io(err));
        }
        let state = self.conn.process_new_packets().map_err(tls_to_io)?;
        self.note_progress();
        if state.peer_has_closed() {
            self.peer_closed = true;
        }

        let mut produced = 0;
        let available = state.plaintext_bytes_to_read();
        if available > 0 {
            let free = MAX_PLAINTEXT_SIZE.saturating_sub(dst.len());
            if free == 0 {
                return Ok(EngineResult {
                    status: EngineStatus::BufferOverflow,
                    handshake: self.handshake_status(),
                });
            }
            let take = available.min(free);
            let start = dst.len();
            dst.resize(start + take, 0);
            let n = self.conn.reader().read(&mut dst[start..])?;
            dst.truncate(start + n);
            produced = n;
        }

        // no plaintext out, nothing queued to send, handshake not at a
        // reportable transition: the engine is starved for ciphertext
        let status = if self.peer_closed {
            EngineStatus::Closed
        } else if produced == 0 && !self.finished_pending && !self.conn.wants_write() {
            EngineStatus::BufferUnderflow
        } else {
            EngineStatus::Ok
        };
        Ok(EngineResult {
            status,
            handshake: self.handshake_status(),
        })
    }

    /// Consume plaintext from src and emit ciphertext records into dst.
    pub(crate) fn wrap(
        &mut self,
        src: &mut BytesMut,
        dst: &mut BytesMut,
    ) -> io::Result<EngineResult> {
        if let Some(err) = self.deferred_error.take() {
            return Err(tls_to_io(err));
        }
        // a closed outbound half accepts no further plaintext, but pending
        // records (including the close_notify itself) still go out
        let rejected = self.sent_close_notify && !src.is_empty();
        if !rejected {
            while !src.is_empty() {
                let n = self.conn.writer().write(&src[..])?;
                if n == 0 {
                    break;
                }
                src.advance(n);
            }
        }

        let mut emitted = 0;
        let mut blocked = false;
        while self.conn.wants_write() {
            if dst.len() >= MAX_RECORD_SIZE {
                blocked = emitted == 0;
                break;
            }
            let mut writer = (&mut *dst).writer();
            let n = self.conn.write_tls(&mut writer)?;
            if n == 0 {
                break;
            }
            emitted += n;
        }
        self.note_progress();

        let status = if rejected || self.peer_closed || self.is_outbound_done() {
            EngineStatus::Closed
        } else if blocked {
            EngineStatus::BufferOverflow
        } else {
            EngineStatus::Ok
        };
        Ok(EngineResult {
            status,
            handshake: self.handshake_status(),
        })
    }

    /// Perform the deferred record processing on the task worker thread.
    /// Failures are stashed and surface on the next engine operation from
    /// the reactor.
    pub(crate) fn run_delegated_tasks(&mut self) {
        self.task_ready = false;
        match self.conn.process_new_packets() {
            Ok(state) => {
                if state.peer_has_closed() {
                    self.peer_closed = true;
                }
                self.note_progress();
            }
            Err(err) => {
                warn!("delegated TLS task failed: {}", err);
                self.deferred_error = Some(err);
            }
        }
    }

    fn note_progress(&mut self) {
        if self.was_handshaking && !self.conn.is_handshaking() {
            self.was_handshaking = false;
            self.finished_pending = true;
        }
    }
}

fn tls_to_io(err: rustls::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
