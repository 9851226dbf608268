use super::engine::{
    EngineResult, EngineStatus, HandshakeStatus, TlsEngine, MAX_PLAINTEXT_SIZE, MAX_RECORD_SIZE,
};
use super::{finish_connect_check, ChannelRef, ChannelShared, HandshakeListener};
use crate::task::{TaskHandle, TaskWorker};
use crate::timeout::{Timeout, TimeoutWorker};
use bytes::{Buf, BytesMut};
use log::warn;
use mio::net::TcpStream;
use mio::Token;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// TLS channel: a TCP stream plus the engine and the four role-specific
/// buffers the handshake and record layer work through.
///
/// encrypted_in holds ciphertext read from the socket that the engine has not
/// yet consumed; decrypted_in holds plaintext not yet handed to the caller;
/// decrypted_out stages plaintext awaiting encryption; encrypted_out holds
/// records awaiting the socket. All methods run on the reactor thread, except
/// the engine's delegated tasks which the task worker drives while
/// task_pending is set.
pub struct SecureChannel {
    stream: TcpStream,
    reference: ChannelRef,
    engine: Arc<Mutex<TlsEngine>>,
    encrypted_in: BytesMut,
    encrypted_out: BytesMut,
    decrypted_in: BytesMut,
    decrypted_out: BytesMut,
    timeout: Arc<Timeout>,
    timeouts: Arc<TimeoutWorker>,
    tasks: Option<Arc<TaskWorker>>,
    hs_listener: Arc<dyn HandshakeListener>,
}

impl SecureChannel {
    pub(crate) fn new(
        stream: TcpStream,
        token: Token,
        engine: TlsEngine,
        timeout_period: Duration,
        timeouts: Arc<TimeoutWorker>,
        tasks: Option<Arc<TaskWorker>>,
        hs_listener: Arc<dyn HandshakeListener>,
    ) -> Self {
        SecureChannel {
            stream,
            reference: ChannelRef::new(token, Arc::new(ChannelShared::new(true))),
            engine: Arc::new(Mutex::new(engine)),
            encrypted_in: BytesMut::with_capacity(MAX_RECORD_SIZE),
            encrypted_out: BytesMut::with_capacity(MAX_RECORD_SIZE),
            decrypted_in: BytesMut::with_capacity(MAX_PLAINTEXT_SIZE),
            decrypted_out: BytesMut::with_capacity(MAX_PLAINTEXT_SIZE),
            timeout: Arc::new(Timeout::new(token, timeout_period)),
            timeouts,
            tasks,
            hs_listener,
        }
    }

    pub fn reference(&self) -> &ChannelRef {
        &self.reference
    }

    pub(crate) fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub(crate) fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub(crate) fn init_handshake(&mut self) -> io::Result<()> {
        self.process_handshake()
    }

    /// Drive the handshake as far as it can go without blocking.
    ///
    /// Dispatches on the engine's current status; each productive step
    /// re-enters until a step reports that progress is blocked on the socket
    /// or on a delegated task.
    pub(crate) fn process_handshake(&mut self) -> io::Result<()> {
        let status = self.engine.lock().unwrap().handshake_status();
        match status {
            HandshakeStatus::NeedTask => self.run_delegated_tasks(),
            HandshakeStatus::NeedUnwrap => {
                let inbound_done = self.engine.lock().unwrap().is_inbound_done();
                if !inbound_done {
                    self.fill_encrypted_in()?;
                }
                let result = {
                    let mut engine = self.engine.lock().unwrap();
                    engine.unwrap(&mut self.encrypted_in, &mut self.decrypted_in)?
                };
                // a starved mid-handshake peer gets the same bounded wait as
                // the application read path
                match result.status {
                    EngineStatus::BufferUnderflow => {
                        self.timeouts.insert(self.timeout.clone());
                    }
                    EngineStatus::Ok => {
                        if !self.timeout.has_fired() {
                            self.timeouts.cancel(&self.timeout);
                        }
                    }
                    _ => {}
                }
                self.check_result(result)
            }
            HandshakeStatus::NeedWrap => {
                let result = {
                    let mut engine = self.engine.lock().unwrap();
                    engine.wrap(&mut self.decrypted_out, &mut self.encrypted_out)?
                };
                if result.status == EngineStatus::Closed {
                    // best-effort close_notify; the peer may already be gone
                    let _ = self.flush();
                } else {
                    self.flush()?;
                }
                self.check_result(result)
            }
            HandshakeStatus::Finished => {
                self.reference.shared().set_handshake_pending(false);
                self.engine.lock().unwrap().acknowledge_finished();
                self.hs_listener.handshake_complete(self.reference.token());
                Ok(())
            }
            HandshakeStatus::NotHandshaking => Ok(()),
        }
    }

    fn check_result(&mut self, result: EngineResult) -> io::Result<()> {
        match result.status {
            EngineStatus::BufferUnderflow | EngineStatus::BufferOverflow => Ok(()),
            EngineStatus::Closed => {
                if self.engine.lock().unwrap().is_outbound_done() {
                    let _ = self.stream.shutdown(Shutdown::Write);
                }
                Ok(())
            }
            EngineStatus::Ok => self.process_handshake(),
        }
    }

    fn run_delegated_tasks(&mut self) -> io::Result<()> {
        match &self.tasks {
            None => {
                // single-threaded mode runs the task inline and keeps going
                self.engine.lock().unwrap().run_delegated_tasks();
                self.process_handshake()
            }
            Some(worker) => {
                if !self.reference.shared().task_pending() {
                    self.reference.shared().set_task_pending(true);
                    worker.add(TaskHandle::new(self.reference.token(), self.engine.clone()));
                }
                Ok(())
            }
        }
    }

    /// One non-blocking socket read into encrypted_in. Returns true on EOF.
    fn fill_encrypted_in(&mut self) -> io::Result<bool> {
        let mut tmp = [0u8; 8192];
        match self.stream.read(&mut tmp) {
            Ok(0) => Ok(true),
            Ok(n) => {
                self.encrypted_in.extend_from_slice(&tmp[..n]);
                Ok(false)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Application read: ciphertext off the socket, through the engine, into
    /// the caller's buffer.
    pub(crate) fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        if self.engine.lock().unwrap().is_inbound_done() && self.decrypted_in.is_empty() {
            return Ok(0);
        }

        let eof = self.fill_encrypted_in()?;
        if eof && self.encrypted_in.is_empty() && self.decrypted_in.is_empty() {
            // remote vanished without close_notify; surface EOF and leave the
            // engine's inbound state to the close path
            return Ok(0);
        }

        let result = {
            let mut engine = self.engine.lock().unwrap();
            engine.unwrap(&mut self.encrypted_in, &mut self.decrypted_in)?
        };
        match result.status {
            EngineStatus::BufferUnderflow => {
                if self.decrypted_in.is_empty() {
                    // half-open peers idling mid-record get a bounded wait
                    self.timeouts.insert(self.timeout.clone());
                    return Err(io::ErrorKind::WouldBlock.into());
                }
            }
            EngineStatus::BufferOverflow => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "decrypted buffer was not drained",
                ));
            }
            EngineStatus::Closed => {
                let _ = self.stream.shutdown(Shutdown::Read);
            }
            EngineStatus::Ok => {
                if !self.timeout.has_fired() {
                    self.timeouts.cancel(&self.timeout);
                }
            }
        }

        self.process_handshake()?;

        let n = self.drain_decrypted(dst);
        if n == 0 {
            if eof {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        Ok(n)
    }

    fn drain_decrypted(&mut self, dst: &mut [u8]) -> usize {
        let n = self.decrypted_in.len().min(dst.len());
        dst[..n].copy_from_slice(&self.decrypted_in[..n]);
        self.decrypted_in.advance(n);
        n
    }

    /// Application write: plaintext through the engine and out the socket.
    /// Returns the plaintext bytes consumed.
    pub(crate) fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        if src.is_empty() {
            return Ok(0);
        }
        self.decrypted_out.extend_from_slice(src);

        let result = {
            let mut engine = self.engine.lock().unwrap();
            engine.wrap(&mut self.decrypted_out, &mut self.encrypted_out)?
        };
        match result.status {
            EngineStatus::BufferUnderflow | EngineStatus::BufferOverflow => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "TLS write could not make progress",
                ));
            }
            EngineStatus::Closed => {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "TLS engine is closed",
                ));
            }
            EngineStatus::Ok => {}
        }

        self.process_handshake()?;
        self.flush()?;
        Ok(src.len())
    }

    /// Push pending ciphertext to the socket; stops on WouldBlock.
    fn flush(&mut self) -> io::Result<()> {
        while !self.encrypted_out.is_empty() {
            match self.stream.write(&self.encrypted_out[..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.encrypted_out.advance(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub(crate) fn flush_pending(&mut self) -> io::Result<bool> {
        self.flush()?;
        Ok(self.encrypted_out.is_empty())
    }

    pub(crate) fn finish_connect(&mut self) -> io::Result<bool> {
        let connected = finish_connect_check(&self.stream)?;
        if connected {
            self.init_handshake()?;
        }
        Ok(connected)
    }

    pub(crate) fn invalidate_session(&mut self) {
        // push out anything the old session already encrypted, then drop
        // whatever state it left behind
        let _ = self.flush();
        self.encrypted_in.clear();
        self.encrypted_out.clear();
        self.decrypted_in.clear();
        self.decrypted_out.clear();
        if let Err(e) = self.engine.lock().unwrap().reset() {
            warn!(
                "session reset failed for {:?}: {}",
                self.reference.token(),
                e
            );
        }
        self.reference.shared().set_handshake_pending(true);
        self.reference.shared().set_task_pending(false);
    }

    /// Called when a TaskComplete change is dispatched: the worker already
    /// advanced the engine, so only the pending flag needs clearing.
    pub(crate) fn update_result(&mut self) {
        self.reference.shared().set_task_pending(false);
    }

    /// Graceful close: flush, exchange close_notify where possible, then
    /// release the socket unconditionally.
    pub(crate) fn close(&mut self) -> io::Result<()> {
        let result = (|| -> io::Result<()> {
            self.flush()?;
            let (outbound_done, inbound_done) = {
                let engine = self.engine.lock().unwrap();
                (engine.is_outbound_done(), engine.is_inbound_done())
            };
            if !outbound_done {
                self.engine.lock().unwrap().close_outbound();
                self.process_handshake()?;
            } else if !inbound_done {
                self.engine.lock().unwrap().close_inbound()?;
                self.process_handshake()?;
            }
            Ok(())
        })();

        if !self.timeout.has_fired() {
            self.timeouts.cancel(&self.timeout);
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        result
    }
}
