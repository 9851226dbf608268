use super::{finish_connect_check, ChannelRef, ChannelShared};
use mio::net::TcpStream;
use mio::Token;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::sync::Arc;

/// Byte pass-through channel. Handshake operations are no-ops.
pub struct PlainChannel {
    stream: TcpStream,
    reference: ChannelRef,
}

impl PlainChannel {
    pub(crate) fn new(stream: TcpStream, token: Token) -> Self {
        PlainChannel {
            stream,
            reference: ChannelRef::new(token, Arc::new(ChannelShared::new(false))),
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

    pub(crate) fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        self.stream.read(dst)
    }

    pub(crate) fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        if src.is_empty() {
            return Ok(0);
        }
        self.stream.write(src)
    }

    pub(crate) fn finish_connect(&mut self) -> io::Result<bool> {
        finish_connect_check(&self.stream)
    }

    pub(crate) fn close(&mut self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e),
        }
    }
}
