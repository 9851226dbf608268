use crate::channel::ChannelRef;
use crate::config::Config;
use crate::error::Result;
use crate::packet::{Packet, PacketListener, PacketWorker};
use crate::selector::{Role, Selector, SelectorHandle};
use crate::tls::TlsContext;
use log::debug;
use std::net::SocketAddr;
use std::sync::Arc;

/// Client role: one outbound socket driven by its own reactor.
///
/// The socket is registered for connect-readiness at construction; once the
/// connect finishes, TLS clients initiate their handshake. Closing the socket
/// stops the whole reactor, since a client has nothing else to drive.
pub struct TcpClient {
    selector: Selector,
    channel: ChannelRef,
    packet_worker: Arc<PacketWorker>,
}

impl TcpClient {
    pub fn new(
        addr: SocketAddr,
        packet_worker: Arc<PacketWorker>,
        tls: Option<TlsContext>,
        config: Config,
    ) -> Result<Self> {
        let mut selector = Selector::new(Role::Client, packet_worker.clone(), tls, config)?;
        let channel = selector.initiate_connect(addr)?;
        debug!("client connecting to {}", addr);
        Ok(TcpClient {
            selector,
            channel,
            packet_worker,
        })
    }

    /// The identity of this client's single channel.
    pub fn channel(&self) -> &ChannelRef {
        &self.channel
    }

    pub fn handle(&self) -> SelectorHandle {
        self.selector.handle()
    }

    pub fn add_listener(&self, listener: Arc<dyn PacketListener>) {
        self.packet_worker.add_listener(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn PacketListener>) {
        self.packet_worker.remove_listener(listener);
    }

    /// Serialize a packet under the worker's framing and queue it for the
    /// server.
    pub fn send(&self, packet: &Packet) {
        self.handle()
            .send(&self.channel, self.packet_worker.framing().encode(packet));
    }

    /// Request a fresh handshake before the next exchange.
    pub fn invalidate_session(&self) {
        self.handle().invalidate_session(&self.channel);
    }

    /// Run the reactor on the calling thread until stopped.
    pub fn run(&mut self) -> Result<()> {
        self.selector.run()
    }
}

/// Client variant holding N parallel sockets to one destination.
///
/// Useful for handshake load generation and concurrency tests; exposes
/// whether every socket has finished its handshake.
pub struct MultiClient {
    selector: Selector,
    channels: Vec<ChannelRef>,
    packet_worker: Arc<PacketWorker>,
}

impl MultiClient {
    pub fn new(
        addr: SocketAddr,
        sockets: usize,
        packet_worker: Arc<PacketWorker>,
        tls: Option<TlsContext>,
        config: Config,
    ) -> Result<Self> {
        let mut selector = Selector::new(Role::Client, packet_worker.clone(), tls, config)?;
        let mut channels = Vec::with_capacity(sockets);
        for _ in 0..sockets {
            channels.push(selector.initiate_connect(addr)?);
        }
        debug!("multi-client opened {} sockets to {}", sockets, addr);
        Ok(MultiClient {
            selector,
            channels,
            packet_worker,
        })
    }

    pub fn channels(&self) -> &[ChannelRef] {
        &self.channels
    }

    pub fn handle(&self) -> SelectorHandle {
        self.selector.handle()
    }

    pub fn add_listener(&self, listener: Arc<dyn PacketListener>) {
        self.packet_worker.add_listener(listener);
    }

    /// True once no channel has a handshake pending.
    pub fn handshakes_complete(&self) -> bool {
        self.channels.iter().all(|c| !c.handshake_pending())
    }

    /// Send one packet on every socket.
    pub fn send_all(&self, packet: &Packet) {
        let handle = self.handle();
        let wire = self.packet_worker.framing().encode(packet);
        for channel in &self.channels {
            handle.send(channel, wire.clone());
        }
    }

    /// Send a packet on the socket at the given index.
    pub fn send(&self, index: usize, packet: &Packet) {
        if let Some(channel) = self.channels.get(index) {
            self.handle()
                .send(channel, self.packet_worker.framing().encode(packet));
        }
    }

    /// Run the reactor on the calling thread until stopped.
    pub fn run(&mut self) -> Result<()> {
        self.selector.run()
    }
}
