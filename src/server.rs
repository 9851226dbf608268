use crate::channel::ChannelRef;
use crate::config::Config;
use crate::error::Result;
use crate::packet::{Packet, PacketListener, PacketWorker};
use crate::selector::{bind_listener, Role, Selector, SelectorHandle};
use crate::tls::TlsContext;
use log::{debug, info};
use std::net::SocketAddr;
use std::sync::Arc;

/// Server role: binds a listening socket and accepts inbound connections.
///
/// Accepted channels are plain or TLS depending on whether a TlsContext is
/// supplied; a TLS accept does not start the handshake, which is driven by
/// the first socket activity instead. run() blocks; interact with a running
/// server through its SelectorHandle.
pub struct TcpServer {
    selector: Selector,
    local_addr: SocketAddr,
    packet_worker: Arc<PacketWorker>,
}

impl TcpServer {
    pub fn new(
        addr: SocketAddr,
        packet_worker: Arc<PacketWorker>,
        tls: Option<TlsContext>,
        config: Config,
    ) -> Result<Self> {
        let listener = bind_listener(addr, &config)?;
        let local_addr = listener.local_addr()?;
        info!("server listening on {}", local_addr);
        let selector = Selector::new(
            Role::Server { listener },
            packet_worker.clone(),
            tls,
            config,
        )?;
        Ok(TcpServer {
            selector,
            local_addr,
            packet_worker,
        })
    }

    /// The bound address; useful when binding to port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
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
    /// given channel.
    pub fn send(&self, channel: &ChannelRef, packet: &Packet) {
        debug!("sending {:?} to {:?}", packet.header, channel.token());
        self.handle()
            .send(channel, self.packet_worker.framing().encode(packet));
    }

    /// Run the reactor on the calling thread until stopped.
    pub fn run(&mut self) -> Result<()> {
        self.selector.run()
    }
}
