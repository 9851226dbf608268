use super::{Framing, OverflowListener, Packet, PacketListener};
use crate::channel::ChannelRef;
use bytes::BytesMut;
use log::{debug, warn};
use mio::Token;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

struct WorkerState {
    pending_data: HashMap<Token, BytesMut>,
    pending: VecDeque<ChannelRef>,
    running: bool,
}

/// Reassembles raw byte runs into framed packets on a dedicated thread.
///
/// The reactor pushes `(channel, bytes)` through add_data; per-channel append
/// buffers grow as needed up to the configured cap. Channels with buffered
/// bytes sit in a ready deque; a channel whose remaining bytes do not form a
/// complete frame leaves the deque and is re-added on the next add_data.
pub struct PacketWorker {
    framing: Framing,
    initial_size: usize,
    limit: usize,
    state: Mutex<WorkerState>,
    cond: Condvar,
    listeners: Mutex<Vec<Arc<dyn PacketListener>>>,
    overflow: Mutex<Option<Arc<dyn OverflowListener>>>,
}

impl PacketWorker {
    pub fn new(framing: Framing, initial_size: usize, limit: usize) -> Self {
        PacketWorker {
            framing,
            initial_size,
            limit,
            state: Mutex::new(WorkerState {
                pending_data: HashMap::new(),
                pending: VecDeque::new(),
                running: false,
            }),
            cond: Condvar::new(),
            listeners: Mutex::new(Vec::new()),
            overflow: Mutex::new(None),
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn add_listener(&self, listener: Arc<dyn PacketListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn PacketListener>) {
        self.listeners
            .lock()
            .unwrap()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub(crate) fn set_overflow_listener(&self, listener: Arc<dyn OverflowListener>) {
        *self.overflow.lock().unwrap() = Some(listener);
    }

    /// Append freshly read bytes for a channel and mark it ready.
    pub fn add_data(&self, channel: &ChannelRef, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let token = channel.token();
        let mut state = self.state.lock().unwrap();

        let buffered = state.pending_data.get(&token).map_or(0, |b| b.len());
        if buffered + data.len() > self.limit {
            state.pending_data.remove(&token);
            state.pending.retain(|c| c.token() != token);
            drop(state);
            warn!(
                "reassembly buffer for {:?} exceeded cap of {} bytes, closing",
                token, self.limit
            );
            let overflow = self.overflow.lock().unwrap().clone();
            if let Some(listener) = overflow {
                listener.buffer_exceeded(token);
            }
            return;
        }

        let initial = self.initial_size;
        state
            .pending_data
            .entry(token)
            .or_insert_with(|| BytesMut::with_capacity(initial.max(data.len())))
            .extend_from_slice(data);

        if !state.pending.iter().any(|c| c.token() == token) {
            state.pending.push_back(channel.clone());
        }
        self.cond.notify_one();
    }

    /// Drop all buffered state for a closed channel.
    pub(crate) fn forget(&self, token: Token) {
        let mut state = self.state.lock().unwrap();
        state.pending_data.remove(&token);
        state.pending.retain(|c| c.token() != token);
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        state.running = false;
        self.cond.notify_one();
    }

    pub fn run(&self) {
        debug!("packet worker initializing");
        let mut state = self.state.lock().unwrap();
        state.running = true;

        'run: while state.running {
            while state.pending.is_empty() {
                if !state.running {
                    break 'run;
                }
                state = self.cond.wait(state).unwrap();
            }

            let channel = state.pending.pop_front().unwrap();
            let mut packets = Vec::new();
            if let Some(buf) = state.pending_data.get_mut(&channel.token()) {
                while let Some(packet) = self.framing.decode(buf) {
                    packets.push(packet);
                }
                if buf.is_empty() {
                    state.pending_data.remove(&channel.token());
                }
            }

            drop(state);
            for packet in packets {
                self.fire_listeners(&channel, packet);
            }
            state = self.state.lock().unwrap();
        }

        debug!("packet worker shutting down");
        state.pending_data.clear();
        state.pending.clear();
        self.listeners.lock().unwrap().clear();
    }

    fn fire_listeners(&self, channel: &ChannelRef, packet: Packet) {
        let listeners: Vec<_> = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            listener.packet_arrived(channel, packet.clone());
        }
    }
}
