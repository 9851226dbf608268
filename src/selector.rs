use crate::change::{ChangeKind, ChangeQueue, ChangeRequest};
use crate::channel::{Channel, ChannelRef, HandshakeListener, PlainChannel, SecureChannel};
use crate::config::Config;
use crate::error::Result;
use crate::event::ReadyEvent;
use crate::packet::{OverflowListener, PacketWorker};
use crate::poll::{PollHandle, WAKER_TOKEN};
use crate::task::{TaskListener, TaskWorker};
use crate::timeout::{TimeoutListener, TimeoutWorker};
use crate::tls::TlsContext;
use bytes::{Buf, Bytes};
use log::{debug, error, info, trace, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Token, Waker};
use socket2::SockRef;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// Token of the server's listening socket.
pub(crate) const LISTENER_TOKEN: Token = Token(1);
/// First token handed to connection sockets.
const FIRST_CHANNEL_TOKEN: usize = 2;

const READ_BUFFER_SIZE: usize = 8192;

struct HandleShared {
    changes: ChangeQueue,
    pending_writes: Mutex<HashMap<Token, VecDeque<Bytes>>>,
    waker: Arc<Waker>,
    running: AtomicBool,
}

/// Cross-thread interface to a running reactor.
///
/// The only way any other thread interacts with selector-owned state: data is
/// queued on the pending-writes table, everything else becomes a typed change
/// request followed by a wakeup.
#[derive(Clone)]
pub struct SelectorHandle {
    shared: Arc<HandleShared>,
}

impl SelectorHandle {
    fn new(waker: Arc<Waker>) -> Self {
        SelectorHandle {
            shared: Arc::new(HandleShared {
                changes: ChangeQueue::new(waker.clone()),
                pending_writes: Mutex::new(HashMap::new()),
                waker,
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Queue application bytes for transmission on a channel.
    ///
    /// Write interest is armed immediately unless a handshake is pending, in
    /// which case the data waits and is flushed on handshake completion. A
    /// zero-length send is a no-op and never touches interest flags.
    pub fn send(&self, channel: &ChannelRef, data: impl Into<Bytes>) {
        let data = data.into();
        if data.is_empty() {
            return;
        }
        {
            let mut writes = self.shared.pending_writes.lock().unwrap();
            writes.entry(channel.token()).or_default().push_back(data);
        }
        if !channel.handshake_pending() {
            self.shared.changes.push(ChangeRequest::new(
                channel.token(),
                ChangeKind::InterestOps(Interest::READABLE | Interest::WRITABLE),
            ));
        }
    }

    /// Request a fresh handshake on the channel's next activity.
    pub fn invalidate_session(&self, channel: &ChannelRef) {
        self.shared
            .changes
            .push(ChangeRequest::new(channel.token(), ChangeKind::SessionInvalidated));
    }

    /// Request an orderly close of the channel.
    pub fn close(&self, channel: &ChannelRef) {
        self.shared
            .changes
            .push(ChangeRequest::new(channel.token(), ChangeKind::Close));
    }

    /// Stop the reactor after its current iteration.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        let _ = self.shared.waker.wake();
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    fn set_running(&self, running: bool) {
        self.shared.running.store(running, Ordering::Release);
    }

    fn pop_change(&self) -> Option<ChangeRequest> {
        self.shared.changes.pop()
    }

    fn clear_changes(&self) {
        self.shared.changes.clear();
    }

    fn peek_write(&self, token: Token) -> Option<Bytes> {
        let writes = self.shared.pending_writes.lock().unwrap();
        writes.get(&token).and_then(|q| q.front().cloned())
    }

    /// Mark n bytes of the head buffer written; pops it when fully consumed.
    fn consume_write(&self, token: Token, n: usize) {
        let mut writes = self.shared.pending_writes.lock().unwrap();
        if let Some(queue) = writes.get_mut(&token) {
            if let Some(front) = queue.front_mut() {
                if n >= front.len() {
                    queue.pop_front();
                } else {
                    front.advance(n);
                }
            }
        }
    }

    fn drop_writes(&self, token: Token) {
        self.shared.pending_writes.lock().unwrap().remove(&token);
    }

    fn clear_writes(&self) {
        self.shared.pending_writes.lock().unwrap().clear();
    }

    fn has_writes(&self, token: Token) -> bool {
        self.shared
            .pending_writes
            .lock()
            .unwrap()
            .get(&token)
            .map_or(false, |q| !q.is_empty())
    }
}

impl TimeoutListener for SelectorHandle {
    fn timeout_expired(&self, token: Token) {
        self.shared
            .changes
            .push(ChangeRequest::new(token, ChangeKind::TimeoutExpired));
    }
}

impl TaskListener for SelectorHandle {
    fn task_complete(&self, token: Token) {
        self.shared
            .changes
            .push(ChangeRequest::new(token, ChangeKind::TaskComplete));
    }
}

impl HandshakeListener for SelectorHandle {
    fn handshake_complete(&self, token: Token) {
        // data queued during the handshake can flow now
        if self.has_writes(token) {
            self.shared.changes.push(ChangeRequest::new(
                token,
                ChangeKind::InterestOps(Interest::READABLE | Interest::WRITABLE),
            ));
        } else {
            let _ = self.shared.waker.wake();
        }
    }
}

impl OverflowListener for SelectorHandle {
    fn buffer_exceeded(&self, token: Token) {
        self.shared
            .changes
            .push(ChangeRequest::new(token, ChangeKind::Close));
    }
}

pub(crate) enum Role {
    Server { listener: TcpListener },
    Client,
}

enum ReadOutcome {
    Eof,
    Data(usize, ChannelRef),
    Blocked,
    Retry,
    Failed(io::Error),
    Gone,
}

/// The event-loop selector: a single-threaded reactor owning every socket.
///
/// All channel state lives here and is mutated only on the thread running
/// run(). Worker threads feed back through the change queue on the handle.
pub(crate) struct Selector {
    poll: PollHandle,
    events: Events,
    config: Config,
    role: Role,
    tls: Option<TlsContext>,
    channels: HashMap<Token, Channel>,
    connecting: HashSet<Token>,
    next_token: usize,
    handle: SelectorHandle,
    listener_arc: Arc<SelectorHandle>,
    packet_worker: Arc<PacketWorker>,
    task_worker: Option<Arc<TaskWorker>>,
    timeout_worker: Arc<TimeoutWorker>,
}

impl Selector {
    pub(crate) fn new(
        role: Role,
        packet_worker: Arc<PacketWorker>,
        tls: Option<TlsContext>,
        config: Config,
    ) -> Result<Self> {
        let poll = PollHandle::new()?;
        let handle = SelectorHandle::new(poll.waker());
        let listener_arc = Arc::new(handle.clone());

        let timeout_worker = Arc::new(TimeoutWorker::new(
            listener_arc.clone() as Arc<dyn TimeoutListener>
        ));
        let task_worker = if tls.is_some() && !config.single_threaded {
            Some(Arc::new(TaskWorker::new(
                listener_arc.clone() as Arc<dyn TaskListener>
            )))
        } else {
            None
        };
        packet_worker.set_overflow_listener(listener_arc.clone() as Arc<dyn OverflowListener>);

        let mut selector = Selector {
            poll,
            events: Events::with_capacity(config.events_capacity),
            config,
            role,
            tls,
            channels: HashMap::new(),
            connecting: HashSet::new(),
            next_token: FIRST_CHANNEL_TOKEN,
            handle,
            listener_arc,
            packet_worker,
            task_worker,
            timeout_worker,
        };
        if let Role::Server { listener } = &mut selector.role {
            selector
                .poll
                .register(listener, LISTENER_TOKEN, Interest::READABLE)?;
        }
        Ok(selector)
    }

    pub(crate) fn handle(&self) -> SelectorHandle {
        self.handle.clone()
    }

    fn next_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn is_client(&self) -> bool {
        matches!(self.role, Role::Client)
    }

    fn make_channel(&self, stream: TcpStream, token: Token) -> Result<Channel> {
        match &self.tls {
            None => Ok(Channel::Plain(PlainChannel::new(stream, token))),
            Some(ctx) => {
                let engine = ctx.engine(self.task_worker.is_some())?;
                Ok(Channel::Secure(SecureChannel::new(
                    stream,
                    token,
                    engine,
                    self.config.timeout_period,
                    self.timeout_worker.clone(),
                    self.task_worker.clone(),
                    self.listener_arc.clone() as Arc<dyn HandshakeListener>,
                )))
            }
        }
    }

    fn apply_socket_options(&self, stream: &TcpStream, with_nodelay: bool) -> io::Result<()> {
        let sock = SockRef::from(stream);
        if let Some(size) = self.config.so_sndbuf {
            sock.set_send_buffer_size(size)?;
        }
        if let Some(size) = self.config.so_rcvbuf {
            sock.set_recv_buffer_size(size)?;
        }
        sock.set_keepalive(self.config.so_keepalive)?;
        sock.set_reuse_address(self.config.so_reuseaddr)?;
        if let Some(tos) = self.config.ip_tos {
            sock.set_tos(tos)?;
        }
        if with_nodelay && self.config.tcp_nodelay {
            stream.set_nodelay(true)?;
        }
        Ok(())
    }

    /// Open an outbound socket, register for connect-readiness and insert
    /// the channel. The handshake (if any) starts once the connect finishes.
    pub(crate) fn initiate_connect(&mut self, addr: SocketAddr) -> Result<ChannelRef> {
        let mut stream = TcpStream::connect(addr)?;
        // TCP_NODELAY is applied after finish_connect; some stacks reject it earlier
        if let Err(e) = self.apply_socket_options(&stream, false) {
            warn!("failed to apply socket options: {}", e);
        }
        let token = self.next_token();
        self.poll.register(&mut stream, token, Interest::WRITABLE)?;
        let channel = self.make_channel(stream, token)?;
        let reference = channel.reference().clone();
        self.connecting.insert(token);
        self.channels.insert(token, channel);
        Ok(reference)
    }

    /// Run the reactor until stopped. Spawns the worker threads, drives the
    /// loop and tears everything down on exit.
    pub(crate) fn run(&mut self) -> Result<()> {
        let mut workers = Vec::new();
        {
            let packet_worker = self.packet_worker.clone();
            workers.push(
                thread::Builder::new()
                    .name("packet-worker".into())
                    .spawn(move || packet_worker.run())?,
            );
        }
        if let Some(task_worker) = &self.task_worker {
            let task_worker = task_worker.clone();
            workers.push(
                thread::Builder::new()
                    .name("task-worker".into())
                    .spawn(move || task_worker.run())?,
            );
        }
        {
            let timeout_worker = self.timeout_worker.clone();
            workers.push(
                thread::Builder::new()
                    .name("timeout-worker".into())
                    .spawn(move || timeout_worker.run())?,
            );
        }
        self.handle.set_running(true);

        while self.handle.is_running() {
            self.process_changes();

            let timeout = if self.config.process_all_changes {
                None
            } else {
                Some(self.config.select_timeout)
            };
            let Selector { poll, events, .. } = self;
            match poll.poll(events, timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("readiness poll failed, shutting down: {}", e);
                    break;
                }
            }

            let ready: Vec<ReadyEvent> = self.events.iter().map(ReadyEvent::from).collect();
            for event in ready {
                self.dispatch(&event);
            }
        }

        self.shutdown(workers);
        Ok(())
    }

    fn dispatch(&mut self, event: &ReadyEvent) {
        let token = event.token();
        if token == WAKER_TOKEN {
            return;
        }
        if matches!(self.role, Role::Server { .. }) && token == LISTENER_TOKEN {
            if event.is_readable() {
                self.accept();
            }
            return;
        }
        if self.connecting.contains(&token) {
            if event.is_writable() {
                self.connect(token);
            }
            return;
        }
        if event.is_readable() && self.channels.contains_key(&token) {
            self.read(token);
        }
        if event.is_writable() && self.channels.contains_key(&token) {
            self.write(token);
        }
    }

    /// Drain queued change requests, bounded by max_changes unless the
    /// configuration asks for a full drain. Requests naming a channel that is
    /// no longer registered are skipped.
    fn process_changes(&mut self) {
        let limit = if self.config.process_all_changes {
            usize::MAX
        } else {
            self.config.max_changes
        };
        let mut processed = 0;
        while processed < limit {
            let Some(change) = self.handle.pop_change() else {
                return;
            };
            processed += 1;
            let token = change.token;
            if !self.channels.contains_key(&token) {
                trace!("skipping change for closed channel {:?}", token);
                continue;
            }
            match change.kind {
                ChangeKind::InterestOps(ops) => {
                    let Selector { channels, poll, .. } = self;
                    if let Some(channel) = channels.get_mut(&token) {
                        if let Err(e) = channel.reregister(poll, token, ops) {
                            warn!("failed to set interest on {:?}: {}", token, e);
                        }
                    }
                }
                ChangeKind::TaskComplete => {
                    let result = self.channels.get_mut(&token).map(|channel| {
                        channel.update_result();
                        channel.process_handshake()
                    });
                    if let Some(Err(e)) = result {
                        info!("handshake failed after task on {:?}: {}", token, e);
                        self.close_channel(token);
                    }
                }
                ChangeKind::TimeoutExpired => {
                    info!("timeout expired, closing {:?}", token);
                    self.close_channel(token);
                }
                ChangeKind::SessionInvalidated => {
                    let result = self.channels.get_mut(&token).map(|channel| {
                        channel.invalidate_session();
                        channel.init_handshake()
                    });
                    if let Some(Err(e)) = result {
                        info!("handshake re-init failed on {:?}: {}", token, e);
                        self.close_channel(token);
                    }
                }
                ChangeKind::Close => {
                    self.close_channel(token);
                }
            }
        }
    }

    fn accept(&mut self) {
        loop {
            let accepted = match &mut self.role {
                Role::Server { listener } => listener.accept(),
                Role::Client => return,
            };
            let (mut stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept error: {}", e);
                    break;
                }
            };
            if let Err(e) = self.apply_socket_options(&stream, true) {
                warn!("failed to apply socket options for {}: {}", peer, e);
            }
            let token = self.next_token();
            if let Err(e) = self.poll.register(&mut stream, token, Interest::READABLE) {
                warn!("failed to register {}: {}", peer, e);
                continue;
            }
            match self.make_channel(stream, token) {
                Ok(channel) => {
                    debug!("{} connected as {:?}", peer, token);
                    self.channels.insert(token, channel);
                }
                Err(e) => {
                    warn!("channel setup failed for {}: {}", peer, e);
                }
            }
        }
    }

    fn connect(&mut self, token: Token) {
        let result = match self.channels.get_mut(&token) {
            Some(channel) => channel.finish_connect(),
            None => return,
        };
        match result {
            Ok(true) => {
                self.connecting.remove(&token);
                let Selector {
                    channels,
                    poll,
                    config,
                    handle,
                    ..
                } = self;
                if let Some(channel) = channels.get_mut(&token) {
                    if config.tcp_nodelay {
                        if let Err(e) = channel.stream().set_nodelay(true) {
                            warn!("failed to set TCP_NODELAY on {:?}: {}", token, e);
                        }
                    }
                    // sends queued before the connect completed still need a
                    // writable event
                    let interest = if handle.has_writes(token) && !channel.handshake_pending() {
                        Interest::READABLE | Interest::WRITABLE
                    } else {
                        Interest::READABLE
                    };
                    if let Err(e) = channel.reregister(poll, token, interest) {
                        warn!("failed to rearm {:?} after connect: {}", token, e);
                    }
                }
                debug!("{:?} connected", token);
            }
            Ok(false) => {}
            Err(e) => {
                error!("connect failed on {:?}, shutting down: {}", token, e);
                self.close_channel(token);
                if self.is_client() {
                    self.handle.stop();
                }
            }
        }
    }

    fn read(&mut self, token: Token) {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            let outcome = match self.channels.get_mut(&token) {
                None => ReadOutcome::Gone,
                Some(channel) => match channel.read(&mut buf) {
                    Ok(0) => ReadOutcome::Eof,
                    Ok(n) => ReadOutcome::Data(n, channel.reference().clone()),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => ReadOutcome::Blocked,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => ReadOutcome::Retry,
                    Err(e) => ReadOutcome::Failed(e),
                },
            };
            match outcome {
                ReadOutcome::Gone | ReadOutcome::Blocked => return,
                ReadOutcome::Retry => continue,
                ReadOutcome::Eof => {
                    debug!("remote disconnected on {:?}", token);
                    self.close_channel(token);
                    return;
                }
                ReadOutcome::Failed(e) => {
                    info!("read error on {:?}: {}", token, e);
                    self.close_channel(token);
                    return;
                }
                ReadOutcome::Data(n, reference) => {
                    trace!("read {} bytes from {:?}", n, token);
                    self.packet_worker.add_data(&reference, &buf[..n]);
                }
            }
        }
    }

    fn write(&mut self, token: Token) {
        loop {
            let Some(front) = self.handle.peek_write(token) else {
                self.finish_writes(token);
                return;
            };
            let result = match self.channels.get_mut(&token) {
                Some(channel) => channel.write(&front[..]),
                None => {
                    self.handle.drop_writes(token);
                    return;
                }
            };
            match result {
                Ok(0) => return,
                Ok(n) => {
                    trace!("wrote {} bytes to {:?}", n, token);
                    self.handle.consume_write(token, n);
                    if n < front.len() {
                        // socket full; remainder goes out on the next writable event
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    info!("write error on {:?}: {}", token, e);
                    self.close_channel(token);
                    return;
                }
            }
        }
    }

    /// Queue drained: reset interest to read-only once any residual
    /// ciphertext has left the channel.
    fn finish_writes(&mut self, token: Token) {
        let Selector { channels, poll, .. } = self;
        let Some(channel) = channels.get_mut(&token) else {
            return;
        };
        match channel.flush_pending() {
            Ok(true) => {
                if let Err(e) = channel.reregister(poll, token, Interest::READABLE) {
                    warn!("failed to reset interest on {:?}: {}", token, e);
                }
            }
            Ok(false) => {}
            Err(e) => {
                info!("flush error on {:?}: {}", token, e);
                self.close_channel(token);
            }
        }
    }

    /// Idempotent channel teardown: close the channel (flushing close_notify
    /// for TLS), cancel its registration, drop queued writes and reassembly
    /// state. Later change requests naming this channel become no-ops.
    fn close_channel(&mut self, token: Token) {
        let Some(mut channel) = self.channels.remove(&token) else {
            return;
        };
        self.connecting.remove(&token);
        if let Err(e) = channel.close() {
            debug!("close of {:?} reported: {}", token, e);
        }
        if let Err(e) = channel.deregister(&self.poll) {
            debug!("deregister of {:?} reported: {}", token, e);
        }
        self.handle.drop_writes(token);
        self.packet_worker.forget(token);
        info!("disconnected {:?}", token);

        if self.is_client() && self.channels.is_empty() {
            self.handle.stop();
        }
    }

    fn shutdown(&mut self, workers: Vec<thread::JoinHandle<()>>) {
        info!("selector shutting down");
        self.handle.set_running(false);
        if self.packet_worker.is_running() {
            self.packet_worker.stop();
        }
        if let Some(task_worker) = &self.task_worker {
            if task_worker.is_running() {
                task_worker.stop();
            }
        }
        if self.timeout_worker.is_running() {
            self.timeout_worker.stop();
        }

        let tokens: Vec<Token> = self.channels.keys().copied().collect();
        for token in tokens {
            self.close_channel(token);
        }
        if let Role::Server { listener } = &mut self.role {
            let _ = self.poll.deregister(listener);
        }
        self.handle.clear_changes();
        self.handle.clear_writes();

        for worker in workers {
            let _ = worker.join();
        }
    }
}

/// Apply listener-side options and bind with the configured backlog.
pub(crate) fn bind_listener(addr: SocketAddr, config: &Config) -> io::Result<TcpListener> {
    let domain = socket2::Domain::for_address(addr);
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_reuse_address(config.so_reuseaddr)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(config.backlog as i32)?;
    Ok(TcpListener::from_std(socket.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelRef;
    use crate::poll::PollHandle;

    fn handle() -> SelectorHandle {
        let poll = PollHandle::new().unwrap();
        // keep the poll alive for the waker by leaking it into the test
        let handle = SelectorHandle::new(poll.waker());
        std::mem::forget(poll);
        handle
    }

    #[test]
    fn test_send_queues_and_arms_interest() {
        let h = handle();
        let channel = ChannelRef::test_ref(Token(5));
        h.send(&channel, Bytes::from_static(b"abc"));

        assert!(h.has_writes(Token(5)));
        let change = h.pop_change().unwrap();
        assert_eq!(change.token, Token(5));
        assert!(matches!(change.kind, ChangeKind::InterestOps(_)));
    }

    #[test]
    fn test_zero_length_send_is_a_noop() {
        let h = handle();
        let channel = ChannelRef::test_ref(Token(5));
        h.send(&channel, Bytes::new());

        assert!(!h.has_writes(Token(5)));
        assert!(h.pop_change().is_none());
    }

    #[test]
    fn test_consume_write_tracks_partial_progress() {
        let h = handle();
        let channel = ChannelRef::test_ref(Token(3));
        h.send(&channel, Bytes::from_static(b"hello"));
        h.pop_change();

        h.consume_write(Token(3), 2);
        assert_eq!(h.peek_write(Token(3)).unwrap(), Bytes::from_static(b"llo"));
        h.consume_write(Token(3), 3);
        assert!(h.peek_write(Token(3)).is_none());
    }

    #[test]
    fn test_close_drops_pending_writes() {
        let h = handle();
        let channel = ChannelRef::test_ref(Token(4));
        h.send(&channel, Bytes::from_static(b"doomed"));
        h.drop_writes(Token(4));
        assert!(!h.has_writes(Token(4)));
    }

    #[test]
    fn test_bind_listener_applies_backlog() {
        let config = Config::builder().backlog(4).build();
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), &config).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }
}
