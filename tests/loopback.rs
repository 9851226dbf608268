//! End-to-end plaintext scenarios over real loopback sockets.

use bytes::Bytes;
use rampart::{
    ChannelRef, Config, Framing, HeaderLen, LengthLen, MultiClient, Packet, PacketListener,
    PacketWorker, SelectorHandle, TcpClient, TcpServer,
};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const PING: u8 = 0x01;
const PONG: u8 = 0x02;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn wait_for<F: Fn() -> bool>(cond: F, deadline: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

struct Recorder {
    packets: Mutex<Vec<(ChannelRef, Packet)>>,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Recorder {
            packets: Mutex::new(Vec::new()),
        })
    }

    fn count(&self) -> usize {
        self.packets.lock().unwrap().len()
    }

    fn collected(&self) -> Vec<(ChannelRef, Packet)> {
        self.packets.lock().unwrap().clone()
    }
}

impl PacketListener for Recorder {
    fn packet_arrived(&self, channel: &ChannelRef, packet: Packet) {
        self.packets.lock().unwrap().push((channel.clone(), packet));
    }
}

/// Replies to every PING with a PONG on the arrival channel.
struct PingResponder {
    handle: SelectorHandle,
    framing: Framing,
}

impl PacketListener for PingResponder {
    fn packet_arrived(&self, channel: &ChannelRef, packet: Packet) {
        if packet.header == PING as u16 {
            self.handle
                .send(channel, self.framing.encode(&Packet::header_only(PONG)));
        }
    }
}

fn worker(framing: Framing) -> Arc<PacketWorker> {
    Arc::new(PacketWorker::new(framing, 512, 1024 * 1024))
}

fn start_server(
    framing: Framing,
    config: Config,
) -> (SocketAddr, SelectorHandle, Arc<PacketWorker>, thread::JoinHandle<()>) {
    let server_worker = worker(framing);
    let mut server = TcpServer::new(
        "127.0.0.1:0".parse().unwrap(),
        server_worker.clone(),
        None,
        config,
    )
    .unwrap();
    let addr = server.local_addr();
    let handle = server.handle();
    let join = thread::spawn(move || server.run().unwrap());
    (addr, handle, server_worker, join)
}

#[test]
fn plain_ping_pong() {
    init_logging();
    let framing = Framing::SingleByte;
    let (addr, server_handle, server_worker, server_join) =
        start_server(framing, Config::default());

    let server_recorder = Recorder::new();
    server_worker.add_listener(server_recorder.clone());
    server_worker.add_listener(Arc::new(PingResponder {
        handle: server_handle.clone(),
        framing,
    }));

    let client_worker = worker(framing);
    let mut client = TcpClient::new(addr, client_worker.clone(), None, Config::default()).unwrap();
    let client_recorder = Recorder::new();
    client.add_listener(client_recorder.clone());
    let client_handle = client.handle();
    let channel = client.channel().clone();
    let client_join = thread::spawn(move || client.run().unwrap());

    client_handle.send(&channel, framing.encode(&Packet::header_only(PING)));

    assert!(wait_for(
        || server_recorder.count() == 1,
        Duration::from_secs(5)
    ));
    assert_eq!(server_recorder.collected()[0].1.header, PING as u16);

    assert!(wait_for(
        || client_recorder.count() == 1,
        Duration::from_secs(5)
    ));
    assert_eq!(client_recorder.collected()[0].1.header, PONG as u16);

    // client goes away; server stays up
    client_handle.stop();
    client_join.join().unwrap();
    assert!(server_handle.is_running());

    server_handle.stop();
    server_join.join().unwrap();
}

#[test]
fn variable_length_frame_across_fragments() {
    init_logging();
    let framing = Framing::variable(HeaderLen::U8, LengthLen::U16);
    let (addr, server_handle, server_worker, server_join) =
        start_server(framing, Config::default());
    let recorder = Recorder::new();
    server_worker.add_listener(recorder.clone());

    let payload: Vec<u8> = (0..18u8).collect();
    let wire = framing.encode(&Packet::new(0x0A, Bytes::from(payload.clone())));
    assert_eq!(wire.len(), 21);

    // deliver in three segments of 4, 7 and 10 bytes
    let mut raw = TcpStream::connect(addr).unwrap();
    raw.set_nodelay(true).unwrap();
    for range in [0..4, 4..11, 11..21] {
        raw.write_all(&wire[range]).unwrap();
        raw.flush().unwrap();
        thread::sleep(Duration::from_millis(40));
    }

    assert!(wait_for(|| recorder.count() >= 1, Duration::from_secs(5)));
    let got = recorder.collected();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].1.header, 0x0A);
    assert_eq!(&got[0].1.payload[..], &payload[..]);

    server_handle.stop();
    server_join.join().unwrap();
}

#[test]
fn zero_length_send_is_ignored() {
    init_logging();
    let framing = Framing::SingleByte;
    let (addr, server_handle, server_worker, server_join) =
        start_server(framing, Config::default());
    let recorder = Recorder::new();
    server_worker.add_listener(recorder.clone());

    let client_worker = worker(framing);
    let mut client = TcpClient::new(addr, client_worker, None, Config::default()).unwrap();
    let client_handle = client.handle();
    let channel = client.channel().clone();
    let client_join = thread::spawn(move || client.run().unwrap());

    client_handle.send(&channel, Bytes::new());
    thread::sleep(Duration::from_millis(100));
    assert_eq!(recorder.count(), 0);

    // the channel still works afterwards
    client_handle.send(&channel, framing.encode(&Packet::header_only(PING)));
    assert!(wait_for(|| recorder.count() == 1, Duration::from_secs(5)));

    client_handle.stop();
    client_join.join().unwrap();
    server_handle.stop();
    server_join.join().unwrap();
}

#[test]
fn close_with_pending_writes_drops_them() {
    init_logging();
    let framing = Framing::variable(HeaderLen::U8, LengthLen::U16);
    let (addr, server_handle, server_worker, server_join) =
        start_server(framing, Config::default());
    let recorder = Recorder::new();
    server_worker.add_listener(recorder.clone());

    let mut raw = TcpStream::connect(addr).unwrap();
    raw.write_all(&framing.encode(&Packet::header_only(PING)))
        .unwrap();
    assert!(wait_for(|| recorder.count() == 1, Duration::from_secs(5)));
    let channel = recorder.collected()[0].0.clone();

    // queue a pile of writes, then close before they can drain
    let big = Packet::new(0x42, Bytes::from(vec![0xEE; 64 * 1024]));
    for _ in 0..8 {
        server_handle.send(&channel, framing.encode(&big));
    }
    server_handle.close(&channel);

    // the server survives and keeps accepting
    thread::sleep(Duration::from_millis(200));
    assert!(server_handle.is_running());
    let mut raw2 = TcpStream::connect(addr).unwrap();
    raw2.write_all(&framing.encode(&Packet::header_only(PING)))
        .unwrap();
    assert!(wait_for(|| recorder.count() == 2, Duration::from_secs(5)));

    drop(raw);
    server_handle.stop();
    server_join.join().unwrap();
}

#[test]
fn multi_client_round_trip() {
    init_logging();
    let framing = Framing::SingleByte;
    let (addr, server_handle, server_worker, server_join) =
        start_server(framing, Config::default());
    server_worker.add_listener(Arc::new(PingResponder {
        handle: server_handle.clone(),
        framing,
    }));

    let client_worker = worker(framing);
    let mut client = MultiClient::new(addr, 5, client_worker, None, Config::default()).unwrap();
    let recorder = Recorder::new();
    client.add_listener(recorder.clone());
    let client_handle = client.handle();
    let channels: Vec<ChannelRef> = client.channels().to_vec();
    assert!(client.handshakes_complete());
    let client_join = thread::spawn(move || client.run().unwrap());

    for channel in &channels {
        client_handle.send(channel, framing.encode(&Packet::header_only(PING)));
    }

    // one PONG per socket
    assert!(wait_for(|| recorder.count() == 5, Duration::from_secs(5)));
    let mut tokens: Vec<_> = recorder
        .collected()
        .iter()
        .map(|(c, _)| c.token())
        .collect();
    tokens.sort_by_key(|t| t.0);
    tokens.dedup();
    assert_eq!(tokens.len(), 5, "a socket missed its reply");

    client_handle.stop();
    client_join.join().unwrap();
    server_handle.stop();
    server_join.join().unwrap();
}

#[test]
fn mass_concurrency_delivers_every_frame() {
    init_logging();
    let framing = Framing::variable(HeaderLen::U8, LengthLen::U16);
    let (addr, server_handle, server_worker, server_join) =
        start_server(framing, Config::default());
    let recorder = Recorder::new();
    server_worker.add_listener(recorder.clone());

    const CLIENTS: usize = 250;
    const THREADS: usize = 5;
    let mut senders = Vec::new();
    for t in 0..THREADS {
        let framing = framing;
        senders.push(thread::spawn(move || {
            for i in 0..(CLIENTS / THREADS) {
                let id = (t * (CLIENTS / THREADS) + i) as u16;
                let packet = Packet::new(0x07, Bytes::from(id.to_be_bytes().to_vec()));
                let mut stream = TcpStream::connect(addr).unwrap();
                stream.write_all(&framing.encode(&packet)).unwrap();
                stream.flush().unwrap();
                // linger briefly so the bytes are not lost to an abortive close
                thread::sleep(Duration::from_millis(20));
            }
        }));
    }
    for s in senders {
        s.join().unwrap();
    }

    assert!(wait_for(
        || recorder.count() == CLIENTS,
        Duration::from_secs(20)
    ));
    let mut ids: Vec<u16> = recorder
        .collected()
        .iter()
        .map(|(_, p)| u16::from_be_bytes([p.payload[0], p.payload[1]]))
        .collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), CLIENTS, "duplicated or lost frames");

    server_handle.stop();
    server_join.join().unwrap();
}

#[test]
fn server_shutdown_closes_cleanly() {
    init_logging();
    let framing = Framing::SingleByte;
    let (addr, server_handle, _server_worker, server_join) =
        start_server(framing, Config::default());

    let mut raw = TcpStream::connect(addr).unwrap();
    raw.write_all(&[PING]).unwrap();
    thread::sleep(Duration::from_millis(100));

    server_handle.stop();
    server_join.join().unwrap();

    // the peer observes the close
    raw.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut buf = [0u8; 16];
    match raw.read(&mut buf) {
        Ok(0) => {}
        Ok(_) => panic!("unexpected data after shutdown"),
        Err(_) => {}
    }
}
