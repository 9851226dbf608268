//! Non-blocking TCP framework with optional transport-layer security.
//!
//! A single-threaded readiness reactor owns every socket; three worker
//! threads (packet reassembly, delegated TLS tasks, timeouts) feed results
//! back through a typed change-request queue and a reactor wakeup. Per
//! connection, a channel is either a plain byte pass-through or a TLS state
//! machine encrypting and decrypting through four role-specific buffers.
//!
//! ```no_run
//! use rampart::{Config, Framing, HeaderLen, LengthLen, PacketWorker, TcpServer};
//! use std::sync::Arc;
//!
//! # fn main() -> rampart::Result<()> {
//! let config = Config::builder().backlog(64).build();
//! let worker = Arc::new(PacketWorker::new(
//!     Framing::variable(HeaderLen::U8, LengthLen::U16),
//!     config.packet_buffer_size,
//!     config.packet_buffer_limit,
//! ));
//! let mut server = TcpServer::new("127.0.0.1:44503".parse().unwrap(), worker, None, config)?;
//! server.run()?;
//! # Ok(())
//! # }
//! ```

pub mod change;
pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod packet;
pub mod poll;
pub mod selector;
pub mod server;
pub mod task;
pub mod timeout;
pub mod tls;

pub use channel::ChannelRef;
pub use client::{MultiClient, TcpClient};
pub use config::Config;
pub use error::{Error, Result};
pub use packet::{Framing, HeaderLen, LengthLen, Packet, PacketListener, PacketWorker};
pub use selector::SelectorHandle;
pub use server::TcpServer;
pub use tls::{TlsContext, TlsSettings};
