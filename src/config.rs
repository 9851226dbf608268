use std::time::Duration;

/// Runtime configuration for the reactor and its workers.
///
/// Controls change-queue draining, socket options applied at accept/connect,
/// reassembly buffer sizing and the handshake-inactivity timeout. Use
/// Config::builder() for ergonomic construction.
///
/// ## Change processing
///
/// - process_all_changes: When true (default) the whole pending-change queue
///   is drained every iteration and the readiness poll blocks indefinitely.
///   When false, at most max_changes are drained and the poll uses
///   select_timeout as an upper bound.
///
/// ## Resource limits
///
/// - packet_buffer_size: initial per-channel reassembly buffer
/// - packet_buffer_limit: growth cap; a channel exceeding it is closed
#[derive(Clone)]
pub struct Config {
    /// Run delegated TLS tasks on the reactor thread instead of the task worker
    pub single_threaded: bool,
    /// Drain the entire change queue per iteration and select without timeout
    pub process_all_changes: bool,
    /// Maximum changes drained per iteration when process_all_changes is false
    pub max_changes: usize,
    /// Readiness poll timeout when process_all_changes is false
    pub select_timeout: Duration,
    /// Accept backlog depth
    pub backlog: u32,
    /// Initial per-channel reassembly buffer (bytes)
    pub packet_buffer_size: usize,
    /// Reassembly buffer growth cap (bytes)
    pub packet_buffer_limit: usize,
    /// Handshake-inactivity timeout
    pub timeout_period: Duration,
    /// Readiness event batch capacity
    pub events_capacity: usize,
    /// Enable TCP_NODELAY
    pub tcp_nodelay: bool,
    /// SO_SNDBUF size in bytes
    pub so_sndbuf: Option<usize>,
    /// SO_RCVBUF size in bytes
    pub so_rcvbuf: Option<usize>,
    /// SO_KEEPALIVE setting
    pub so_keepalive: bool,
    /// SO_REUSEADDR setting
    pub so_reuseaddr: bool,
    /// IP_TOS value
    pub ip_tos: Option<u32>,
}

impl Config {
    /// Create a new builder for Config
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            single_threaded: false,
            process_all_changes: true,
            max_changes: 64,
            select_timeout: Duration::from_millis(500),
            backlog: 128,
            packet_buffer_size: 512,
            packet_buffer_limit: 1024 * 1024,
            timeout_period: Duration::from_secs(10),
            events_capacity: 1024,
            tcp_nodelay: true,
            so_sndbuf: None,
            so_rcvbuf: None,
            so_keepalive: false,
            so_reuseaddr: true,
            ip_tos: None,
        }
    }
}

/// Builder for Config using the builder pattern.
///
/// All fields are optional and will use defaults from Config::default()
/// if not explicitly set.
pub struct ConfigBuilder {
    single_threaded: Option<bool>,
    process_all_changes: Option<bool>,
    max_changes: Option<usize>,
    select_timeout: Option<Duration>,
    backlog: Option<u32>,
    packet_buffer_size: Option<usize>,
    packet_buffer_limit: Option<usize>,
    timeout_period: Option<Duration>,
    events_capacity: Option<usize>,
    tcp_nodelay: Option<bool>,
    so_sndbuf: Option<usize>,
    so_rcvbuf: Option<usize>,
    so_keepalive: Option<bool>,
    so_reuseaddr: Option<bool>,
    ip_tos: Option<u32>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            single_threaded: None,
            process_all_changes: None,
            max_changes: None,
            select_timeout: None,
            backlog: None,
            packet_buffer_size: None,
            packet_buffer_limit: None,
            timeout_period: None,
            events_capacity: None,
            tcp_nodelay: None,
            so_sndbuf: None,
            so_rcvbuf: None,
            so_keepalive: None,
            so_reuseaddr: None,
            ip_tos: None,
        }
    }

    /// Run delegated TLS tasks on the reactor thread
    pub fn single_threaded(mut self, enabled: bool) -> Self {
        self.single_threaded = Some(enabled);
        self
    }

    /// Drain the whole change queue per iteration
    pub fn process_all_changes(mut self, enabled: bool) -> Self {
        self.process_all_changes = Some(enabled);
        self
    }

    /// Cap on changes drained per iteration
    pub fn max_changes(mut self, max: usize) -> Self {
        self.max_changes = Some(max);
        self
    }

    /// Bounded readiness poll timeout
    pub fn select_timeout(mut self, timeout: Duration) -> Self {
        self.select_timeout = Some(timeout);
        self
    }

    /// Set the accept backlog depth
    pub fn backlog(mut self, backlog: u32) -> Self {
        self.backlog = Some(backlog);
        self
    }

    /// Initial per-channel reassembly buffer size
    pub fn packet_buffer_size(mut self, size: usize) -> Self {
        self.packet_buffer_size = Some(size);
        self
    }

    /// Reassembly buffer growth cap
    pub fn packet_buffer_limit(mut self, limit: usize) -> Self {
        self.packet_buffer_limit = Some(limit);
        self
    }

    /// Handshake-inactivity timeout
    pub fn timeout_period(mut self, period: Duration) -> Self {
        self.timeout_period = Some(period);
        self
    }

    /// Readiness event batch capacity
    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = Some(capacity);
        self
    }

    /// Enable or disable TCP_NODELAY
    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = Some(enabled);
        self
    }

    /// Set SO_SNDBUF in bytes
    pub fn so_sndbuf(mut self, size: usize) -> Self {
        self.so_sndbuf = Some(size);
        self
    }

    /// Set SO_RCVBUF in bytes
    pub fn so_rcvbuf(mut self, size: usize) -> Self {
        self.so_rcvbuf = Some(size);
        self
    }

    /// Enable or disable SO_KEEPALIVE
    pub fn so_keepalive(mut self, enabled: bool) -> Self {
        self.so_keepalive = Some(enabled);
        self
    }

    /// Enable or disable SO_REUSEADDR
    pub fn so_reuseaddr(mut self, enabled: bool) -> Self {
        self.so_reuseaddr = Some(enabled);
        self
    }

    /// Set the IP_TOS value
    pub fn ip_tos(mut self, tos: u32) -> Self {
        self.ip_tos = Some(tos);
        self
    }

    /// Build the Config
    pub fn build(self) -> Config {
        let default = Config::default();
        Config {
            single_threaded: self.single_threaded.unwrap_or(default.single_threaded),
            process_all_changes: self
                .process_all_changes
                .unwrap_or(default.process_all_changes),
            max_changes: self.max_changes.unwrap_or(default.max_changes),
            select_timeout: self.select_timeout.unwrap_or(default.select_timeout),
            backlog: self.backlog.unwrap_or(default.backlog),
            packet_buffer_size: self.packet_buffer_size.unwrap_or(default.packet_buffer_size),
            packet_buffer_limit: self
                .packet_buffer_limit
                .unwrap_or(default.packet_buffer_limit),
            timeout_period: self.timeout_period.unwrap_or(default.timeout_period),
            events_capacity: self.events_capacity.unwrap_or(default.events_capacity),
            tcp_nodelay: self.tcp_nodelay.unwrap_or(default.tcp_nodelay),
            so_sndbuf: self.so_sndbuf.or(default.so_sndbuf),
            so_rcvbuf: self.so_rcvbuf.or(default.so_rcvbuf),
            so_keepalive: self.so_keepalive.unwrap_or(default.so_keepalive),
            so_reuseaddr: self.so_reuseaddr.unwrap_or(default.so_reuseaddr),
            ip_tos: self.ip_tos.or(default.ip_tos),
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
