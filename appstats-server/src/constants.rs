/// Value of the `Server` header on all HTTP responses.
pub const SERVER: &str = concat!("appstats/", env!("CARGO_PKG_VERSION"));

/// Receive buffer of the statsd listener, the largest possible UDP payload.
///
/// Datagrams are sized by the client. The log listener uses the configured packet size instead.
pub const MAX_STATSD_PACKET_SIZE: usize = 65_507;

/// Backlog of the HTTP listening socket.
pub const TCP_LISTEN_BACKLOG: u32 = 1024;
