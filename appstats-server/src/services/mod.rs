//! Long running services of the daemon.

mod log_listener;
mod server;
mod statsd_listener;
mod udp;

pub use self::log_listener::*;
pub use self::server::*;
pub use self::statsd_listener::*;

/// Indicates the type of failure of the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Binding failed.
    #[error("bind to interface failed")]
    BindFailed(#[from] std::io::Error),
}
