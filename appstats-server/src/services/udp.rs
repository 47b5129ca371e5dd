use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::statsd::ServerGauges;

/// Binds a non-blocking UDP socket that can be rebound immediately after a restart.
///
/// Must be called from within a tokio runtime.
pub fn bind(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    UdpSocket::from_std(socket.into())
}

/// Counts datagrams whose decoding task is still running.
///
/// Decoding tasks are spawned without a bound and wait while the ingestion queue is full. This
/// tracker does not limit them, it only reports how many there are.
#[derive(Clone, Debug)]
pub struct InFlight {
    listener: &'static str,
    count: Arc<AtomicUsize>,
}

impl InFlight {
    pub fn new(listener: &'static str) -> Self {
        Self {
            listener,
            count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Registers a new decoding task. The task is finished when the guard drops.
    pub fn enter(&self) -> InFlightGuard {
        let current = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        appstats_statsd::metric!(
            gauge(ServerGauges::PacketsInFlight) = current as u64,
            listener = self.listener,
        );

        InFlightGuard(self.count.clone())
    }

    pub fn get(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}

#[must_use = "the task is only tracked while the guard is alive"]
#[derive(Debug)]
pub struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_guard() {
        let tracker = InFlight::new("test");

        let first = tracker.enter();
        let second = tracker.enter();
        assert_eq!(tracker.get(), 2);

        drop(first);
        assert_eq!(tracker.get(), 1);
        drop(second);
        assert_eq!(tracker.get(), 0);
    }

    #[test]
    fn test_in_flight_gauge() {
        let tracker = InFlight::new("log");
        let captures = appstats_statsd::with_capturing_test_client(|| {
            let _guard = tracker.enter();
        });

        assert_eq!(captures, ["server.packets_in_flight:1|g|#listener:log"]);
    }
}
