use std::error::Error;
use std::io;
use std::net::SocketAddr;

use appstats_config::Config;
use appstats_rollup::{IngestMessage, LogRecord};
use appstats_system::{Addr, Controller, Receiver, Service};
use chrono::{DateTime, Utc};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::services::ServerError;
use crate::services::udp::{self, InFlight};
use crate::statsd::{ServerCounters, ServerGauges};

/// Receives log lines over UDP and enqueues them as [`LogRecord`]s.
///
/// Records are timestamped when their datagram arrives. Datagrams longer than the configured
/// packet size are truncated.
#[derive(Debug)]
pub struct LogListener {
    socket: UdpSocket,
    ingest: Addr<IngestMessage>,
    in_flight: InFlight,
    max_packet_size: usize,
}

impl LogListener {
    /// Binds the log socket on the configured address.
    pub fn new(config: &Config, ingest: Addr<IngestMessage>) -> Result<Self, ServerError> {
        let socket = udp::bind(config.log_listen_addr())?;

        Ok(Self {
            socket,
            ingest,
            in_flight: InFlight::new("log"),
            max_packet_size: config.max_packet_size(),
        })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn handle_packet(&self, payload: Vec<u8>, peer: SocketAddr, received: DateTime<Utc>) {
        appstats_statsd::metric!(
            counter(ServerCounters::PacketReceived) += 1,
            listener = "log",
        );
        appstats_statsd::metric!(gauge(ServerGauges::IngestQueueDepth) = self.ingest.len() as u64);

        let ingest = self.ingest.clone();
        let guard = self.in_flight.enter();

        tokio::spawn(async move {
            let _guard = guard;

            for result in LogRecord::parse_all(&payload, received) {
                let record = match result {
                    Ok(record) => record,
                    Err(err) => {
                        appstats_log::debug!(
                            error = &err as &dyn Error,
                            %peer,
                            "dropping invalid log line"
                        );
                        appstats_statsd::metric!(counter(ServerCounters::LogInvalid) += 1);
                        continue;
                    }
                };

                if ingest.send(record.into()).await.is_err() {
                    appstats_statsd::metric!(counter(ServerCounters::IngestDropped) += 1);
                    break;
                }
            }
        });
    }
}

impl Service for LogListener {
    type Interface = ();

    fn spawn_handler(self, _rx: Receiver<Self::Interface>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut shutdown = Controller::shutdown_handle();
            let mut buffer = vec![0; self.max_packet_size];

            if let Ok(addr) = self.local_addr() {
                appstats_log::info!("  listening for logs on udp://{addr}");
            }

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.notified() => break,
                    result = self.socket.recv_from(&mut buffer) => match result {
                        Ok((len, peer)) => {
                            self.handle_packet(buffer[..len].to_vec(), peer, Utc::now());
                        }
                        Err(err) => appstats_log::error!(
                            error = &err as &dyn Error,
                            "failed to receive log packet"
                        ),
                    },
                }
            }

            appstats_log::info!(in_flight = self.in_flight.get(), "log listener stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use appstats_rollup::LogLevel;

    use super::*;

    async fn recv(rx: &mut Receiver<IngestMessage>) -> LogRecord {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(IngestMessage::Log(record))) => record,
            other => panic!("expected a log record, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_receives_log_lines() {
        appstats_test::setup();

        let config = Config::from_json_value(serde_json::json!({
            "listen": {"host": "127.0.0.1", "log_port": 0}
        }))
        .unwrap();

        let (addr, mut rx) = appstats_system::channel("ingest", 10);
        let listener = LogListener::new(&config, addr).unwrap();
        let target = listener.local_addr().unwrap();
        listener.start(1);

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(b"web:2:db:lost: retrying\nx\nweb:9:db:bad level\nweb:5:auth:ok", target)
            .await
            .unwrap();

        let first = recv(&mut rx).await;
        assert_eq!(first.level, LogLevel::Error);
        assert_eq!(first.message_id, "db");
        assert_eq!(first.message, "lost: retrying");

        let second = recv(&mut rx).await;
        assert_eq!(second.level, LogLevel::Info);
        assert_eq!(second.message, "ok");
        assert_eq!(second.timestamp, first.timestamp);
    }

    #[tokio::test]
    async fn test_truncates_long_datagrams() {
        let config = Config::from_json_value(serde_json::json!({
            "listen": {"host": "127.0.0.1", "log_port": 0},
            "ingest": {"max_packet_size": 16}
        }))
        .unwrap();

        let (addr, mut rx) = appstats_system::channel("ingest", 10);
        let listener = LogListener::new(&config, addr).unwrap();
        let target = listener.local_addr().unwrap();
        listener.start(1);

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(b"web:3:disk:almost full", target)
            .await
            .unwrap();

        let record = recv(&mut rx).await;
        assert_eq!(record.message, "almos");
    }
}
