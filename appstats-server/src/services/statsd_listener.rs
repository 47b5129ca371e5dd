use std::error::Error;
use std::io;
use std::net::SocketAddr;

use appstats_config::Config;
use appstats_rollup::{IngestMessage, Measurement};
use appstats_system::{Addr, Controller, Receiver, Service};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::constants::MAX_STATSD_PACKET_SIZE;
use crate::services::ServerError;
use crate::services::udp::{self, InFlight};
use crate::statsd::{ServerCounters, ServerGauges};

/// Receives statsd lines over UDP and enqueues the decoded measurements.
///
/// Every datagram is decoded on its own task. The listener itself never waits for the ingestion
/// queue, so it keeps draining the socket while the writer is busy.
#[derive(Debug)]
pub struct StatsdListener {
    socket: UdpSocket,
    ingest: Addr<IngestMessage>,
    in_flight: InFlight,
}

impl StatsdListener {
    /// Binds the statsd socket on the configured address.
    pub fn new(config: &Config, ingest: Addr<IngestMessage>) -> Result<Self, ServerError> {
        let socket = udp::bind(config.statsd_listen_addr())?;

        Ok(Self {
            socket,
            ingest,
            in_flight: InFlight::new("statsd"),
        })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn handle_packet(&self, payload: Vec<u8>, peer: SocketAddr) {
        appstats_statsd::metric!(
            counter(ServerCounters::PacketReceived) += 1,
            listener = "statsd",
        );
        appstats_statsd::metric!(gauge(ServerGauges::IngestQueueDepth) = self.ingest.len() as u64);

        let ingest = self.ingest.clone();
        let guard = self.in_flight.enter();

        tokio::spawn(async move {
            let _guard = guard;

            for result in Measurement::parse_all(&payload) {
                let measurement = match result {
                    Ok(measurement) => measurement,
                    Err(err) => {
                        appstats_log::debug!(
                            error = &err as &dyn Error,
                            %peer,
                            "dropping invalid statsd line"
                        );
                        appstats_statsd::metric!(counter(ServerCounters::MeasurementInvalid) += 1);
                        continue;
                    }
                };

                if ingest.send(measurement.into()).await.is_err() {
                    appstats_statsd::metric!(counter(ServerCounters::IngestDropped) += 1);
                    break;
                }
            }
        });
    }
}

impl Service for StatsdListener {
    type Interface = ();

    fn spawn_handler(self, _rx: Receiver<Self::Interface>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut shutdown = Controller::shutdown_handle();
            let mut buffer = vec![0; MAX_STATSD_PACKET_SIZE];

            match self.local_addr() {
                Ok(addr) => appstats_log::info!("  listening for statsd on udp://{addr}"),
                Err(err) => appstats_log::warn!(
                    error = &err as &dyn Error,
                    "failed to read the statsd listener address"
                ),
            }

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.notified() => break,
                    result = self.socket.recv_from(&mut buffer) => match result {
                        Ok((len, peer)) => self.handle_packet(buffer[..len].to_vec(), peer),
                        Err(err) => appstats_log::error!(
                            error = &err as &dyn Error,
                            "failed to receive statsd packet"
                        ),
                    },
                }
            }

            appstats_log::info!(
                in_flight = self.in_flight.get(),
                "statsd listener stopped"
            );
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use appstats_rollup::MeasurementKind;

    use super::*;

    fn config() -> Config {
        Config::from_json_value(serde_json::json!({
            "listen": {"host": "127.0.0.1", "statsd_port": 0}
        }))
        .unwrap()
    }

    async fn recv(rx: &mut Receiver<IngestMessage>) -> IngestMessage {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_receives_measurements() {
        appstats_test::setup();

        let (addr, mut rx) = appstats_system::channel("ingest", 10);
        let listener = StatsdListener::new(&config(), addr).unwrap();
        let target = listener.local_addr().unwrap();
        listener.start(1);

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(b"web.route.count:1|c|@0.5\nbroken\r\nweb.route.time:27|ms", target)
            .await
            .unwrap();

        let IngestMessage::Measurement(first) = recv(&mut rx).await else {
            panic!("expected a measurement");
        };
        assert_eq!(first.bucket, "web.route.count");
        assert_eq!(first.value, 2.0);

        let IngestMessage::Measurement(second) = recv(&mut rx).await else {
            panic!("expected a measurement");
        };
        assert_eq!(second.kind, MeasurementKind::Timer);
        assert_eq!(second.value, 27.0);

        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let occupied = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();

        let config = Config::from_json_value(serde_json::json!({
            "listen": {"host": "127.0.0.1", "statsd_port": port}
        }))
        .unwrap();

        let (addr, _rx) = appstats_system::channel("ingest", 1);
        // SO_REUSEADDR does not permit sharing a UDP port with a socket that did not set it.
        let result = StatsdListener::new(&config, addr);
        assert!(matches!(result, Err(ServerError::BindFailed(_))));
    }
}
