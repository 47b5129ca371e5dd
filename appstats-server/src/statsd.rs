use appstats_statsd::{CounterMetric, GaugeMetric};

/// Counter metrics for the network listeners and the HTTP server.
pub enum ServerCounters {
    /// Number of UDP datagrams received.
    ///
    /// This metric is tagged with:
    ///  - `listener`: `statsd` or `log`.
    PacketReceived,
    /// Number of statsd lines that could not be parsed.
    MeasurementInvalid,
    /// Number of log lines that could not be parsed.
    LogInvalid,
    /// Number of decoded messages that could not be enqueued because the writer stopped.
    IngestDropped,
    /// Number of times the HTTP server started.
    ServerStarting,
}

impl CounterMetric for ServerCounters {
    fn name(&self) -> &'static str {
        match self {
            Self::PacketReceived => "server.packet.received",
            Self::MeasurementInvalid => "server.measurement.invalid",
            Self::LogInvalid => "server.log.invalid",
            Self::IngestDropped => "server.ingest.dropped",
            Self::ServerStarting => "server.starting",
        }
    }
}

/// Gauge metrics for the network listeners.
pub enum ServerGauges {
    /// Number of datagrams whose decoding task has not finished yet.
    ///
    /// Decoding tasks wait while the ingestion queue is full, so this number grows without bound
    /// when the writer cannot keep up.
    ///
    /// This metric is tagged with:
    ///  - `listener`: `statsd` or `log`.
    PacketsInFlight,
    /// Number of messages waiting in the ingestion queue, sampled on every datagram.
    IngestQueueDepth,
}

impl GaugeMetric for ServerGauges {
    fn name(&self) -> &'static str {
        match self {
            Self::PacketsInFlight => "server.packets_in_flight",
            Self::IngestQueueDepth => "server.ingest_queue_depth",
        }
    }
}
