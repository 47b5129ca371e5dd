use appstats_statsd::GaugeMetric;

/// Gauge metrics for system components.
pub enum SystemGauges {
    /// The number of messages queued in a service's inbound channel.
    ///
    /// Emitted whenever a service hands out a message. Without backlogs, this number should be
    /// close to `0`. If it approaches the channel capacity, producers are being throttled.
    ///
    /// This metric is tagged with:
    ///  - `service`: The name passed to [`channel`](crate::channel).
    ServiceBackPressure,
}

impl GaugeMetric for SystemGauges {
    fn name(&self) -> &'static str {
        match *self {
            Self::ServiceBackPressure => "service.back_pressure",
        }
    }
}
