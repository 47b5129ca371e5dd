//! A high-level StatsD client for the daemon's own measurements, built on cadence.
//!
//! This is unrelated to the measurements the daemon ingests: it reports how the daemon itself is
//! doing (queue depth, upsert latency, rejected lines) to an external statsd server.
//!
//! ## Defining Metrics
//!
//! Implement one of the metric traits on a custom enum. The traits only provide a type safe
//! metric name, so a counter can never be emitted as a timer by accident.
//!
//! ## Initializing the Client
//!
//! Metrics can be used without initializing a client. In that case, [`with_client`] and the
//! [`metric!`] macro are no-ops. Use [`init`] to report to a statsd server:
//!
//! ```no_run
//! # use std::collections::BTreeMap;
//! appstats_statsd::init(appstats_statsd::MetricsClientConfig {
//!     prefix: "appstats",
//!     host: "localhost:9125",
//!     default_tags: BTreeMap::new(),
//!     sample_rate: 1.0,
//! });
//! ```
//!
//! ## Macro Usage
//!
//! ```
//! use appstats_statsd::{metric, CounterMetric};
//!
//! struct LinesReceived;
//!
//! impl CounterMetric for LinesReceived {
//!     fn name(&self) -> &'static str {
//!         "lines.received"
//!     }
//! }
//!
//! metric!(counter(LinesReceived) += 1);
//! ```
use std::collections::BTreeMap;
use std::net::{ToSocketAddrs, UdpSocket};
use std::ops::Deref;
use std::sync::Arc;

use cadence::{
    BufferedUdpMetricSink, Metric, MetricBuilder, MetricError, QueuingMetricSink, StatsdClient,
};
use parking_lot::RwLock;
use rand::Rng;

/// Maximum number of metric events that can be queued before we start dropping them.
const METRICS_MAX_QUEUE_SIZE: usize = 100_000;

/// Client configuration object to store globally.
#[derive(Debug)]
pub struct MetricsClient {
    /// The raw statsd client.
    pub statsd_client: StatsdClient,
    /// Default tags to apply to every metric.
    pub default_tags: BTreeMap<String, String>,
    /// Global sample rate, between 0.0 and 1.0.
    pub sample_rate: f64,
}

/// Configuration used to create a [`MetricsClient`] with [`init`].
#[derive(Debug)]
pub struct MetricsClientConfig<'a, A> {
    /// Prefix which is prepended to all metric names.
    pub prefix: &'a str,
    /// Host of the statsd server.
    pub host: A,
    /// Tags that are added to all metrics.
    pub default_tags: BTreeMap<String, String>,
    /// Sample rate for metrics, between 0.0 (= 0%) and 1.0 (= 100%).
    pub sample_rate: f64,
}

impl Deref for MetricsClient {
    type Target = StatsdClient;

    fn deref(&self) -> &StatsdClient {
        &self.statsd_client
    }
}

impl MetricsClient {
    /// Sends a metric with the default tags defined on this client.
    #[inline(always)]
    pub fn send_metric<'a, T>(&'a self, mut metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        if !self.should_send() {
            return;
        }

        for (k, v) in &self.default_tags {
            metric = metric.with_tag(k, v);
        }

        if self.sample_rate < 1.0 {
            metric = metric.with_sampling_rate(self.sample_rate);
        }

        if let Err(error) = metric.try_send() {
            appstats_log::error!(
                error = &error as &dyn std::error::Error,
                maximum_capacity = METRICS_MAX_QUEUE_SIZE,
                "error sending a metric",
            );
        }
    }

    fn should_send(&self) -> bool {
        if self.sample_rate <= 0.0 {
            false
        } else if self.sample_rate >= 1.0 {
            true
        } else {
            rand::rng().random::<f64>() <= self.sample_rate
        }
    }
}

static METRICS_CLIENT: RwLock<Option<Arc<MetricsClient>>> = RwLock::new(None);

thread_local! {
    static CURRENT_CLIENT: std::cell::RefCell<Option<Arc<MetricsClient>>> = METRICS_CLIENT.read().clone().into();
}

/// Internal prelude for the macro.
#[doc(hidden)]
pub mod _pred {
    pub use cadence::prelude::*;
}

/// Sets a new statsd client.
pub fn set_client(client: MetricsClient) {
    *METRICS_CLIENT.write() = Some(Arc::new(client));
    CURRENT_CLIENT.with(|cell| cell.replace(METRICS_CLIENT.read().clone()));
}

/// Sets a capturing client for the duration of `f` on the current thread.
///
/// Returns the raw statsd lines emitted while `f` ran.
pub fn with_capturing_test_client(f: impl FnOnce()) -> Vec<String> {
    let (rx, sink) = cadence::SpyMetricSink::new();
    let test_client = MetricsClient {
        statsd_client: StatsdClient::from_sink("", sink),
        default_tags: BTreeMap::new(),
        sample_rate: 1.0,
    };

    CURRENT_CLIENT.with(|cell| {
        let old_client = cell.replace(Some(Arc::new(test_client)));
        f();
        cell.replace(old_client);
    });

    rx.try_iter()
        .map(|line| String::from_utf8_lossy(&line).into_owned())
        .collect()
}

/// Disables the client again.
pub fn disable() {
    *METRICS_CLIENT.write() = None;
}

/// Tells the metrics system to report to statsd.
///
/// Failure to resolve the host or bind a local socket is logged and leaves metrics disabled.
pub fn init<A: ToSocketAddrs>(config: MetricsClientConfig<A>) {
    let addr = match config.host.to_socket_addrs().map(|mut a| a.next()) {
        Ok(Some(addr)) => addr,
        Ok(None) => {
            appstats_log::error!("metrics host did not resolve to any address");
            return;
        }
        Err(error) => {
            appstats_log::error!(
                error = &error as &dyn std::error::Error,
                "failed to resolve metrics host"
            );
            return;
        }
    };

    let sink = UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| socket.set_nonblocking(true).map(|()| socket))
        .map_err(MetricError::from)
        .and_then(|socket| BufferedUdpMetricSink::from(addr, socket))
        .map(|sink| QueuingMetricSink::with_capacity(sink, METRICS_MAX_QUEUE_SIZE));

    let sink = match sink {
        Ok(sink) => sink,
        Err(error) => {
            appstats_log::error!(
                error = &error as &dyn std::error::Error,
                "failed to create metrics sink"
            );
            return;
        }
    };

    appstats_log::info!("reporting metrics to statsd at {addr}");
    if config.sample_rate <= 0.0 {
        appstats_log::debug!("metrics sample rate is 0, no metrics will be reported");
    }

    set_client(MetricsClient {
        statsd_client: StatsdClient::from_sink(config.prefix, sink),
        default_tags: config.default_tags,
        sample_rate: config.sample_rate.clamp(0.0, 1.0),
    });
}

/// Invokes a callback with the current statsd client.
///
/// If statsd is not configured the callback is not invoked. For the most part the [`metric!`]
/// macro should be used instead.
#[inline(always)]
pub fn with_client<F, R>(f: F) -> R
where
    F: FnOnce(&MetricsClient) -> R,
    R: Default,
{
    CURRENT_CLIENT.with(|client| {
        if let Some(client) = client.borrow().as_deref() {
            f(client)
        } else {
            R::default()
        }
    })
}

/// A metric for capturing timings.
///
/// Timings are reported in milliseconds, either from an explicit [`Duration`](std::time::Duration)
/// or by wrapping a block:
///
/// ```
/// use appstats_statsd::{metric, TimerMetric};
///
/// struct QueryDuration;
///
/// impl TimerMetric for QueryDuration {
///     fn name(&self) -> &'static str {
///         "query.duration"
///     }
/// }
///
/// let rows = metric!(timer(QueryDuration), period = "day", {
///     42
/// });
/// assert_eq!(rows, 42);
/// ```
pub trait TimerMetric {
    /// Returns the timer metric name that will be sent to statsd.
    fn name(&self) -> &'static str;
}

/// A metric for capturing counters.
pub trait CounterMetric {
    /// Returns the counter metric name that will be sent to statsd.
    fn name(&self) -> &'static str;
}

/// A metric for capturing gauges.
///
/// Gauge values are an instantaneous measurement such as the number of pending writes.
pub trait GaugeMetric {
    /// Returns the gauge metric name that will be sent to statsd.
    fn name(&self) -> &'static str;
}

/// Emits a metric.
///
/// See [crate-level documentation](self) for examples.
#[macro_export]
macro_rules! metric {
    // counter increment
    (counter($id:expr) += $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        match $value {
            value if value != 0 => {
                $crate::with_client(|client| {
                    use $crate::_pred::*;
                    client.send_metric(
                        client.count_with_tags(&$crate::CounterMetric::name(&$id), value)
                        $(.with_tag(stringify!($($k).*), $v))*
                    )
                })
            },
            _ => {},
        };
    };

    // gauge set
    (gauge($id:expr) = $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::_pred::*;
            client.send_metric(
                client.gauge_with_tags(&$crate::GaugeMetric::name(&$id), $value)
                    $(.with_tag(stringify!($($k).*), $v))*
            )
        })
    };

    // timer value
    (timer($id:expr) = $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::_pred::*;
            client.send_metric(
                client.distribution_with_tags(&$crate::TimerMetric::name(&$id), $value.as_nanos() as f64 / 1e6)
                    $(.with_tag(stringify!($($k).*), $v))*
            )
        })
    };

    // timed block
    (timer($id:expr), $($($k:ident).* = $v:expr,)* $block:block) => {{
        let now = std::time::Instant::now();
        let rv = {$block};
        $crate::metric!(timer($id) = now.elapsed() $(, $($k).* = $v)*);
        rv
    }};
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    struct TestGauge;

    impl GaugeMetric for TestGauge {
        fn name(&self) -> &'static str {
            "queue.depth"
        }
    }

    struct TestCounter;

    impl CounterMetric for TestCounter {
        fn name(&self) -> &'static str {
            "counter"
        }
    }

    struct TestTimer;

    impl TimerMetric for TestTimer {
        fn name(&self) -> &'static str {
            "timer"
        }
    }

    #[test]
    fn test_capturing_client() {
        let captures = with_capturing_test_client(|| {
            metric!(gauge(TestGauge) = 123, backend = "sqlite");
            metric!(counter(TestCounter) += 2);
        });

        assert_eq!(captures, ["queue.depth:123|g|#backend:sqlite", "counter:2|c"]);
    }

    #[test]
    fn test_zero_counter_is_skipped() {
        let captures = with_capturing_test_client(|| {
            metric!(counter(TestCounter) += 0);
        });
        assert!(captures.is_empty());
    }

    #[test]
    fn test_timer_in_millis() {
        let captures = with_capturing_test_client(|| {
            metric!(timer(TestTimer) = Duration::from_millis(1500));
        });
        assert_eq!(captures, ["timer:1500|d"]);
    }

    #[test]
    fn test_timed_block_returns_value() {
        let (value, captures) = {
            let mut value = 0;
            let captures = with_capturing_test_client(|| {
                value = metric!(timer(TestTimer), kind = "scan", { 7 });
            });
            (value, captures)
        };

        assert_eq!(value, 7);
        assert_eq!(captures.len(), 1);
        assert!(captures[0].starts_with("timer:"));
        assert!(captures[0].ends_with("|d|#kind:scan"));
    }

    #[test]
    fn test_no_client_is_noop() {
        let called = with_client(|_| true);
        assert!(!called);
    }
}
