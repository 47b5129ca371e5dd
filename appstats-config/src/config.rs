use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use appstats_rollup::{StoreBackend, StoreConfig};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Defines the source of a config error.
#[derive(Debug, Default)]
enum ConfigErrorSource {
    /// An error occurring independently.
    #[default]
    None,
    /// An error originating from a configuration file.
    File(PathBuf),
    /// An error originating in a field override, such as a CLI parameter.
    FieldOverride(String),
}

/// Indicates config related errors.
#[derive(Debug)]
pub struct ConfigError {
    source: ConfigErrorSource,
    kind: ConfigErrorKind,
    cause: Option<BoxError>,
}

impl ConfigError {
    #[inline]
    fn new(kind: ConfigErrorKind) -> Self {
        Self {
            source: ConfigErrorSource::None,
            kind,
            cause: None,
        }
    }

    #[inline]
    fn wrap<E>(cause: E, kind: ConfigErrorKind) -> Self
    where
        E: Into<BoxError>,
    {
        Self {
            cause: Some(cause.into()),
            ..Self::new(kind)
        }
    }

    #[inline]
    fn for_field<E>(cause: E, field: &'static str) -> Self
    where
        E: Into<BoxError>,
    {
        Self::wrap(cause, ConfigErrorKind::InvalidValue).field(field)
    }

    #[inline]
    fn file<P: AsRef<Path>>(mut self, p: P) -> Self {
        self.source = ConfigErrorSource::File(p.as_ref().to_path_buf());
        self
    }

    #[inline]
    fn field(mut self, name: &'static str) -> Self {
        self.source = ConfigErrorSource::FieldOverride(name.to_owned());
        self
    }

    /// Returns the error kind of the error.
    pub fn kind(&self) -> ConfigErrorKind {
        self.kind
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            ConfigErrorSource::None => self.kind.fmt(f),
            ConfigErrorSource::File(file_name) => {
                write!(f, "{} (file {})", self.kind, file_name.display())
            }
            ConfigErrorSource::FieldOverride(name) => write!(f, "{} (field {})", self.kind, name),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause.as_deref().map(|cause| cause as &(dyn Error + 'static))
    }
}

/// Indicates config related errors.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, thiserror::Error)]
pub enum ConfigErrorKind {
    /// Failed to open the file.
    #[error("could not open config file")]
    CouldNotOpenFile,
    /// Failed to serialize the configuration.
    #[error("could not write config file")]
    CouldNotWriteFile,
    /// Parsing YAML failed.
    #[error("could not parse yaml config file")]
    BadYaml,
    /// Parsing JSON failed.
    #[error("could not parse json config file")]
    BadJson,
    /// Invalid config value.
    #[error("invalid config value")]
    InvalidValue,
}

trait ConfigObject: DeserializeOwned + Serialize {
    /// The basename of the config file.
    fn name() -> &'static str;

    /// The full filename of the config file.
    fn path(base: &Path) -> PathBuf {
        base.join(format!("{}.yml", Self::name()))
    }

    /// Loads the config file from a file within the given directory location.
    fn load(base: &Path) -> Result<Self, ConfigError> {
        let path = Self::path(base);

        let f = fs::File::open(&path)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotOpenFile).file(&path))?;

        serde_yaml::from_reader(io::BufReader::new(f))
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml).file(&path))
    }
}

/// Structure used to hold information about configuration overrides via CLI parameters.
#[derive(Debug, Default)]
pub struct OverridableConfig {
    /// The host all sockets bind to.
    pub host: Option<String>,
    /// The UDP port for statsd measurements.
    pub statsd_port: Option<String>,
    /// The UDP port for log lines.
    pub log_port: Option<String>,
    /// The port of the HTTP query API.
    pub http_port: Option<String>,
    /// The storage backend, `sqlite` or `memory`.
    pub storage: Option<String>,
    /// Path to the database file.
    pub storage_path: Option<String>,
    /// Shutdown timeout in seconds.
    pub shutdown_timeout: Option<String>,
}

/// Network sockets of the daemon.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct Listen {
    /// The host all sockets bind to.
    pub host: IpAddr,
    /// The UDP port for statsd measurements.
    pub statsd_port: u16,
    /// The UDP port for log lines.
    pub log_port: u16,
    /// The TCP port of the HTTP query API.
    pub http_port: u16,
}

impl Default for Listen {
    fn default() -> Self {
        Listen {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            statsd_port: 8125,
            log_port: 8126,
            http_port: 8127,
        }
    }
}

/// Controls the ingestion pipeline.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Ingest {
    /// Capacity of the bounded write queue.
    ///
    /// Defaults to `1000`.
    queue_size: usize,
    /// Receive buffer size for log datagrams in bytes.
    ///
    /// Longer datagrams are truncated. Defaults to `1024`.
    max_packet_size: usize,
    /// Derive error counters from error and warning log lines.
    ///
    /// Defaults to `true`.
    error_statistics: bool,
}

impl Default for Ingest {
    fn default() -> Self {
        Ingest {
            queue_size: appstats_rollup::DEFAULT_QUEUE_SIZE,
            max_packet_size: 1024,
            error_statistics: true,
        }
    }
}

/// Controls the HTTP query API.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Query {
    /// Number of days queried when `amount` is missing.
    default_amount: u32,
    /// Number of log records returned when `amount` is missing.
    default_log_amount: usize,
    /// Maximum time in seconds to answer a request.
    timeout: u64,
}

impl Default for Query {
    fn default() -> Self {
        Query {
            default_amount: 2,
            default_log_amount: 100,
            timeout: 30,
        }
    }
}

/// Controls various limits.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Limits {
    /// Seconds to wait for queued writes to drain on shutdown.
    shutdown_timeout: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            shutdown_timeout: 10,
        }
    }
}

/// Control the metrics.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Metrics {
    /// Hostname and port of the statsd server.
    ///
    /// Defaults to `None`, which disables internal metrics.
    statsd: Option<String>,
    /// Common prefix that should be added to all metrics.
    ///
    /// Defaults to `"appstats"`.
    prefix: String,
    /// Default tags to apply to all metrics.
    default_tags: BTreeMap<String, String>,
    /// Tag name to report the hostname to for each metric. Defaults to not sending such a tag.
    hostname_tag: Option<String>,
    /// Global sample rate for all emitted metrics between `0.0` and `1.0`.
    ///
    /// Defaults to `1.0`.
    sample_rate: f64,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: None,
            prefix: "appstats".into(),
            default_tags: BTreeMap::new(),
            hostname_tag: None,
            sample_rate: 1.0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct ConfigValues {
    #[serde(default)]
    listen: Listen,
    #[serde(default)]
    ingest: Ingest,
    #[serde(default)]
    storage: StoreConfig,
    #[serde(default)]
    query: Query,
    #[serde(default)]
    limits: Limits,
    #[serde(default)]
    logging: appstats_log::LogConfig,
    #[serde(default)]
    metrics: Metrics,
}

impl ConfigObject for ConfigValues {
    fn name() -> &'static str {
        "config"
    }
}

/// Config struct.
#[derive(Debug, Default)]
pub struct Config {
    values: ConfigValues,
    path: PathBuf,
}

impl Config {
    /// Loads a config from a given config folder.
    ///
    /// If the folder does not contain a config file, the default configuration is returned.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = std::env::current_dir()
            .map(|x| x.join(path.as_ref()))
            .unwrap_or_else(|_| path.as_ref().to_path_buf());

        let values = if Self::config_exists(&path) {
            ConfigValues::load(&path)?
        } else {
            ConfigValues::default()
        };

        Ok(Config { values, path })
    }

    /// Creates a config from a JSON value.
    ///
    /// This is mostly useful for tests.
    pub fn from_json_value(value: serde_json::Value) -> Result<Config, ConfigError> {
        Ok(Config {
            values: serde_json::from_value(value)
                .map_err(|err| ConfigError::wrap(err, ConfigErrorKind::BadJson))?,
            path: PathBuf::new(),
        })
    }

    /// Override configuration with values coming from the command line.
    pub fn apply_override(
        &mut self,
        overrides: OverridableConfig,
    ) -> Result<&mut Self, ConfigError> {
        let listen = &mut self.values.listen;

        if let Some(host) = overrides.host {
            listen.host = host
                .parse::<IpAddr>()
                .map_err(|err| ConfigError::for_field(err, "host"))?;
        }

        if let Some(port) = overrides.statsd_port {
            listen.statsd_port = port
                .parse()
                .map_err(|err| ConfigError::for_field(err, "statsd_port"))?;
        }

        if let Some(port) = overrides.log_port {
            listen.log_port = port
                .parse()
                .map_err(|err| ConfigError::for_field(err, "log_port"))?;
        }

        if let Some(port) = overrides.http_port {
            listen.http_port = port
                .parse()
                .map_err(|err| ConfigError::for_field(err, "http_port"))?;
        }

        let storage = &mut self.values.storage;
        if let Some(backend) = overrides.storage {
            storage.backend = match backend.to_lowercase().as_str() {
                "sqlite" => StoreBackend::Sqlite,
                "memory" => StoreBackend::Memory,
                _ => return Err(ConfigError::new(ConfigErrorKind::InvalidValue).field("storage")),
            };
        }

        if let Some(path) = overrides.storage_path {
            storage.path = PathBuf::from(path);
        }

        if let Some(shutdown_timeout) = overrides.shutdown_timeout {
            self.values.limits.shutdown_timeout = shutdown_timeout
                .parse()
                .map_err(|err| ConfigError::for_field(err, "shutdown_timeout"))?;
        }

        Ok(self)
    }

    /// Checks if the config file exists in the given folder.
    pub fn config_exists<P: AsRef<Path>>(path: P) -> bool {
        fs::metadata(ConfigValues::path(path.as_ref())).is_ok()
    }

    /// Returns the config directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Dumps out a YAML string of the values.
    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(&self.values)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotWriteFile))
    }

    /// Returns the listen section.
    pub fn listen(&self) -> &Listen {
        &self.values.listen
    }

    /// Returns the socket address of the statsd listener.
    pub fn statsd_listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.values.listen.host, self.values.listen.statsd_port)
    }

    /// Returns the socket address of the log listener.
    pub fn log_listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.values.listen.host, self.values.listen.log_port)
    }

    /// Returns the socket address of the HTTP query API.
    pub fn http_listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.values.listen.host, self.values.listen.http_port)
    }

    /// Returns the capacity of the ingestion queue.
    pub fn queue_size(&self) -> usize {
        self.values.ingest.queue_size
    }

    /// Returns the receive buffer size for log datagrams.
    pub fn max_packet_size(&self) -> usize {
        self.values.ingest.max_packet_size
    }

    /// Returns `true` if error counters are derived from log lines.
    pub fn error_statistics(&self) -> bool {
        self.values.ingest.error_statistics
    }

    /// Returns the store configuration with the database path resolved against the config
    /// directory.
    pub fn storage(&self) -> StoreConfig {
        let storage = &self.values.storage;
        StoreConfig {
            path: self.path.join(&storage.path),
            ..storage.clone()
        }
    }

    /// Returns the number of days queried when no amount is given.
    pub fn default_query_amount(&self) -> u32 {
        self.values.query.default_amount
    }

    /// Returns the number of log records returned when no amount is given.
    pub fn default_log_amount(&self) -> usize {
        self.values.query.default_log_amount
    }

    /// Returns the maximum duration of an HTTP request.
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.values.query.timeout)
    }

    /// Returns the time to wait for queued writes on shutdown.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.values.limits.shutdown_timeout)
    }

    /// Returns the logging configuration.
    pub fn logging(&self) -> &appstats_log::LogConfig {
        &self.values.logging
    }

    /// Returns the socket addresses for statsd.
    ///
    /// If stats is disabled an empty vector is returned.
    pub fn statsd_addrs(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        if let Some(ref addr) = self.values.metrics.statsd {
            let addrs = addr
                .as_str()
                .to_socket_addrs()
                .map_err(|e| ConfigError::for_field(e, "metrics.statsd"))?
                .collect();
            Ok(addrs)
        } else {
            Ok(vec![])
        }
    }

    /// Return the prefix for statsd metrics.
    pub fn metrics_prefix(&self) -> &str {
        &self.values.metrics.prefix
    }

    /// Returns the default tags for statsd metrics.
    pub fn metrics_default_tags(&self) -> &BTreeMap<String, String> {
        &self.values.metrics.default_tags
    }

    /// Returns the name of the hostname tag that should be attached to each outgoing metric.
    pub fn metrics_hostname_tag(&self) -> Option<&str> {
        self.values.metrics.hostname_tag.as_deref()
    }

    /// Returns the global sample rate for all metrics.
    pub fn metrics_sample_rate(&self) -> f64 {
        self.values.metrics.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_path(dir.path()).unwrap();

        assert_eq!(config.statsd_listen_addr(), "0.0.0.0:8125".parse().unwrap());
        assert_eq!(config.log_listen_addr(), "0.0.0.0:8126".parse().unwrap());
        assert_eq!(config.http_listen_addr(), "0.0.0.0:8127".parse().unwrap());
        assert_eq!(config.queue_size(), 1000);
        assert!(config.error_statistics());
        assert_eq!(config.default_query_amount(), 2);
        assert_eq!(config.storage().backend, StoreBackend::Sqlite);
        assert_eq!(config.storage().path, dir.path().join("appstats.db"));
        assert!(config.statsd_addrs().unwrap().is_empty());
    }

    #[test]
    fn test_load_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = fs::File::create(dir.path().join("config.yml")).unwrap();
        file.write_all(
            br#"
listen:
  host: 127.0.0.1
  statsd_port: 9125
ingest:
  queue_size: 50
  error_statistics: false
storage:
  backend: memory
logging:
  level: debug
metrics:
  statsd: 127.0.0.1:8125
  default_tags:
    env: test
"#,
        )
        .unwrap();

        let config = Config::from_path(dir.path()).unwrap();
        assert_eq!(config.statsd_listen_addr(), "127.0.0.1:9125".parse().unwrap());
        assert_eq!(config.http_listen_addr(), "127.0.0.1:8127".parse().unwrap());
        assert_eq!(config.queue_size(), 50);
        assert!(!config.error_statistics());
        assert_eq!(config.storage().backend, StoreBackend::Memory);
        assert_eq!(config.logging().level, appstats_log::LogLevel::Debug);
        assert_eq!(config.statsd_addrs().unwrap().len(), 1);
        assert_eq!(config.metrics_default_tags()["env"], "test");
    }

    #[test]
    fn test_bad_yaml() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("config.yml"), "listen: [").unwrap();

        let error = Config::from_path(dir.path()).unwrap_err();
        assert_eq!(error.kind(), ConfigErrorKind::BadYaml);
        assert!(error.source().is_some());
    }

    #[test]
    fn test_overrides() {
        let mut config = Config::default();
        config
            .apply_override(OverridableConfig {
                host: Some("10.0.0.1".to_owned()),
                http_port: Some("9000".to_owned()),
                storage: Some("Memory".to_owned()),
                storage_path: Some("/var/lib/appstats.db".to_owned()),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(config.http_listen_addr(), "10.0.0.1:9000".parse().unwrap());
        assert_eq!(config.storage().backend, StoreBackend::Memory);
        assert_eq!(config.storage().path, PathBuf::from("/var/lib/appstats.db"));
    }

    #[test]
    fn test_invalid_override() {
        let mut config = Config::default();
        let error = config
            .apply_override(OverridableConfig {
                http_port: Some("http".to_owned()),
                ..Default::default()
            })
            .unwrap_err();

        assert_eq!(error.kind(), ConfigErrorKind::InvalidValue);
        insta::assert_snapshot!(error.to_string(), @"invalid config value (field http_port)");

        let error = config
            .apply_override(OverridableConfig {
                storage: Some("mongo".to_owned()),
                ..Default::default()
            })
            .unwrap_err();
        insta::assert_snapshot!(error.to_string(), @"invalid config value (field storage)");
    }

    #[test]
    fn test_from_json_value() {
        let config = Config::from_json_value(serde_json::json!({
            "query": {"default_amount": 7},
            "storage": {"backend": "memory"},
        }))
        .unwrap();

        assert_eq!(config.default_query_amount(), 7);
        assert_eq!(config.default_log_amount(), 100);

        let yaml = config.to_yaml_string().unwrap();
        assert!(yaml.contains("backend: memory"));
    }
}
