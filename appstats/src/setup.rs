use anyhow::Result;
use appstats_config::Config;
use appstats_rollup::StoreBackend;
use appstats_statsd::MetricsClientConfig;

/// Validates settings that cannot be checked while parsing the config file.
pub fn check_config(config: &Config) -> Result<()> {
    let listen = config.listen();
    if listen.statsd_port != 0 && listen.statsd_port == listen.log_port {
        anyhow::bail!(
            "the statsd and log listeners are both configured on udp port {}",
            listen.statsd_port
        );
    }

    if config.queue_size() == 0 {
        anyhow::bail!("`ingest.queue_size` must be at least 1");
    }

    if config.max_packet_size() == 0 {
        anyhow::bail!("`ingest.max_packet_size` must be at least 1");
    }

    if config.storage().max_connections == 0 {
        anyhow::bail!("`storage.max_connections` must be at least 1");
    }

    Ok(())
}

/// Print spawn infos to the log.
pub fn dump_spawn_infos(config: &Config) {
    if config.path().as_os_str().is_empty() {
        appstats_log::info!("launching appstats without config folder");
    } else {
        appstats_log::info!(
            "launching appstats from config folder {}",
            config.path().display()
        );
    }

    let storage = config.storage();
    match storage.backend {
        StoreBackend::Sqlite => {
            appstats_log::info!("  storage: sqlite at {}", storage.path.display());
        }
        StoreBackend::Memory => {
            appstats_log::info!("  storage: memory");
            appstats_log::warn!("rollups are kept in memory and lost on shutdown");
        }
    }

    appstats_log::info!("  queue size: {}", config.queue_size());
    appstats_log::info!("  error statistics: {}", config.error_statistics());
    appstats_log::info!("  log level: {}", config.logging().level);
}

/// Initialize the metric system.
pub fn init_metrics(config: &Config) -> Result<()> {
    let addrs = config.statsd_addrs()?;
    if addrs.is_empty() {
        return Ok(());
    }

    let mut default_tags = config.metrics_default_tags().clone();
    if let Some(hostname_tag) = config.metrics_hostname_tag()
        && let Some(hostname) = hostname::get().ok().and_then(|s| s.into_string().ok())
    {
        default_tags.insert(hostname_tag.to_owned(), hostname);
    }

    appstats_statsd::init(MetricsClientConfig {
        prefix: config.metrics_prefix(),
        host: addrs.as_slice(),
        default_tags,
        sample_rate: config.metrics_sample_rate(),
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_default_config() {
        assert!(check_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_check_port_conflict() {
        let config = Config::from_json_value(serde_json::json!({
            "listen": {"statsd_port": 9000, "log_port": 9000}
        }))
        .unwrap();

        let error = check_config(&config).unwrap_err();
        assert_eq!(
            error.to_string(),
            "the statsd and log listeners are both configured on udp port 9000"
        );
    }

    #[test]
    fn test_check_empty_queue() {
        let config = Config::from_json_value(serde_json::json!({
            "ingest": {"queue_size": 0}
        }))
        .unwrap();

        assert!(check_config(&config).is_err());
    }
}
