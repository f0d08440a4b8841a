use clap::ArgMatches;
use s3_sync_monitor::{
    config::Config,
    connection_probe::NetstatSampler,
    logging::LoggerManager,
    manifest::read_manifest,
    monitor::UploadMonitor,
    object_store::HttpObjectStore,
    shutdown::ShutdownCoordinator,
    validation_result::ValidationReport,
    validator::ConsistencyValidator,
    MonitorError, Result,
};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

const HEAD_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Sample until SIGINT/SIGTERM, reporting backpressure, idleness and new write errors
async fn run_monitor(config: &Config) -> Result<()> {
    let probe = &config.monitor.probe;
    let sampler = NetstatSampler::new(
        probe.command.clone(),
        probe.args.clone(),
        probe.port,
        probe.timeout,
    );

    let mut monitor = UploadMonitor::new(&config.monitor, config.backoff, sampler)?;
    monitor.start()?;

    let coordinator = ShutdownCoordinator::new();
    let mut shutdown = coordinator.subscribe();
    let listener = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            if let Err(e) = coordinator.listen_for_shutdown().await {
                error!("Shutdown listener failed: {}", e);
            }
        })
    };

    let period = config.monitor.check_interval;
    let mut report = interval_at(Instant::now() + period, period);
    report.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut reported_errors = BTreeSet::new();

    loop {
        tokio::select! {
            _ = report.tick() => {
                match monitor.backoff_reason() {
                    Some(reason) => warn!("Backoff: {}", reason),
                    None => info!(
                        "Uploads: queue={} multipart={} connections={}",
                        monitor.queue_depth(),
                        monitor.multipart_uploads(),
                        monitor.connection_count()
                    ),
                }

                if monitor.writes_are_complete() {
                    info!("Writes complete: upload queue idle for {} samples", config.monitor.idle_window);
                }

                for write_error in monitor.write_errors() {
                    if reported_errors.insert(write_error.clone()) {
                        error!("Write failed at {}: {}", write_error.timestamp, write_error.message);
                    }
                }
            }
            _ = shutdown.wait_for_shutdown() => break,
        }
    }

    monitor.destroy().await;
    listener.abort();
    info!("Monitor stopped");
    Ok(())
}

/// Validate every manifest entry; fails when any entry did not validate
async fn run_validate(config: &Config, matches: &ArgMatches) -> Result<()> {
    let manifest_path = matches
        .get_one::<String>("manifest")
        .map(PathBuf::from)
        .ok_or_else(|| MonitorError::ConfigError("--manifest is required".to_string()))?;
    let entries = read_manifest(&manifest_path).await?;

    let store = HttpObjectStore::new(&config.validation.endpoint, HEAD_REQUEST_TIMEOUT)?;
    let validator = Arc::new(ConsistencyValidator::from_config(&config.validation, store));
    let report = Arc::new(ValidationReport::new());

    validator
        .validate_all(entries, report.clone(), config.validation.max_concurrent)
        .await;

    let summary = report.summary();
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if summary.failed > 0 {
        return Err(MonitorError::InvalidState(format!(
            "{} of {} manifest entries failed validation",
            summary.failed,
            summary.failed + summary.validated
        )));
    }

    info!("All {} manifest entries validated", summary.validated);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Config::build_cli().get_matches();
    let config = Config::load(&matches)?;

    LoggerManager::for_local_host(config.logging.clone()).initialize()?;

    info!(
        "Starting s3-sync-monitor v{} (built: {})",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIMESTAMP")
    );

    match matches.subcommand() {
        Some(("monitor", _)) => run_monitor(&config).await,
        Some(("validate", sub)) => run_validate(&config, sub).await,
        _ => Err(MonitorError::ConfigError(
            "expected a subcommand: monitor | validate".to_string(),
        )),
    }
}
