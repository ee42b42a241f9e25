use std::sync::Arc;

use log::{debug, error, info, warn};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};

use hygrometer_etl::bluetooth::{BluezRadio, ResultStore, SessionManager, MAX_SCAN_RESULTS};
use hygrometer_etl::config::{AcquisitionMode, SensorConfig};
use hygrometer_etl::report::{format_line, resolve_endpoint, ReportSender};
use hygrometer_etl::utils::{drain_readings, duration_to_seconds, format_datetime};

const IDLE_SLEEP_SECS: u64 = 60;

type Manager = SessionManager<BluezRadio>;

async fn main_loop(
    config: SensorConfig,
    manager: Arc<Manager>,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting hygrometer reporting service");

    let report = match &config.report {
        Some(report) => report.clone(),
        None => {
            // Nothing to report to; keep the radio side alive until configured
            warn!("Reporting disabled, idling");
            loop {
                sleep(Duration::from_secs(IDLE_SLEEP_SECS)).await;
            }
        }
    };
    let sender = ReportSender::bind(resolve_endpoint(&report.url)?).await?;
    info!("Reporting to {} every {:?}", sender.target(), config.poll_interval);

    let mut ticker = interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; give broadcasts one interval to arrive
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let start_time = OffsetDateTime::now_utc();
        info!("Starting poll cycle at: {}", format_datetime(&start_time));

        if config.mode == AcquisitionMode::Connect {
            let refreshed = manager.refresh_all().await;
            debug!("{} sensors answered a connection", refreshed);
        }

        let mut reported = 0;
        for (sensor, reading) in drain_readings(manager.store(), &manager.sensors()) {
            match format_line(&report.database, &report.tags, &sensor, &reading) {
                Ok(Some(line)) => {
                    sender.send(&line).await;
                    reported += 1;
                }
                Ok(None) => debug!("No data from {} this cycle", sensor.name),
                Err(e) => error!("Failed to format report for {}: {}", sensor.name, e),
            }
        }

        // Warning if no data collected
        if reported == 0 {
            warn!("No data collected during this interval!");
        }
        let elapsed = duration_to_seconds(OffsetDateTime::now_utc() - start_time);
        info!("Reported {} sensors in {} s", reported, elapsed);
    }
}

async fn run_discovery(manager: &Manager) -> Result<(), Box<dyn std::error::Error>> {
    let entries = manager.discover(MAX_SCAN_RESULTS).await?;
    for entry in &entries {
        println!("{} {}", entry.address, entry.name.as_deref().unwrap_or(""));
    }
    info!("{} devices found", entries.len());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_timestamp_secs()
        .init();

    // Load configuration
    let config = match SensorConfig::new() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let radio = BluezRadio::new(events_tx).await?;
    let store = Arc::new(ResultStore::new(config.sensors.len()));
    let manager = Arc::new(SessionManager::new(radio.clone(), store, config.timeouts));
    manager.configure(config.sensors.clone());
    tokio::spawn(Arc::clone(&manager).run(events_rx));

    if std::env::args().nth(1).as_deref() == Some("discover") {
        return run_discovery(&manager).await;
    }

    if config.mode.stores_broadcasts() {
        radio.listen();
    } else {
        radio.keep_discovering();
    }

    // Handle Ctrl+C gracefully
    let (tx, mut rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        let _ = tx.send(());
    });

    // Run main loop or wait for shutdown signal
    tokio::select! {
        result = main_loop(config, manager) => {
            match result {
                Ok(_) => info!("Program completed successfully"),
                Err(e) => error!("Fatal error: {}", e),
            }
        }
        _ = &mut rx => {
            info!("Program terminated by user. Exiting gracefully.");
        }
    }

    Ok(())
}
