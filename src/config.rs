use std::env;
use std::str::FromStr;
use std::time::Duration;

use log::{debug, info, warn};

use crate::bluetooth::manager::Timeouts;
use crate::error::{Error, Result};
use crate::models::{BdAddr, SensorIdentity};

/// Most sensors a configuration may list; one result slot each.
pub const MAX_SENSORS: usize = 8;
pub const MIN_POLL_INTERVAL_SECS: u64 = 30;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

/// How readings are acquired from the sensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcquisitionMode {
    /// Listen to broadcasts continuously, never connect.
    #[default]
    Passive,
    /// Connect to each sensor once per poll cycle and ask for a reading.
    Connect,
}

impl AcquisitionMode {
    /// Whether decoded broadcasts feed the result store. Discovery runs in
    /// both modes; connecting needs bluetoothd to keep the sensors known.
    pub fn stores_broadcasts(self) -> bool {
        self == AcquisitionMode::Passive
    }
}

impl FromStr for AcquisitionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "passive" => Ok(AcquisitionMode::Passive),
            "connect" => Ok(AcquisitionMode::Connect),
            other => Err(Error::Config(format!("unknown ACQUISITION_MODE '{}'", other))),
        }
    }
}

/// Where and how readings are reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportConfig {
    pub url: String,
    pub database: String,
    pub tags: String,
}

#[derive(Debug, Clone)]
pub struct SensorConfig {
    pub sensors: Vec<SensorIdentity>,
    pub report: Option<ReportConfig>,
    pub poll_interval: Duration,
    pub mode: AcquisitionMode,
    pub timeouts: Timeouts,
}

impl SensorConfig {
    pub fn new() -> Result<Self> {
        // Load environment variables
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let sensors = sensors_from(&lookup);
        info!("Total sensors loaded: {}", sensors.len());
        for sensor in &sensors {
            debug!("Sensor: {} -> {}", sensor.address, sensor.name);
        }
        if sensors.is_empty() {
            return Err(Error::Config(
                "No sensors configured, set SENSORS or SENSOR_<N>_ADDR/SENSOR_<N>_NAME".into(),
            ));
        }

        let url = non_empty(&lookup, "REPORT_URL");
        let database = non_empty(&lookup, "REPORT_DATABASE");
        let report = match (url, database) {
            (Some(url), Some(database)) => Some(ReportConfig {
                url,
                database,
                tags: non_empty(&lookup, "REPORT_TAGS").unwrap_or_default(),
            }),
            _ => {
                warn!("REPORT_URL or REPORT_DATABASE not set, reporting disabled");
                None
            }
        };

        let mut poll_interval = secs(&lookup, "POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL_SECS)?;
        if poll_interval < Duration::from_secs(MIN_POLL_INTERVAL_SECS) {
            warn!(
                "POLL_INTERVAL_SECS below {} s, using the minimum",
                MIN_POLL_INTERVAL_SECS
            );
            poll_interval = Duration::from_secs(MIN_POLL_INTERVAL_SECS);
        }

        let mode = match non_empty(&lookup, "ACQUISITION_MODE") {
            Some(mode) => mode.parse()?,
            None => AcquisitionMode::default(),
        };

        let defaults = Timeouts::default();
        let timeouts = Timeouts {
            session: secs(&lookup, "SESSION_TIMEOUT_SECS", defaults.session.as_secs())?,
            close: secs(&lookup, "CLOSE_TIMEOUT_SECS", defaults.close.as_secs())?,
            scan: secs(&lookup, "SCAN_DURATION_SECS", defaults.scan.as_secs())?,
        };

        Ok(SensorConfig {
            sensors,
            report,
            poll_interval,
            mode,
            timeouts,
        })
    }
}

fn non_empty<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn secs<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str, default: u64) -> Result<Duration> {
    match non_empty(lookup, key) {
        Some(value) => value
            .parse()
            .map(Duration::from_secs)
            .map_err(|e| Error::Config(format!("{} '{}': {}", key, value, e))),
        None => Ok(Duration::from_secs(default)),
    }
}

fn push_sensor(sensors: &mut Vec<SensorIdentity>, addr: &str, name: &str) {
    if addr.is_empty() || name.is_empty() {
        return;
    }
    if sensors.len() >= MAX_SENSORS {
        warn!("Ignoring sensor '{}': at most {} supported", name, MAX_SENSORS);
        return;
    }
    match addr.parse::<BdAddr>() {
        Ok(address) if sensors.iter().any(|s| s.address == address) => {
            warn!("Ignoring duplicate sensor address {}", address);
        }
        Ok(address) => sensors.push(SensorIdentity::new(address, name)),
        Err(e) => warn!("Ignoring sensor '{}': {}", name, e),
    }
}

fn sensors_from<F: Fn(&str) -> Option<String>>(lookup: &F) -> Vec<SensorIdentity> {
    let mut sensors = Vec::new();

    // Try SENSORS format first
    if let Some(list) = non_empty(lookup, "SENSORS") {
        for pair in list.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            match pair.split_once('=') {
                Some((addr, name)) => push_sensor(&mut sensors, addr.trim(), name.trim()),
                None => warn!("Failed to split sensor entry: '{}'", pair),
            }
        }
        return sensors;
    }

    // Fallback to individual environment variables
    debug!("SENSORS not set, trying SENSOR_<N>_ADDR variables");
    for index in 0..MAX_SENSORS {
        let addr = non_empty(lookup, &format!("SENSOR_{}_ADDR", index));
        let name = non_empty(lookup, &format!("SENSOR_{}_NAME", index));
        if let (Some(addr), Some(name)) = (addr, name) {
            push_sensor(&mut sensors, &addr, &name);
        }
    }
    sensors
}
