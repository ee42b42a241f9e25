/// Utility functions for the poll cycle: draining results and formatting
use time::{format_description, OffsetDateTime};

use crate::bluetooth::store::ResultStore;
use crate::models::{Reading, SensorIdentity};

/// Format a timestamp for human-readable logging
///
/// Converts an OffsetDateTime to DD.MM.YYYY - HH:MM:SS format
/// Falls back to default string representation if formatting fails.
pub fn format_datetime(dt: &OffsetDateTime) -> String {
    match format_description::parse("[day].[month].[year] - [hour]:[minute]:[second]") {
        Ok(format) => dt.format(&format).unwrap_or_else(|_| dt.to_string()),
        Err(_) => dt.to_string(),
    }
}

/// Convert a time::Duration to seconds as u64, negative durations as zero
pub fn duration_to_seconds(duration: time::Duration) -> u64 {
    duration.whole_seconds().max(0) as u64
}

/// Consume the current readings of every configured sensor
///
/// Each value is taken out of the store, so a sensor that stays silent until
/// the next cycle is reported as absent rather than repeating stale data.
///
/// # Arguments
/// * `store` - Result store whose slots follow `sensors` order
/// * `sensors` - Configured sensors
///
/// # Returns
/// One entry per sensor, in slot order, including empty readings
pub fn drain_readings(
    store: &ResultStore,
    sensors: &[SensorIdentity],
) -> Vec<(SensorIdentity, Reading)> {
    sensors
        .iter()
        .enumerate()
        .map(|(slot, sensor)| {
            let reading = Reading {
                temperature: store.take_temperature(slot),
                humidity: store.take_humidity(slot),
            };
            (sensor.clone(), reading)
        })
        .collect()
}
