/// Line-protocol formatting of sensor readings
use crate::error::{Error, Result};
use crate::models::{Reading, SensorIdentity, MAX_NAME_LEN};

/// Escape a tag value: non-printable characters are dropped and `,`, ` `
/// and `=` get a backslash.
///
/// # Returns
/// The escaped value, or an error if it would exceed [`MAX_NAME_LEN`] bytes
pub fn escape_tag(value: &str) -> Result<String> {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars().filter(|c| !c.is_control()) {
        if matches!(c, ',' | ' ' | '=') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    if escaped.len() > MAX_NAME_LEN {
        return Err(Error::Report(format!("tag value '{}' too long", value)));
    }
    Ok(escaped)
}

/// Format one report line for a sensor
///
/// `<measurement>,type=bt,id=<addr>,name=<name>[,<tags>] temperature=<t>,humidity=<h>`
///
/// # Arguments
/// * `measurement` - Measurement (database) name
/// * `tags` - Extra tag text appended after the name, may be empty
/// * `sensor` - Sensor the reading belongs to
/// * `reading` - Values to report; absent fields are left out
///
/// # Returns
/// The line, or `None` when there is nothing to report
pub fn format_line(
    measurement: &str,
    tags: &str,
    sensor: &SensorIdentity,
    reading: &Reading,
) -> Result<Option<String>> {
    let mut fields = Vec::with_capacity(2);
    if let Some(t) = reading.temperature {
        fields.push(format!("temperature={:.1}", t));
    }
    if let Some(h) = reading.humidity {
        fields.push(format!("humidity={:.1}", h));
    }
    if fields.is_empty() {
        return Ok(None);
    }

    let name = escape_tag(&sensor.name)?;
    let spacer = if tags.is_empty() { "" } else { "," };
    Ok(Some(format!(
        "{},type=bt,id={},name={}{}{} {}",
        measurement,
        sensor.address.to_hex(),
        name,
        spacer,
        tags,
        fields.join(",")
    )))
}
