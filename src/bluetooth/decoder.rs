/// Decoding of the vendor's broadcast service data into sensor readings
use log::debug;

use crate::models::Reading;

// Broadcast protocol constants
pub const VENDOR_TAG: [u8; 2] = [0x95, 0xFE]; // Service UUID 0xFE95, little-endian
const FRAME_CONTROL_EXTENDED: u8 = 0x20; // Extra counter byte present before the payload
const PAYLOAD_OFFSET: usize = 13;
const MEASUREMENT_SENTINEL: u8 = 0x10;
const MIN_FRAME_LEN: usize = 6;

const TYPE_TEMPERATURE: u8 = 0x04;
const TYPE_HUMIDITY: u8 = 0x06;
const TYPE_BOTH: u8 = 0x0D;

/// Outcome of decoding one broadcast.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decoded {
    Temperature(f32),
    Humidity(f32),
    Both { temperature: f32, humidity: f32 },
    /// Not this vendor's format, or structurally invalid. Expected for most
    /// advertisements in a real radio environment.
    NotRecognized,
}

impl Decoded {
    /// Fold the decoded values into a reading, leaving untouched fields as they were.
    pub fn apply_to(self, reading: &mut Reading) {
        match self {
            Decoded::Temperature(t) => reading.temperature = Some(t),
            Decoded::Humidity(h) => reading.humidity = Some(h),
            Decoded::Both {
                temperature,
                humidity,
            } => {
                reading.temperature = Some(temperature);
                reading.humidity = Some(humidity);
            }
            Decoded::NotRecognized => {}
        }
    }
}

/// Decode the service data of one broadcast packet
///
/// Frame layout, starting with the 2-byte service tag:
/// - Bytes 0-1: Vendor tag (0x95 0xFE)
/// - Byte 2: Frame control; bit 0x20 inserts one extra byte before the payload
/// - Bytes 13.. (or 14..): Payload
///   - Measurement type (0x04 temperature, 0x06 humidity, 0x0D both)
///   - Sentinel 0x10
///   - Declared value length, must equal the remaining byte count
///   - Values: temperature i16 LE, humidity u16 LE, both scaled by 0.1
///
/// # Arguments
/// * `data` - Raw service data bytes, untrusted
///
/// # Returns
/// The decoded measurement, or `NotRecognized` for anything else
pub fn decode(data: &[u8]) -> Decoded {
    if data.len() < MIN_FRAME_LEN || data[..2] != VENDOR_TAG {
        return Decoded::NotRecognized;
    }

    let offset = if data[2] & FRAME_CONTROL_EXTENDED != 0 {
        PAYLOAD_OFFSET + 1
    } else {
        PAYLOAD_OFFSET
    };
    if data.len() < offset + 3 {
        return Decoded::NotRecognized;
    }

    let [kind, sentinel, declared, values @ ..] = &data[offset..] else {
        return Decoded::NotRecognized;
    };
    // Length field must describe exactly what follows, or the frame is cut/padded
    if *sentinel != MEASUREMENT_SENTINEL || values.len() != usize::from(*declared) {
        return Decoded::NotRecognized;
    }

    let decoded = match (*kind, values) {
        (TYPE_TEMPERATURE, &[lo, hi]) => Decoded::Temperature(temperature(lo, hi)),
        (TYPE_HUMIDITY, &[lo, hi]) => Decoded::Humidity(humidity(lo, hi)),
        (TYPE_BOTH, &[t_lo, t_hi, h_lo, h_hi]) => Decoded::Both {
            temperature: temperature(t_lo, t_hi),
            humidity: humidity(h_lo, h_hi),
        },
        _ => Decoded::NotRecognized,
    };

    if decoded != Decoded::NotRecognized {
        debug!("Decoded broadcast: {:?}", decoded);
    }
    decoded
}

fn temperature(lo: u8, hi: u8) -> f32 {
    i16::from_le_bytes([lo, hi]) as f32 / 10.0
}

fn humidity(lo: u8, hi: u8) -> f32 {
    u16::from_le_bytes([lo, hi]) as f32 / 10.0
}
