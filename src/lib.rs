//! Bridge between battery-powered BLE hygrometers and a line-protocol
//! reporting endpoint.
//!
//! Readings are acquired either by decoding the sensors' broadcasts
//! passively or by connecting to each sensor and asking for a reading.

pub mod bluetooth;
pub mod config;
pub mod error;
pub mod models;
pub mod report;
pub mod utils;

pub use error::{Error, Result};
