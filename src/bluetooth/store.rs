/// Last readings per configured sensor, shared between event delivery and the poller
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::debug;

use crate::bluetooth::decoder::Decoded;
use crate::error::{Error, Result};
use crate::models::Reading;

/// Fixed-size table mapping a sensor slot to its last reading.
///
/// Slot indices follow the order of the configured sensor list. Every
/// operation holds the internal lock for its whole duration, so a reader
/// sees either the old or the new value and `take_*` cannot race a writer.
#[derive(Debug, Default)]
pub struct ResultStore {
    slots: Mutex<Vec<Reading>>,
}

impl ResultStore {
    pub fn new(slots: usize) -> Self {
        ResultStore {
            slots: Mutex::new(vec![Reading::default(); slots]),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Reading>> {
        // Readings stay valid even if a holder panicked mid-update
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Forget every value, keeping the slot count.
    pub fn clear_all(&self) {
        let mut slots = self.lock();
        slots.iter_mut().for_each(|r| *r = Reading::default());
        debug!("Cleared {} result slots", slots.len());
    }

    /// Resize for a new sensor list; all slots start absent.
    pub fn reset(&self, slots: usize) {
        let mut guard = self.lock();
        guard.clear();
        guard.resize(slots, Reading::default());
    }

    fn with_slot<T>(&self, slot: usize, f: impl FnOnce(&mut Reading) -> T) -> Result<T> {
        let mut slots = self.lock();
        let total = slots.len();
        slots
            .get_mut(slot)
            .map(f)
            .ok_or(Error::SlotOutOfRange { slot, slots: total })
    }

    pub fn set_temperature(&self, slot: usize, value: f32) -> Result<()> {
        self.with_slot(slot, |r| r.temperature = Some(value))
    }

    pub fn set_humidity(&self, slot: usize, value: f32) -> Result<()> {
        self.with_slot(slot, |r| r.humidity = Some(value))
    }

    /// Write whichever fields a decoded broadcast carries.
    pub fn apply(&self, slot: usize, decoded: Decoded) -> Result<()> {
        self.with_slot(slot, |r| decoded.apply_to(r))
    }

    /// Write the present fields of a reading; absent fields keep their old value.
    pub fn merge(&self, slot: usize, reading: Reading) -> Result<()> {
        self.with_slot(slot, |r| {
            if let Some(t) = reading.temperature {
                r.temperature = Some(t);
            }
            if let Some(h) = reading.humidity {
                r.humidity = Some(h);
            }
        })
    }

    pub fn temperature(&self, slot: usize) -> Option<f32> {
        self.lock().get(slot).and_then(|r| r.temperature)
    }

    pub fn humidity(&self, slot: usize) -> Option<f32> {
        self.lock().get(slot).and_then(|r| r.humidity)
    }

    pub fn reading(&self, slot: usize) -> Option<Reading> {
        self.lock().get(slot).copied()
    }

    /// Read and clear the temperature in one locked step.
    pub fn take_temperature(&self, slot: usize) -> Option<f32> {
        self.lock().get_mut(slot).and_then(|r| r.temperature.take())
    }

    /// Read and clear the humidity in one locked step.
    pub fn take_humidity(&self, slot: usize) -> Option<f32> {
        self.lock().get_mut(slot).and_then(|r| r.humidity.take())
    }
}
