/// Request façade over the session state machine
///
/// Callers get two awaitable operations, `request_reading` and `discover`,
/// of which at most one runs at a time. Radio events arrive separately
/// through `handle_event` (or the `run` pump) from the radio stack's own
/// tasks and drive the state machine to completion.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tokio::time::{timeout, timeout_at, Instant};

use crate::bluetooth::decoder::{decode, Decoded};
use crate::bluetooth::radio::RadioStack;
use crate::bluetooth::session::{transition, Advertisement, Event, Outcome, Phase, Session};
use crate::bluetooth::store::ResultStore;
use crate::error::{Error, Result};
use crate::models::{bounded_name, BdAddr, Reading, ScanEntry, SensorIdentity};

/// Default cap on distinct devices kept by one discovery run.
pub const MAX_SCAN_RESULTS: usize = 32;

/// Time bounds for radio operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Whole connect/write/notify exchange.
    pub session: Duration,
    /// Teardown confirmation after a result or an abort.
    pub close: Duration,
    /// Length of one discovery run.
    pub scan: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            session: Duration::from_secs(20),
            close: Duration::from_secs(5),
            scan: Duration::from_secs(10),
        }
    }
}

/// Devices collected during one discovery run, deduplicated by address.
#[derive(Debug)]
struct ScanBuffer {
    entries: Vec<ScanEntry>,
    capacity: usize,
}

impl ScanBuffer {
    fn new(capacity: usize) -> Self {
        ScanBuffer {
            entries: Vec::with_capacity(capacity.min(MAX_SCAN_RESULTS)),
            capacity,
        }
    }

    fn record(&mut self, address: BdAddr, name: Option<&str>) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.address == address) {
            // Names often arrive in a later scan response; first one wins
            if entry.name.is_none() {
                entry.name = name.map(bounded_name);
            }
            return;
        }
        if self.entries.len() < self.capacity {
            self.entries.push(ScanEntry {
                address,
                name: name.map(bounded_name),
            });
        }
    }
}

struct Inner {
    session: Session,
    waiter: Option<oneshot::Sender<Outcome>>,
    scan: Option<ScanBuffer>,
}

pub struct SessionManager<R> {
    radio: R,
    inner: Mutex<Inner>,
    operation: AsyncMutex<()>,
    phase: watch::Sender<Phase>,
    store: Arc<ResultStore>,
    sensors: RwLock<Vec<SensorIdentity>>,
    timeouts: Timeouts,
}

impl<R: RadioStack> SessionManager<R> {
    pub fn new(radio: R, store: Arc<ResultStore>, timeouts: Timeouts) -> Self {
        let (phase, _) = watch::channel(Phase::Idle);
        SessionManager {
            radio,
            inner: Mutex::new(Inner {
                session: Session::idle(),
                waiter: None,
                scan: None,
            }),
            operation: AsyncMutex::new(()),
            phase,
            store,
            sensors: RwLock::new(Vec::new()),
            timeouts,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install a new sensor list. Slots follow list order and all readings
    /// start over as absent.
    pub fn configure(&self, sensors: Vec<SensorIdentity>) {
        let mut table = self.sensors.write().unwrap_or_else(PoisonError::into_inner);
        self.store.reset(sensors.len());
        info!("Configured {} sensors", sensors.len());
        *table = sensors;
    }

    pub fn sensors(&self) -> Vec<SensorIdentity> {
        self.sensors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn store(&self) -> &Arc<ResultStore> {
        &self.store
    }

    pub fn session(&self) -> Session {
        self.lock().session
    }

    pub fn phase(&self) -> Phase {
        self.lock().session.phase()
    }

    /// Feed one event from the radio stack.
    pub fn handle_event(&self, event: Event) {
        if let Event::Advertisement(adv) = &event {
            self.on_advertisement(adv);
        }
        self.apply(event);
    }

    /// Drain the radio stack's event channel until it closes.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        debug!("Radio event channel closed");
    }

    fn on_advertisement(&self, adv: &Advertisement) {
        {
            let mut inner = self.lock();
            if inner.session.phase() == Phase::Scanning {
                if let Some(buffer) = inner.scan.as_mut() {
                    buffer.record(adv.address, adv.name.as_deref());
                }
            }
        }

        let Some(data) = adv.service_data.as_deref() else {
            return;
        };
        let decoded = decode(data);
        if decoded == Decoded::NotRecognized {
            return;
        }
        // The table stays locked until the value is stored, so a concurrent
        // configure cannot reassign the slot in between
        let sensors = self.sensors.read().unwrap_or_else(PoisonError::into_inner);
        let Some(slot) = sensors.iter().position(|s| s.address == adv.address) else {
            debug!("Ignoring broadcast from unconfigured sensor {}", adv.address);
            return;
        };
        match self.store.apply(slot, decoded) {
            Ok(()) => debug!("Stored {:?} from {} in slot {}", decoded, adv.address, slot),
            Err(e) => warn!("Dropping broadcast from {}: {}", adv.address, e),
        }
    }

    /// Run the state machine on an event and carry out its commands.
    ///
    /// Commands the radio refuses are turned into their failure events and
    /// fed back in, so every rejection still reaches a terminal state.
    fn apply(&self, event: Event) {
        let mut pending = VecDeque::from([event]);
        while let Some(event) = pending.pop_front() {
            let commands = {
                let mut inner = self.lock();
                let before = inner.session.phase();
                let (session, step) = transition(inner.session, event);
                inner.session = session;
                if let Some(outcome) = step.outcome {
                    if let Some(waiter) = inner.waiter.take() {
                        let _ = waiter.send(outcome);
                    }
                }
                if session.phase() != before {
                    debug!("Session {:?} -> {:?}", before, session.phase());
                    self.phase.send_replace(session.phase());
                }
                step.commands
            };

            for command in commands {
                if let Err(e) = self.radio.execute(command.clone()) {
                    warn!("Radio rejected {:?}: {}", command, e);
                    pending.extend(command.rejection());
                }
            }
        }
    }

    /// Arm a fresh completion signal and issue the opening request.
    fn begin(
        &self,
        request: Event,
        scan: Option<ScanBuffer>,
    ) -> Result<oneshot::Receiver<Outcome>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.lock();
            if !inner.session.is_idle() {
                return Err(Error::Busy);
            }
            inner.waiter = Some(tx);
            inner.scan = scan;
        }
        self.apply(request);
        Ok(rx)
    }

    /// Deadline of the session in flight. A session that already finished
    /// has none left.
    fn deadline(&self) -> Instant {
        self.lock().session.deadline().unwrap_or_else(Instant::now)
    }

    /// Wait for the session to return to idle, forcing it there once the
    /// close bound runs out.
    async fn settle(&self) {
        let mut phase = self.phase.subscribe();
        let confirmed = matches!(
            timeout(self.timeouts.close, phase.wait_for(|p| *p == Phase::Idle)).await,
            Ok(Ok(_))
        );
        if !confirmed {
            warn!(
                "Teardown not confirmed within {:?}, forcing session idle",
                self.timeouts.close
            );
            self.apply(Event::ForceIdle);
        }
        self.lock().waiter = None;
    }

    /// Connect to a sensor, ask for one reading and disconnect
    ///
    /// Fails fast with `Busy` while another operation holds the radio. A
    /// sensor that never answers yields `Timeout` after at most the session
    /// bound plus the close bound, with the session back in `Idle`.
    ///
    /// # Arguments
    /// * `address` - Hardware address of the sensor
    ///
    /// # Returns
    /// The decoded reading, both fields present
    pub async fn request_reading(&self, address: BdAddr) -> Result<Reading> {
        let _operation = self.operation.try_lock().map_err(|_| Error::Busy)?;

        let request = Event::OpenRequest {
            address,
            deadline: Instant::now() + self.timeouts.session,
        };
        let mut done = self.begin(request, None)?;
        let deadline = self.deadline();
        debug!("Requesting reading from {}", address);

        let result = match timeout_at(deadline, &mut done).await {
            Ok(Ok(Outcome::Reading(reading))) => Ok(reading),
            Ok(Ok(Outcome::Failed(e))) => Err(e),
            Ok(Ok(Outcome::ScanFinished)) | Ok(Err(_)) | Err(_) => {
                warn!("No answer from {} within {:?}", address, self.timeouts.session);
                self.apply(Event::Abort);
                Err(Error::Timeout)
            }
        };

        self.settle().await;
        result
    }

    /// Ask every configured sensor for a fresh reading
    ///
    /// Each answer is merged into the sensor's slot. A sensor that fails or
    /// times out keeps whatever its slot held before.
    ///
    /// # Returns
    /// Number of sensors whose slot was refreshed
    pub async fn refresh_all(&self) -> usize {
        let mut refreshed = 0;
        for (slot, sensor) in self.sensors().iter().enumerate() {
            match self.request_reading(sensor.address).await {
                Ok(reading) => {
                    debug!(
                        "Received data from {}: temp={:?}°C, humidity={:?}%",
                        sensor.name, reading.temperature, reading.humidity
                    );
                    match self.store.merge(slot, reading) {
                        Ok(()) => refreshed += 1,
                        Err(e) => warn!("Failed to store reading for {}: {}", sensor.name, e),
                    }
                }
                Err(e) => warn!("No reading from {} ({}): {}", sensor.name, sensor.address, e),
            }
        }
        refreshed
    }

    /// Run one discovery scan and list the devices heard
    ///
    /// # Arguments
    /// * `max_results` - Distinct addresses to keep; later ones are dropped
    ///
    /// # Returns
    /// Devices seen, deduplicated by address, at most `max_results` long
    pub async fn discover(&self, max_results: usize) -> Result<Vec<ScanEntry>> {
        let _operation = self.operation.try_lock().map_err(|_| Error::Busy)?;

        let request = Event::ScanRequest {
            deadline: Instant::now() + self.timeouts.scan,
        };
        let mut done = self.begin(request, Some(ScanBuffer::new(max_results)))?;
        let deadline = self.deadline();
        info!("Discovering devices for {:?}", self.timeouts.scan);

        let result = match timeout_at(deadline, &mut done).await {
            Ok(Ok(Outcome::Failed(e))) => Err(e),
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) | Err(_) => {
                // Scan duration elapsing is the normal end of a discovery run
                let started = self.phase() == Phase::Scanning;
                self.apply(Event::Abort);
                if started {
                    Ok(())
                } else {
                    Err(Error::Timeout)
                }
            }
        };

        self.settle().await;
        let entries = self
            .lock()
            .scan
            .take()
            .map(|buffer| buffer.entries)
            .unwrap_or_default();

        result.map(|()| {
            info!("Discovery found {} devices", entries.len());
            entries
        })
    }
}
