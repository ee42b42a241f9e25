/// Bluetooth Low Energy radio stack backed by BlueZ
///
/// Every command returns immediately; the actual bluetoothd call runs in a
/// spawned task whose result is posted as an [`Event`] on the channel given
/// to [`BluezRadio::new`].
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bluer::{
    Adapter, AdapterEvent, Address, AddressType, Device, DiscoveryFilter, DiscoveryTransport, Uuid,
};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use crate::bluetooth::decoder::VENDOR_TAG;
use crate::bluetooth::radio::RadioStack;
use crate::bluetooth::session::{
    Advertisement, Command, ConnHandle, Event, ENABLE_NOTIFY, NOTIFY_CCCD_HANDLE,
};
use crate::error::{Error, Result};
use crate::models::BdAddr;

// Sensor protocol constants
// Vendor broadcast service
const SERVICE_DATA_UUID: Uuid = Uuid::from_u128(0x0000fe95_0000_1000_8000_00805f9b34fb);
// "T=.. H=.." notifications
const RESPONSE_CHAR_UUID: Uuid = Uuid::from_u128(0x226caa55_6476_4566_7562_66734470666d);
const SERVICES_POLL_MS: u64 = 100;

struct Link {
    device: Device,
    notify: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Tasks {
    links: HashMap<ConnHandle, Link>,
    opening: HashMap<BdAddr, JoinHandle<()>>,
    scan: Option<JoinHandle<()>>,
    listener: Option<JoinHandle<()>>,
}

/// Radio stack driving the default BlueZ adapter.
#[derive(Clone)]
pub struct BluezRadio {
    adapter: Adapter,
    events: UnboundedSender<Event>,
    runtime: Handle,
    next_conn: Arc<AtomicU16>,
    tasks: Arc<Mutex<Tasks>>,
}

impl BluezRadio {
    /// Open a bluetoothd session and power on the default adapter
    ///
    /// # Arguments
    /// * `events` - Channel receiving every event the radio produces
    pub async fn new(events: UnboundedSender<Event>) -> Result<Self> {
        let session = match bluer::Session::new().await {
            Ok(session) => session,
            Err(e) => {
                error!("Failed to create Bluetooth session: {}", e);
                return Err(e.into());
            }
        };

        let adapter = match session.default_adapter().await {
            Ok(adapter) => adapter,
            Err(e) => {
                error!("Failed to get default Bluetooth adapter: {}", e);
                return Err(e.into());
            }
        };

        if let Err(e) = adapter.set_powered(true).await {
            error!("Failed to power on adapter: {}", e);
            return Err(e.into());
        }
        info!("Using Bluetooth adapter {}", adapter.name());

        Ok(BluezRadio {
            adapter,
            events,
            runtime: Handle::current(),
            next_conn: Arc::new(AtomicU16::new(1)),
            tasks: Arc::new(Mutex::new(Tasks::default())),
        })
    }

    fn tasks(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn allocate_conn(&self) -> ConnHandle {
        // Zero is never handed out
        loop {
            let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
            if conn != 0 {
                return conn;
            }
        }
    }

    /// Listen to broadcasts continuously, posting one `Advertisement` per
    /// device update until the radio is dropped.
    pub fn listen(&self) {
        self.spawn_listener(Some(self.events.clone()));
        info!("Listening for sensor broadcasts");
    }

    /// Keep discovery running without posting anything.
    ///
    /// bluetoothd forgets unpaired devices shortly after it last heard them,
    /// and a forgotten device cannot be connected to by address alone.
    pub fn keep_discovering(&self) {
        self.spawn_listener(None);
        info!("Keeping device discovery active for connections");
    }

    fn spawn_listener(&self, events: Option<UnboundedSender<Event>>) {
        let adapter = self.adapter.clone();
        let handle = self.runtime.spawn(async move {
            // Warn if it fails, but keep listening with the adapter defaults
            if let Err(e) = adapter.set_discovery_filter(discovery_filter()).await {
                warn!("Failed to set discovery filter: {}", e);
            }
            let result = match events {
                Some(events) => forward_advertisements(adapter, events).await,
                None => hold_discovery(adapter).await,
            };
            if let Err(e) = result {
                error!("Broadcast listener stopped: {}", e);
            }
        });
        if let Some(old) = self.tasks().listener.replace(handle) {
            old.abort();
        }
    }

    fn connect(&self, address: BdAddr) -> Result<()> {
        let radio = self.clone();
        let handle = self.runtime.spawn(async move {
            let target = Address::new(address.to_bytes());
            let event = match open_device(&radio.adapter, target).await {
                Ok(device) => {
                    let conn = radio.allocate_conn();
                    debug!("Connected to {} as {}", address, conn);
                    let link = Link {
                        device,
                        notify: None,
                    };
                    radio.tasks().links.insert(conn, link);
                    Event::OpenSucceeded { address, conn }
                }
                Err(e) => {
                    warn!("Failed to connect to {}: {}", address, e);
                    Event::OpenFailed { address }
                }
            };
            radio.tasks().opening.remove(&address);
            let _ = radio.events.send(event);
        });
        if let Some(old) = self.tasks().opening.insert(address, handle) {
            old.abort();
        }
        Ok(())
    }

    fn cancel_connect(&self, address: BdAddr) -> Result<()> {
        if let Some(task) = self.tasks().opening.remove(&address) {
            task.abort();
        }
        // BlueZ may already be holding the link; drop it
        let device = self.adapter.device(Address::new(address.to_bytes()))?;
        self.runtime.spawn(async move {
            if let Err(e) = device.disconnect().await {
                debug!("Disconnect after cancelled connect to {}: {}", address, e);
            }
        });
        Ok(())
    }

    fn enable_notifications(&self, conn: ConnHandle, handle: u16, value: &[u8]) -> Result<()> {
        if handle != NOTIFY_CCCD_HANDLE || value != ENABLE_NOTIFY {
            return Err(Error::Radio(format!("unsupported write to handle {:#06x}", handle)));
        }
        let device = match self.tasks().links.get(&conn) {
            Some(link) => link.device.clone(),
            None => return Err(Error::Radio(format!("no open connection {}", conn))),
        };

        let events = self.events.clone();
        let task = self.runtime.spawn(async move {
            let stream = match subscribe_response(&device).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Failed to subscribe on connection {}: {}", conn, e);
                    let _ = events.send(Event::WriteFailed { conn });
                    return;
                }
            };
            let _ = events.send(Event::WriteSucceeded { conn });

            let mut stream = Box::pin(stream);
            while let Some(value) = stream.next().await {
                debug!("Notification on {}: {:?}", conn, String::from_utf8_lossy(&value));
                if events.send(Event::Notification { conn, value }).is_err() {
                    break;
                }
            }
        });

        match self.tasks().links.get_mut(&conn) {
            Some(link) => {
                if let Some(old) = link.notify.replace(task) {
                    old.abort();
                }
            }
            None => task.abort(),
        }
        Ok(())
    }

    fn close(&self, conn: ConnHandle) -> Result<()> {
        let link = match self.tasks().links.remove(&conn) {
            Some(link) => link,
            None => return Err(Error::Radio(format!("no open connection {}", conn))),
        };
        if let Some(task) = link.notify {
            task.abort();
        }

        let events = self.events.clone();
        self.runtime.spawn(async move {
            if let Err(e) = link.device.disconnect().await {
                warn!("Failed to disconnect connection {}: {}", conn, e);
            }
            let _ = events.send(Event::CloseCompleted { conn });
        });
        Ok(())
    }

    fn set_scan_params(&self) -> Result<()> {
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        self.runtime.spawn(async move {
            let event = match adapter.set_discovery_filter(discovery_filter()).await {
                Ok(()) => Event::ScanParamsSet,
                Err(e) => {
                    warn!("Failed to set discovery filter: {}", e);
                    Event::ScanFailed
                }
            };
            let _ = events.send(event);
        });
        Ok(())
    }

    fn start_scan(&self) -> Result<()> {
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let handle = self.runtime.spawn(async move {
            let event = match forward_advertisements(adapter, events.clone()).await {
                Ok(()) => Event::ScanComplete,
                Err(e) => {
                    error!("Failed to run device discovery: {}", e);
                    Event::ScanFailed
                }
            };
            let _ = events.send(event);
        });
        if let Some(old) = self.tasks().scan.replace(handle) {
            old.abort();
        }
        Ok(())
    }

    fn stop_scan(&self) -> Result<()> {
        if let Some(task) = self.tasks().scan.take() {
            task.abort();
        }
        Ok(())
    }
}

impl RadioStack for BluezRadio {
    fn execute(&self, command: Command) -> Result<()> {
        debug!("Radio command: {:?}", command);
        match command {
            Command::Connect(address) => self.connect(address),
            Command::CancelConnect(address) => self.cancel_connect(address),
            Command::Write {
                conn,
                handle,
                value,
            } => self.enable_notifications(conn, handle, &value),
            Command::Close { conn } => self.close(conn),
            Command::SetScanParams => self.set_scan_params(),
            Command::StartScan => self.start_scan(),
            Command::StopScan => self.stop_scan(),
        }
    }
}

fn discovery_filter() -> DiscoveryFilter {
    DiscoveryFilter {
        transport: DiscoveryTransport::Le, // Bluetooth Low Energy only
        duplicate_data: true,              // Every broadcast may carry a new measurement
        ..Default::default()
    }
}

/// Connect to a device, asking bluetoothd to create it when it is not known.
async fn open_device(adapter: &Adapter, address: Address) -> bluer::Result<Device> {
    if adapter.device_addresses().await?.contains(&address) {
        let device = adapter.device(address)?;
        device.connect().await?;
        return Ok(device);
    }
    debug!("{} not known to bluetoothd, connecting by address", address);
    adapter.connect_device(address, AddressType::LePublic).await
}

/// Keep a discovery session open, discarding its events.
async fn hold_discovery(adapter: Adapter) -> bluer::Result<()> {
    let stream = adapter.discover_devices().await?;
    let mut stream = Box::pin(stream);
    while stream.next().await.is_some() {}
    Ok(())
}

/// Run device discovery, turning each device update into an `Advertisement`
///
/// Returns once the event receiver is gone or the discovery stream ends.
async fn forward_advertisements(
    adapter: Adapter,
    events: UnboundedSender<Event>,
) -> bluer::Result<()> {
    let stream = adapter.discover_devices_with_changes().await?;
    let mut stream = Box::pin(stream);

    while let Some(event) = stream.next().await {
        let AdapterEvent::DeviceAdded(addr) = event else {
            continue;
        };
        match read_advertisement(&adapter, addr).await {
            Ok(adv) => {
                if events.send(Event::Advertisement(adv)).is_err() {
                    break;
                }
            }
            Err(e) => debug!("Failed to read advertisement of {}: {}", addr, e),
        }
    }
    Ok(())
}

async fn read_advertisement(adapter: &Adapter, addr: Address) -> bluer::Result<Advertisement> {
    let device = adapter.device(addr)?;
    let name = device.name().await?;

    // BlueZ strips the service tag; put it back so the decoder sees the whole frame
    let service_data = device
        .service_data()
        .await?
        .and_then(|mut data| data.remove(&SERVICE_DATA_UUID))
        .map(|body| {
            let mut framed = VENDOR_TAG.to_vec();
            framed.extend_from_slice(&body);
            framed
        });

    Ok(Advertisement {
        address: BdAddr::from_bytes(addr.0),
        name,
        service_data,
    })
}

/// Find the response characteristic and subscribe to it.
async fn subscribe_response(device: &Device) -> Result<impl futures_util::Stream<Item = Vec<u8>>> {
    while !device.is_services_resolved().await? {
        sleep(Duration::from_millis(SERVICES_POLL_MS)).await;
    }

    for service in device.services().await? {
        for characteristic in service.characteristics().await? {
            if characteristic.uuid().await? == RESPONSE_CHAR_UUID {
                return Ok(characteristic.notify().await?);
            }
        }
    }

    Err(Error::Radio(format!(
        "characteristic {} not found",
        RESPONSE_CHAR_UUID
    )))
}
