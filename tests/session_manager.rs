//! Session manager behaviour against a scripted in-memory radio.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hygrometer_etl::bluetooth::session::{ENABLE_NOTIFY, NOTIFY_CCCD_HANDLE};
use hygrometer_etl::bluetooth::{
    Advertisement, Command, ConnHandle, Event, Phase, RadioStack, ResultStore, SessionManager,
    Timeouts,
};
use hygrometer_etl::models::{BdAddr, Reading, SensorIdentity};
use hygrometer_etl::{Error, Result};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::time::{sleep, Instant};

const KITCHEN: BdAddr = BdAddr::new(0x4C65_A8D0_0001);
const BEDROOM: BdAddr = BdAddr::new(0x4C65_A8D0_0002);
const CELLAR: BdAddr = BdAddr::new(0x4C65_A8D0_0003);

/// How a scripted peer reacts to the manager's commands.
#[derive(Debug, Clone, Copy)]
enum Peer {
    /// Connects, accepts the write and sends this text.
    Responds(&'static str),
    /// Responds, but its link never reports closing.
    RespondsNeverCloses(&'static str),
    /// Connection attempts never complete.
    Silent,
    /// The radio stack refuses to even start connecting.
    Refused,
    /// Connects but rejects the notification write.
    RejectsWrite,
    /// Connects and accepts the write, then neither answers nor closes.
    Mute,
}

struct ScriptedRadio {
    events: UnboundedSender<Event>,
    peers: HashMap<BdAddr, Peer>,
    broadcasts: Vec<Advertisement>,
    reject_scan: bool,
    commands: Mutex<Vec<Command>>,
    links: Mutex<HashMap<ConnHandle, BdAddr>>,
    next_conn: AtomicU16,
}

impl ScriptedRadio {
    fn peer_of(&self, conn: ConnHandle) -> Option<Peer> {
        let address = *self.links.lock().unwrap().get(&conn)?;
        self.peers.get(&address).copied()
    }

    fn send(&self, event: Event) {
        let _ = self.events.send(event);
    }

    fn commands(&self) -> Vec<Command> {
        self.commands.lock().unwrap().clone()
    }
}

impl RadioStack for ScriptedRadio {
    fn execute(&self, command: Command) -> Result<()> {
        self.commands.lock().unwrap().push(command.clone());
        match command {
            Command::Connect(address) => match self.peers.get(&address) {
                Some(Peer::Refused) => return Err(Error::Radio("connect refused".into())),
                Some(Peer::Silent) | None => {}
                Some(_) => {
                    let conn = self.next_conn.fetch_add(1, Ordering::SeqCst);
                    self.links.lock().unwrap().insert(conn, address);
                    self.send(Event::OpenSucceeded { address, conn });
                }
            },
            Command::Write { conn, .. } => match self.peer_of(conn) {
                Some(Peer::Responds(text)) | Some(Peer::RespondsNeverCloses(text)) => {
                    self.send(Event::WriteSucceeded { conn });
                    self.send(Event::Notification {
                        conn,
                        value: text.as_bytes().to_vec(),
                    });
                }
                Some(Peer::Mute) => self.send(Event::WriteSucceeded { conn }),
                _ => self.send(Event::WriteFailed { conn }),
            },
            Command::Close { conn } => {
                let closes = !matches!(
                    self.peer_of(conn),
                    Some(Peer::RespondsNeverCloses(_)) | Some(Peer::Mute)
                );
                if closes {
                    self.send(Event::CloseCompleted { conn });
                }
            }
            Command::SetScanParams if self.reject_scan => {
                return Err(Error::Radio("scan parameters rejected".into()))
            }
            Command::SetScanParams => self.send(Event::ScanParamsSet),
            Command::StartScan => {
                for adv in &self.broadcasts {
                    self.send(Event::Advertisement(adv.clone()));
                }
            }
            Command::CancelConnect(_) | Command::StopScan => {}
        }
        Ok(())
    }
}

struct Harness {
    manager: Arc<SessionManager<Arc<ScriptedRadio>>>,
    radio: Arc<ScriptedRadio>,
}

fn timeouts() -> Timeouts {
    Timeouts {
        session: Duration::from_millis(300),
        close: Duration::from_millis(100),
        scan: Duration::from_millis(200),
    }
}

fn harness_with(
    peers: &[(BdAddr, Peer)],
    broadcasts: Vec<Advertisement>,
    reject_scan: bool,
) -> Harness {
    let (tx, rx) = unbounded_channel();
    let radio = Arc::new(ScriptedRadio {
        events: tx,
        peers: peers.iter().copied().collect(),
        broadcasts,
        reject_scan,
        commands: Mutex::new(Vec::new()),
        links: Mutex::new(HashMap::new()),
        next_conn: AtomicU16::new(1),
    });
    let manager = Arc::new(SessionManager::new(
        Arc::clone(&radio),
        Arc::new(ResultStore::new(0)),
        timeouts(),
    ));
    tokio::spawn(Arc::clone(&manager).run(rx));
    Harness { manager, radio }
}

fn harness(peers: &[(BdAddr, Peer)]) -> Harness {
    harness_with(peers, Vec::new(), false)
}

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut data = vec![0x95, 0xFE, 0x50, 0x20, 0xAA, 0x01, 0x17];
    data.extend_from_slice(&[0x01, 0x00, 0xD0, 0xA8, 0x65, 0x4C]);
    data.extend_from_slice(payload);
    data
}

fn broadcast(address: BdAddr, name: Option<&str>, service_data: Option<Vec<u8>>) -> Advertisement {
    Advertisement {
        address,
        name: name.map(str::to_string),
        service_data,
    }
}

#[tokio::test]
async fn reading_runs_open_write_notify_close() {
    let h = harness(&[(KITCHEN, Peer::Responds("T=22.5 H=51.0\0"))]);

    let reading = h.manager.request_reading(KITCHEN).await.unwrap();

    assert_eq!(
        reading,
        Reading {
            temperature: Some(22.5),
            humidity: Some(51.0)
        }
    );
    assert_eq!(h.manager.phase(), Phase::Idle);
    assert_eq!(
        h.radio.commands(),
        vec![
            Command::Connect(KITCHEN),
            Command::Write {
                conn: 1,
                handle: NOTIFY_CCCD_HANDLE,
                value: ENABLE_NOTIFY.to_vec()
            },
            Command::Close { conn: 1 },
        ]
    );
}

#[tokio::test]
async fn concurrent_request_is_busy_and_leaves_session_alone() {
    let h = harness(&[(KITCHEN, Peer::Silent), (BEDROOM, Peer::Responds("T=1.0 H=2.0"))]);

    let first = {
        let manager = Arc::clone(&h.manager);
        tokio::spawn(async move { manager.request_reading(KITCHEN).await })
    };
    sleep(Duration::from_millis(50)).await;
    let before = h.manager.session();
    assert_eq!(before.phase(), Phase::Opening);

    assert_eq!(h.manager.request_reading(BEDROOM).await, Err(Error::Busy));
    assert_eq!(h.manager.discover(4).await, Err(Error::Busy));
    assert_eq!(h.manager.session(), before);
    assert_eq!(before.target(), Some(KITCHEN));

    assert_eq!(first.await.unwrap(), Err(Error::Timeout));
}

#[tokio::test]
async fn timeout_cleans_up_for_the_next_request() {
    let h = harness(&[(KITCHEN, Peer::Silent), (BEDROOM, Peer::Responds("T=19.5 H=44.0"))]);
    let t = timeouts();

    let started = Instant::now();
    assert_eq!(h.manager.request_reading(KITCHEN).await, Err(Error::Timeout));
    assert!(started.elapsed() <= t.session + t.close + Duration::from_millis(100));
    assert_eq!(h.manager.phase(), Phase::Idle);
    assert_eq!(h.manager.session().target(), None);
    assert!(h.radio.commands().contains(&Command::CancelConnect(KITCHEN)));

    let reading = h.manager.request_reading(BEDROOM).await.unwrap();
    assert_eq!(reading.temperature, Some(19.5));
}

#[tokio::test]
async fn refused_connect_fails_fast() {
    let h = harness(&[(KITCHEN, Peer::Refused)]);

    let started = Instant::now();
    assert_eq!(h.manager.request_reading(KITCHEN).await, Err(Error::OpenFailed));
    assert!(started.elapsed() < timeouts().session);
    assert_eq!(h.manager.phase(), Phase::Idle);
}

#[tokio::test]
async fn rejected_write_closes_the_link() {
    let h = harness(&[(KITCHEN, Peer::RejectsWrite)]);

    assert_eq!(h.manager.request_reading(KITCHEN).await, Err(Error::WriteFailed));
    assert_eq!(h.manager.phase(), Phase::Idle);
    assert_eq!(h.radio.commands().last(), Some(&Command::Close { conn: 1 }));
}

#[tokio::test]
async fn malformed_response() {
    let h = harness(&[(KITCHEN, Peer::Responds("temperature 20"))]);

    assert_eq!(h.manager.request_reading(KITCHEN).await, Err(Error::Malformed));
    assert_eq!(h.manager.phase(), Phase::Idle);
}

#[tokio::test]
async fn unconfirmed_teardown_is_forced_and_late_close_tolerated() {
    let h = harness(&[
        (KITCHEN, Peer::RespondsNeverCloses("T=20.0 H=30.0")),
        (BEDROOM, Peer::Responds("T=21.0 H=31.0")),
    ]);

    let reading = h.manager.request_reading(KITCHEN).await.unwrap();
    assert_eq!(reading.humidity, Some(30.0));
    assert_eq!(h.manager.phase(), Phase::Idle);

    // The stack finally reports the old link closing
    h.manager.handle_event(Event::CloseCompleted { conn: 1 });
    assert_eq!(h.manager.phase(), Phase::Idle);

    let reading = h.manager.request_reading(BEDROOM).await.unwrap();
    assert_eq!(reading.temperature, Some(21.0));
}

#[tokio::test]
async fn discovery_dedups_and_caps_results() {
    let broadcasts = vec![
        broadcast(KITCHEN, None, None),
        broadcast(KITCHEN, Some("MJ_HT_V1"), None),
        broadcast(BEDROOM, Some("LYWSD03MMC"), None),
        broadcast(CELLAR, Some("Other"), None),
        broadcast(KITCHEN, Some("Renamed"), None),
    ];
    let h = harness_with(&[], broadcasts, false);

    let entries = h.manager.discover(2).await.unwrap();

    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].address, KITCHEN);
    assert_eq!(entries[0].name.as_deref(), Some("MJ_HT_V1"));
    assert_eq!(entries[1].address, BEDROOM);
    assert_eq!(h.manager.phase(), Phase::Idle);
    assert!(h.radio.commands().contains(&Command::StopScan));
}

#[tokio::test]
async fn discovery_rejected_by_stack() {
    let h = harness_with(&[], Vec::new(), true);

    assert_eq!(h.manager.discover(8).await, Err(Error::ScanFailed));
    assert_eq!(h.manager.phase(), Phase::Idle);
}

#[tokio::test]
async fn broadcasts_land_in_configured_slots() {
    let h = harness(&[]);
    h.manager.configure(vec![
        SensorIdentity::new(KITCHEN, "Kitchen"),
        SensorIdentity::new(BEDROOM, "Bedroom"),
    ]);
    let store = Arc::clone(h.manager.store());

    // Temperature 1.0 C for the bedroom, humidity 45.5 % for the kitchen
    h.manager.handle_event(Event::Advertisement(broadcast(
        BEDROOM,
        None,
        Some(frame(&[0x04, 0x10, 0x02, 0x0A, 0x00])),
    )));
    h.manager.handle_event(Event::Advertisement(broadcast(
        KITCHEN,
        Some("MJ_HT_V1"),
        Some(frame(&[0x06, 0x10, 0x02, 0xC7, 0x01])),
    )));
    // Unconfigured sensor and foreign payload
    h.manager.handle_event(Event::Advertisement(broadcast(
        CELLAR,
        None,
        Some(frame(&[0x04, 0x10, 0x02, 0x0A, 0x00])),
    )));
    let foreign = vec![0x4C, 0x00, 0x02, 0x15, 0x00, 0x00];
    h.manager.handle_event(Event::Advertisement(broadcast(KITCHEN, None, Some(foreign))));

    assert_eq!(store.temperature(1), Some(1.0));
    assert_eq!(store.humidity(1), None);
    assert_eq!(store.humidity(0), Some(45.5));
    assert_eq!(store.temperature(0), None);
    assert_eq!(store.len(), 2);
    // Broadcasts never move the session
    assert_eq!(h.manager.phase(), Phase::Idle);
}

#[tokio::test]
async fn reconfiguring_resets_results() {
    let h = harness(&[]);
    h.manager.configure(vec![SensorIdentity::new(KITCHEN, "Kitchen")]);
    h.manager.handle_event(Event::Advertisement(broadcast(
        KITCHEN,
        None,
        Some(frame(&[0x0D, 0x10, 0x04, 0xD6, 0x00, 0xE0, 0x01])),
    )));
    assert_eq!(h.manager.store().temperature(0), Some(21.4));

    h.manager.configure(vec![
        SensorIdentity::new(BEDROOM, "Bedroom"),
        SensorIdentity::new(KITCHEN, "Kitchen"),
    ]);
    assert_eq!(h.manager.store().len(), 2);
    assert_eq!(h.manager.store().reading(1), Some(Reading::default()));
    assert_eq!(h.manager.sensors()[1].address, KITCHEN);
}

#[tokio::test]
async fn mute_peer_times_out_within_session_and_close_bounds() {
    let h = harness(&[
        (KITCHEN, Peer::Mute),
        (BEDROOM, Peer::Responds("T=18.0 H=40.0")),
    ]);
    let t = timeouts();

    let started = Instant::now();
    assert_eq!(h.manager.request_reading(KITCHEN).await, Err(Error::Timeout));
    let elapsed = started.elapsed();
    assert!(elapsed >= t.session + t.close);
    assert!(elapsed <= t.session + t.close + Duration::from_millis(200));
    assert_eq!(h.manager.phase(), Phase::Idle);
    assert_eq!(h.radio.commands().last(), Some(&Command::Close { conn: 1 }));

    let reading = h.manager.request_reading(BEDROOM).await.unwrap();
    assert_eq!(reading.humidity, Some(40.0));
}

#[tokio::test]
async fn refresh_keeps_previous_values_of_failed_sensors() {
    let h = harness(&[
        (KITCHEN, Peer::Silent),
        (BEDROOM, Peer::Responds("T=19.0 H=41.5")),
        (CELLAR, Peer::Refused),
    ]);
    h.manager.configure(vec![
        SensorIdentity::new(KITCHEN, "Kitchen"),
        SensorIdentity::new(BEDROOM, "Bedroom"),
        SensorIdentity::new(CELLAR, "Cellar"),
    ]);
    let store = Arc::clone(h.manager.store());
    store.set_temperature(0, 12.5).unwrap();
    store.set_humidity(0, 70.0).unwrap();
    store.set_humidity(1, 10.0).unwrap();
    store.set_temperature(2, 4.0).unwrap();

    assert_eq!(h.manager.refresh_all().await, 1);

    assert_eq!(
        store.reading(0),
        Some(Reading {
            temperature: Some(12.5),
            humidity: Some(70.0),
        })
    );
    assert_eq!(
        store.reading(1),
        Some(Reading {
            temperature: Some(19.0),
            humidity: Some(41.5),
        })
    );
    assert_eq!(store.temperature(2), Some(4.0));
    assert_eq!(store.humidity(2), None);
    assert_eq!(h.manager.phase(), Phase::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broadcasts_racing_reconfigure_stay_with_their_sensor() {
    let h = harness(&[]);
    let kitchen_only = vec![SensorIdentity::new(KITCHEN, "Kitchen")];
    let bedroom_only = vec![SensorIdentity::new(BEDROOM, "Bedroom")];
    let stop = Arc::new(AtomicBool::new(false));

    let broadcaster = {
        let manager = Arc::clone(&h.manager);
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            let data = frame(&[0x04, 0x10, 0x02, 0x0A, 0x00]);
            while !stop.load(Ordering::Relaxed) {
                let adv = broadcast(KITCHEN, None, Some(data.clone()));
                manager.handle_event(Event::Advertisement(adv));
            }
        })
    };

    for _ in 0..2000 {
        h.manager.configure(kitchen_only.clone());
        h.manager.configure(bedroom_only.clone());
        // Slot 0 now belongs to a sensor that never broadcasts
        assert_eq!(h.manager.store().temperature(0), None);
    }

    stop.store(true, Ordering::Relaxed);
    broadcaster.join().unwrap();
}
