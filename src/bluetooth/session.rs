/// Session state machine for the single in-flight radio operation
///
/// The machine is a pure function of `(Session, Event)`. It never touches the
/// radio itself; it returns the commands the caller must issue and, when the
/// operation reached a result, the outcome to hand to the waiting request.
use log::debug;
use tokio::time::Instant;

use crate::error::Error;
use crate::models::{BdAddr, Reading};

/// Connection handle assigned by the radio stack when a link opens.
pub type ConnHandle = u16;

/// Client configuration descriptor of the sensor's response characteristic.
pub const NOTIFY_CCCD_HANDLE: u16 = 0x0010;
/// Descriptor value that enables notifications.
pub const ENABLE_NOTIFY: [u8; 2] = [0x01, 0x00];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Opening,
    Writing,
    AwaitingNotify,
    Closing,
    ScanParamSet,
    Scanning,
}

/// One broadcast as reported by the radio stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub address: BdAddr,
    pub name: Option<String>,
    /// Service data including the leading 2-byte service tag.
    pub service_data: Option<Vec<u8>>,
}

/// Inputs to the state machine: requests from the manager and radio events.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    OpenRequest { address: BdAddr, deadline: Instant },
    ScanRequest { deadline: Instant },
    OpenSucceeded { address: BdAddr, conn: ConnHandle },
    OpenFailed { address: BdAddr },
    WriteSucceeded { conn: ConnHandle },
    WriteFailed { conn: ConnHandle },
    Notification { conn: ConnHandle, value: Vec<u8> },
    CloseCompleted { conn: ConnHandle },
    ScanParamsSet,
    ScanFailed,
    Advertisement(Advertisement),
    ScanComplete,
    /// Deadline passed: tear down whatever is in flight.
    Abort,
    /// Teardown confirmation never came: drop the session regardless.
    ForceIdle,
}

/// Side effects for the radio stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect(BdAddr),
    CancelConnect(BdAddr),
    Write {
        conn: ConnHandle,
        handle: u16,
        value: Vec<u8>,
    },
    Close { conn: ConnHandle },
    SetScanParams,
    StartScan,
    StopScan,
}

impl Command {
    /// The event that stands in for the stack's answer when it refuses the command outright.
    pub fn rejection(&self) -> Option<Event> {
        match self {
            Command::Connect(address) => Some(Event::OpenFailed { address: *address }),
            Command::Write { conn, .. } => Some(Event::WriteFailed { conn: *conn }),
            Command::Close { conn } => Some(Event::CloseCompleted { conn: *conn }),
            Command::SetScanParams | Command::StartScan => Some(Event::ScanFailed),
            Command::CancelConnect(_) | Command::StopScan => None,
        }
    }
}

/// Terminal result of a request, delivered to the waiting caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Reading(Reading),
    ScanFinished,
    Failed(Error),
}

/// Everything a transition asks of its caller.
#[derive(Debug, Default, PartialEq)]
pub struct Step {
    pub commands: Vec<Command>,
    pub outcome: Option<Outcome>,
}

impl Step {
    fn command(command: Command) -> Self {
        Step {
            commands: vec![command],
            outcome: None,
        }
    }

    fn outcome(outcome: Outcome) -> Self {
        Step {
            commands: Vec::new(),
            outcome: Some(outcome),
        }
    }

    fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    phase: Phase,
    target: Option<BdAddr>,
    conn: Option<ConnHandle>,
    deadline: Option<Instant>,
}

impl Default for Session {
    fn default() -> Self {
        Session::idle()
    }
}

impl Session {
    pub const fn idle() -> Self {
        Session {
            phase: Phase::Idle,
            target: None,
            conn: None,
            deadline: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn target(&self) -> Option<BdAddr> {
        self.target
    }

    pub fn conn(&self) -> Option<ConnHandle> {
        self.conn
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_idle(&self) -> bool {
        self.phase == Phase::Idle
    }

    fn owns(&self, conn: ConnHandle) -> bool {
        self.conn == Some(conn)
    }

    fn enter(self, phase: Phase) -> Self {
        Session { phase, ..self }
    }
}

/// Advance the session by one event.
pub fn transition(session: Session, event: Event) -> (Session, Step) {
    use Phase::*;

    match (session.phase, event) {
        (Idle, Event::OpenRequest { address, deadline }) => (
            Session {
                phase: Opening,
                target: Some(address),
                conn: None,
                deadline: Some(deadline),
            },
            Step::command(Command::Connect(address)),
        ),
        (Idle, Event::ScanRequest { deadline }) => (
            Session {
                phase: ScanParamSet,
                target: None,
                conn: None,
                deadline: Some(deadline),
            },
            Step::command(Command::SetScanParams),
        ),

        (Opening, Event::OpenSucceeded { address, conn }) if session.target == Some(address) => {
            let session = Session {
                conn: Some(conn),
                ..session.enter(Writing)
            };
            let write = Command::Write {
                conn,
                handle: NOTIFY_CCCD_HANDLE,
                value: ENABLE_NOTIFY.to_vec(),
            };
            (session, Step::command(write))
        }
        (_, Event::OpenSucceeded { address, conn }) => {
            // A link nobody is waiting for, e.g. from an aborted session
            debug!("Closing unsolicited connection {} to {}", conn, address);
            (session, Step::command(Command::Close { conn }))
        }
        (Opening, Event::OpenFailed { address }) if session.target == Some(address) => {
            (Session::idle(), Step::outcome(Outcome::Failed(Error::OpenFailed)))
        }

        (Writing, Event::WriteSucceeded { conn }) if session.owns(conn) => {
            (session.enter(AwaitingNotify), Step::default())
        }
        (Writing, Event::WriteFailed { conn }) if session.owns(conn) => {
            let step = Step::command(Command::Close { conn })
                .with_outcome(Outcome::Failed(Error::WriteFailed));
            (session.enter(Closing), step)
        }

        (AwaitingNotify, Event::Notification { conn, value }) if session.owns(conn) => {
            let outcome = match parse_response(&value) {
                Ok(reading) => Outcome::Reading(reading),
                Err(e) => Outcome::Failed(e),
            };
            (
                session.enter(Closing),
                Step::command(Command::Close { conn }).with_outcome(outcome),
            )
        }

        (phase, Event::CloseCompleted { conn }) if session.owns(conn) => {
            let step = match phase {
                Writing | AwaitingNotify => Step::outcome(Outcome::Failed(Error::Disconnected)),
                _ => Step::default(),
            };
            (Session::idle(), step)
        }

        (ScanParamSet, Event::ScanParamsSet) => {
            (session.enter(Scanning), Step::command(Command::StartScan))
        }
        (ScanParamSet | Scanning, Event::ScanFailed) => {
            (Session::idle(), Step::outcome(Outcome::Failed(Error::ScanFailed)))
        }
        (Scanning, Event::ScanComplete) => (Session::idle(), Step::outcome(Outcome::ScanFinished)),

        (Opening, Event::Abort) => {
            let step = session
                .target
                .map(|address| Step::command(Command::CancelConnect(address)))
                .unwrap_or_default();
            (Session::idle(), step)
        }
        (Writing | AwaitingNotify, Event::Abort) => match session.conn {
            Some(conn) => (session.enter(Closing), Step::command(Command::Close { conn })),
            None => (Session::idle(), Step::default()),
        },
        (ScanParamSet, Event::Abort) => (Session::idle(), Step::default()),
        (Scanning, Event::Abort) => (
            Session::idle(),
            Step::command(Command::StopScan).with_outcome(Outcome::ScanFinished),
        ),

        (_, Event::ForceIdle) => (Session::idle(), Step::default()),

        // Stale handles, out-of-phase confirmations and broadcasts change nothing
        (_, _) => (session, Step::default()),
    }
}

/// Parse the sensor's notification text, `T=<decimal> H=<decimal>`.
///
/// Sensors pad the value with a trailing NUL; anything else around the two
/// fields makes the response malformed.
pub fn parse_response(value: &[u8]) -> Result<Reading, Error> {
    let text = std::str::from_utf8(value).map_err(|_| Error::Malformed)?;
    let text = text.trim_end_matches('\0');

    let (t, h) = text
        .strip_prefix("T=")
        .and_then(|rest| rest.split_once(" H="))
        .ok_or(Error::Malformed)?;
    let temperature: f32 = t.parse().map_err(|_| Error::Malformed)?;
    let humidity: f32 = h.parse().map_err(|_| Error::Malformed)?;
    if !temperature.is_finite() || !humidity.is_finite() {
        return Err(Error::Malformed);
    }

    Ok(Reading {
        temperature: Some(temperature),
        humidity: Some(humidity),
    })
}
