pub mod decoder;
pub mod manager;
pub mod radio;
#[cfg(feature = "bluez")]
pub mod scanner;
pub mod session;
pub mod store;

pub use decoder::{decode, Decoded};
pub use manager::{SessionManager, Timeouts, MAX_SCAN_RESULTS};
pub use radio::RadioStack;
#[cfg(feature = "bluez")]
pub use scanner::BluezRadio;
pub use session::{Advertisement, Command, ConnHandle, Event, Outcome, Phase, Session};
pub use store::ResultStore;
