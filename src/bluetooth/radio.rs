//! Boundary between the session manager and the radio stack.

use std::sync::Arc;

use crate::bluetooth::session::Command;
use crate::error::Result;

/// A radio stack that accepts commands without blocking.
///
/// Results come back later as [`Event`](crate::bluetooth::session::Event)s
/// on whatever channel the implementation was built with. An `Err` means the
/// stack refused the command outright and no event will follow.
pub trait RadioStack: Send + Sync {
    fn execute(&self, command: Command) -> Result<()>;
}

impl<R: RadioStack + ?Sized> RadioStack for Arc<R> {
    fn execute(&self, command: Command) -> Result<()> {
        (**self).execute(command)
    }
}
