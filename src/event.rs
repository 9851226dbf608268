use mio::{event::Event, Token};
use std::fmt;

/// Snapshot of one readiness event.
///
/// The reactor copies the polled events into these before dispatching, so the
/// dispatch loop can borrow the selector mutably while iterating.
pub struct ReadyEvent {
    token: Token,
    is_readable: bool,
    is_writable: bool,
}

impl fmt::Debug for ReadyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadyEvent")
            .field("token", &self.token)
            .field("is_readable", &self.is_readable)
            .field("is_writable", &self.is_writable)
            .finish()
    }
}

impl ReadyEvent {
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_readable(&self) -> bool {
        self.is_readable
    }

    pub fn is_writable(&self) -> bool {
        self.is_writable
    }
}

impl From<&Event> for ReadyEvent {
    fn from(event: &Event) -> Self {
        Self {
            token: event.token(),
            is_readable: event.is_readable(),
            is_writable: event.is_writable(),
        }
    }
}
