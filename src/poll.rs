use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Token reserved for the reactor wakeup primitive.
pub const WAKER_TOKEN: Token = Token(0);

/// Thin wrapper over the readiness multiplexer.
///
/// Owns the mio Poll and the Waker used by worker threads to interrupt a
/// blocking poll. All registration goes through here so the reactor thread is
/// the only place that touches interest sets.
pub struct PollHandle {
    poll: Poll,
    waker: Arc<Waker>,
}

impl PollHandle {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok(PollHandle { poll, waker })
    }

    pub fn register<S>(&self, src: &mut S, token: Token, interest: Interest) -> io::Result<()>
    where
        S: mio::event::Source + ?Sized,
    {
        src.register(self.poll.registry(), token, interest)
    }

    pub fn reregister<S>(&self, src: &mut S, token: Token, interest: Interest) -> io::Result<()>
    where
        S: mio::event::Source + ?Sized,
    {
        src.reregister(self.poll.registry(), token, interest)
    }

    pub fn deregister<S>(&self, src: &mut S) -> io::Result<()>
    where
        S: mio::event::Source + ?Sized,
    {
        src.deregister(self.poll.registry())
    }

    pub fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        self.poll.poll(events, timeout)
    }

    /// Cloneable handle for waking the reactor from other threads.
    pub fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_times_out() {
        let mut handle = PollHandle::new().unwrap();
        let mut events = Events::with_capacity(8);
        handle
            .poll(&mut events, Some(Duration::from_millis(10)))
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_wake_delivers_waker_token() {
        let mut handle = PollHandle::new().unwrap();
        let waker = handle.waker();
        waker.wake().unwrap();

        let mut events = Events::with_capacity(8);
        handle
            .poll(&mut events, Some(Duration::from_secs(1)))
            .unwrap();
        let tokens: Vec<Token> = events.iter().map(|e| e.token()).collect();
        assert_eq!(tokens, vec![WAKER_TOKEN]);
    }
}
