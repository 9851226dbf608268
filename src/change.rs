use mio::{Interest, Token, Waker};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// A state mutation requested of the reactor.
///
/// Worker threads never touch selector-owned state directly; they post one of
/// these and wake the reactor, which applies it at the top of the next loop
/// iteration. A request targeting an already-closed channel is skipped at
/// dispatch time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Replace the channel's interest set, if its registration is still live
    InterestOps(Interest),
    /// A delegated TLS task finished; refresh the result and resume the handshake
    TaskComplete,
    /// A handshake-inactivity timeout fired; close the channel
    TimeoutExpired,
    /// The TLS session was invalidated; re-initiate handshaking
    SessionInvalidated,
    /// Close the channel (reassembly cap exceeded or explicit request)
    Close,
}

#[derive(Debug, Clone, Copy)]
pub struct ChangeRequest {
    pub token: Token,
    pub kind: ChangeKind,
}

impl ChangeRequest {
    pub fn new(token: Token, kind: ChangeKind) -> Self {
        ChangeRequest { token, kind }
    }
}

/// FIFO of pending changes, shared between the reactor and all producers.
///
/// Pushes wake the reactor. Only the reactor pops, one entry at a time, so no
/// lock is held while a change is dispatched.
pub struct ChangeQueue {
    changes: Mutex<VecDeque<ChangeRequest>>,
    waker: Arc<Waker>,
}

impl ChangeQueue {
    pub fn new(waker: Arc<Waker>) -> Self {
        ChangeQueue {
            changes: Mutex::new(VecDeque::new()),
            waker,
        }
    }

    pub fn push(&self, change: ChangeRequest) {
        self.changes.lock().unwrap().push_back(change);
        let _ = self.waker.wake();
    }

    pub fn pop(&self) -> Option<ChangeRequest> {
        self.changes.lock().unwrap().pop_front()
    }

    pub fn clear(&self) {
        self.changes.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.changes.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::PollHandle;

    fn queue() -> ChangeQueue {
        let handle = PollHandle::new().unwrap();
        ChangeQueue::new(handle.waker())
    }

    #[test]
    fn test_fifo_order() {
        let q = queue();
        q.push(ChangeRequest::new(Token(1), ChangeKind::TaskComplete));
        q.push(ChangeRequest::new(Token(2), ChangeKind::TimeoutExpired));
        q.push(ChangeRequest::new(
            Token(3),
            ChangeKind::InterestOps(Interest::READABLE),
        ));

        assert_eq!(q.len(), 3);
        assert_eq!(q.pop().unwrap().token, Token(1));
        assert_eq!(q.pop().unwrap().token, Token(2));
        assert_eq!(q.pop().unwrap().token, Token(3));
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_clear() {
        let q = queue();
        q.push(ChangeRequest::new(Token(1), ChangeKind::Close));
        q.push(ChangeRequest::new(Token(2), ChangeKind::Close));
        q.clear();
        assert!(q.is_empty());
    }
}
