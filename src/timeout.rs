use log::{debug, info, trace};
use mio::Token;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Receives expiration callbacks from the timeout worker.
///
/// Implemented by the selector handle, which routes the expiry back to the
/// reactor as a change request.
pub trait TimeoutListener: Send + Sync {
    fn timeout_expired(&self, token: Token);
}

/// A one-shot inactivity timeout bound to a channel.
///
/// Each secure channel pre-allocates one of these and re-arms it through the
/// worker. The fired flag is the short-circuit that keeps a timeout cancelled
/// between min-selection and expiry from firing.
pub struct Timeout {
    token: Token,
    period: Duration,
    fired: AtomicBool,
}

impl Timeout {
    pub fn new(token: Token, period: Duration) -> Self {
        Timeout {
            token,
            period,
            fired: AtomicBool::new(false),
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    fn mark_fired(&self) {
        self.fired.store(true, Ordering::Release);
    }

    fn reset(&self) {
        self.fired.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
struct Entry {
    deadline: Instant,
    timeout: Arc<Timeout>,
}

/// Set-with-min container over live timeouts.
///
/// Membership is by timeout identity, ordering by raw deadline. Insert and
/// remove are O(n), min is O(1) via the cached minimum.
struct MinSet {
    entries: Vec<Entry>,
    min: Option<Entry>,
}

impl MinSet {
    fn new() -> Self {
        MinSet {
            entries: Vec::new(),
            min: None,
        }
    }

    /// Returns false if the timeout is already armed; the original deadline
    /// is kept in that case.
    fn add(&mut self, timeout: Arc<Timeout>, deadline: Instant) -> bool {
        if self.contains(&timeout) {
            return false;
        }
        let entry = Entry { deadline, timeout };
        match &self.min {
            None => self.min = Some(entry.clone()),
            Some(min) if entry.deadline < min.deadline => self.min = Some(entry.clone()),
            Some(_) => {}
        }
        self.entries.push(entry);
        true
    }

    fn contains(&self, timeout: &Arc<Timeout>) -> bool {
        self.entries
            .iter()
            .any(|e| Arc::ptr_eq(&e.timeout, timeout))
    }

    fn remove(&mut self, timeout: &Arc<Timeout>) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| !Arc::ptr_eq(&e.timeout, timeout));
        let removed = self.entries.len() < before;
        if removed {
            if let Some(min) = &self.min {
                if Arc::ptr_eq(&min.timeout, timeout) {
                    self.min = self
                        .entries
                        .iter()
                        .min_by_key(|e| e.deadline)
                        .cloned();
                }
            }
        }
        removed
    }

    fn min(&self) -> Option<Entry> {
        self.min.clone()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.min = None;
    }
}

struct WorkerState {
    set: MinSet,
    running: bool,
    inserted: u64,
    expired: u64,
    cancelled: u64,
}

/// Ordered deadline scheduler.
///
/// A single worker thread waits on the nearest-expiring deadline among all
/// armed timeouts. Insert and cancel are thread-safe and wake the worker so
/// it can recompute its wait.
pub struct TimeoutWorker {
    state: Mutex<WorkerState>,
    cond: Condvar,
    listener: Arc<dyn TimeoutListener>,
}

impl TimeoutWorker {
    pub fn new(listener: Arc<dyn TimeoutListener>) -> Self {
        TimeoutWorker {
            state: Mutex::new(WorkerState {
                set: MinSet::new(),
                running: false,
                inserted: 0,
                expired: 0,
                cancelled: 0,
            }),
            cond: Condvar::new(),
            listener,
        }
    }

    /// Arm a timeout at now + period. Re-arming an already armed timeout
    /// keeps the original deadline.
    pub fn insert(&self, timeout: Arc<Timeout>) {
        let deadline = Instant::now() + timeout.period();
        let mut state = self.state.lock().unwrap();
        timeout.reset();
        if state.set.add(timeout, deadline) {
            state.inserted += 1;
        }
        self.cond.notify_one();
    }

    pub fn cancel(&self, timeout: &Arc<Timeout>) {
        let mut state = self.state.lock().unwrap();
        if state.set.is_empty() {
            return;
        }
        if state.set.remove(timeout) {
            state.cancelled += 1;
        } else {
            trace!("trying to cancel an already removed timeout");
        }
        self.cond.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        state.running = false;
        self.cond.notify_one();
    }

    pub fn run(&self) {
        debug!("timeout worker initializing");
        let mut state = self.state.lock().unwrap();
        state.running = true;

        'run: while state.running {
            while state.set.is_empty() {
                if !state.running {
                    break 'run;
                }
                state = self.cond.wait(state).unwrap();
            }

            let now = Instant::now();
            let mut due: Vec<Arc<Timeout>> = Vec::new();
            let wait = loop {
                match state.set.min() {
                    None => break None,
                    Some(entry) if entry.deadline <= now => {
                        entry.timeout.mark_fired();
                        state.set.remove(&entry.timeout);
                        state.expired += 1;
                        due.push(entry.timeout);
                    }
                    Some(entry) => break Some(entry.deadline - now),
                }
            };

            if !due.is_empty() {
                // fire outside the lock; an expiry that has begun completes
                drop(state);
                for timeout in due {
                    trace!("timeout expired for {:?}", timeout.token());
                    self.listener.timeout_expired(timeout.token());
                }
                state = self.state.lock().unwrap();
                continue;
            }

            if let Some(wait) = wait {
                let (guard, _) = self.cond.wait_timeout(state, wait).unwrap();
                state = guard;
            }
        }

        info!(
            "timeout worker shutting down: {} inserted, {} expired, {} cancelled",
            state.inserted, state.expired, state.cancelled
        );
        state.set.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    struct Recorder {
        fired: Mutex<Vec<Token>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Recorder {
                fired: Mutex::new(Vec::new()),
            })
        }

        fn tokens(&self) -> Vec<Token> {
            self.fired.lock().unwrap().clone()
        }
    }

    impl TimeoutListener for Recorder {
        fn timeout_expired(&self, token: Token) {
            self.fired.lock().unwrap().push(token);
        }
    }

    fn spawn_worker(listener: Arc<Recorder>) -> (Arc<TimeoutWorker>, thread::JoinHandle<()>) {
        let worker = Arc::new(TimeoutWorker::new(listener));
        let runner = worker.clone();
        let handle = thread::spawn(move || runner.run());
        while !worker.is_running() {
            thread::sleep(Duration::from_millis(1));
        }
        (worker, handle)
    }

    #[test]
    fn test_fires_in_deadline_order() {
        let recorder = Recorder::new();
        let (worker, handle) = spawn_worker(recorder.clone());

        let slow = Arc::new(Timeout::new(Token(2), Duration::from_millis(80)));
        let fast = Arc::new(Timeout::new(Token(1), Duration::from_millis(20)));
        worker.insert(slow);
        worker.insert(fast);

        thread::sleep(Duration::from_millis(200));
        assert_eq!(recorder.tokens(), vec![Token(1), Token(2)]);

        worker.stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_cancel_prevents_firing() {
        let recorder = Recorder::new();
        let (worker, handle) = spawn_worker(recorder.clone());

        let timeout = Arc::new(Timeout::new(Token(7), Duration::from_millis(60)));
        worker.insert(timeout.clone());
        worker.cancel(&timeout);

        thread::sleep(Duration::from_millis(150));
        assert!(recorder.tokens().is_empty());
        assert!(!timeout.has_fired());

        worker.stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_rearm_after_cancel() {
        let recorder = Recorder::new();
        let (worker, handle) = spawn_worker(recorder.clone());

        let timeout = Arc::new(Timeout::new(Token(3), Duration::from_millis(30)));
        worker.insert(timeout.clone());
        worker.cancel(&timeout);
        worker.insert(timeout.clone());

        thread::sleep(Duration::from_millis(120));
        assert_eq!(recorder.tokens(), vec![Token(3)]);
        assert!(timeout.has_fired());

        worker.stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_double_insert_fires_once() {
        let recorder = Recorder::new();
        let (worker, handle) = spawn_worker(recorder.clone());

        let timeout = Arc::new(Timeout::new(Token(9), Duration::from_millis(25)));
        worker.insert(timeout.clone());
        worker.insert(timeout.clone());

        thread::sleep(Duration::from_millis(100));
        assert_eq!(recorder.tokens(), vec![Token(9)]);

        worker.stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_min_set_tracks_minimum() {
        let mut set = MinSet::new();
        let now = Instant::now();
        let a = Arc::new(Timeout::new(Token(1), Duration::from_secs(1)));
        let b = Arc::new(Timeout::new(Token(2), Duration::from_secs(1)));
        let c = Arc::new(Timeout::new(Token(3), Duration::from_secs(1)));

        set.add(a.clone(), now + Duration::from_millis(300));
        set.add(b.clone(), now + Duration::from_millis(100));
        set.add(c.clone(), now + Duration::from_millis(200));
        assert!(Arc::ptr_eq(&set.min().unwrap().timeout, &b));

        set.remove(&b);
        assert!(Arc::ptr_eq(&set.min().unwrap().timeout, &c));

        set.remove(&c);
        set.remove(&a);
        assert!(set.min().is_none());
        assert!(set.is_empty());
    }
}
