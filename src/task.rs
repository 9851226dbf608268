use crate::channel::engine::TlsEngine;
use log::debug;
use mio::Token;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

/// Receives completion callbacks from the delegated-task worker.
///
/// Implemented by the selector handle, which routes the completion back to
/// the reactor as a change request.
pub trait TaskListener: Send + Sync {
    fn task_complete(&self, token: Token);
}

/// A unit of delegated TLS work: the channel's engine plus its token.
///
/// The engine mutex is never contended in practice; the channel's
/// task_pending flag keeps the reactor from touching the engine while a
/// handle for it sits in this queue.
pub struct TaskHandle {
    token: Token,
    engine: Arc<Mutex<TlsEngine>>,
}

impl TaskHandle {
    pub(crate) fn new(token: Token, engine: Arc<Mutex<TlsEngine>>) -> Self {
        TaskHandle { token, engine }
    }
}

struct TaskState {
    queue: VecDeque<TaskHandle>,
    running: bool,
}

/// Runs delegated cryptographic tasks off the reactor thread.
///
/// One channel is queued at most once concurrently; completion is reported
/// through the listener, which re-enters the handshake on the reactor.
pub struct TaskWorker {
    state: Mutex<TaskState>,
    cond: Condvar,
    listener: Arc<dyn TaskListener>,
}

impl TaskWorker {
    pub fn new(listener: Arc<dyn TaskListener>) -> Self {
        TaskWorker {
            state: Mutex::new(TaskState {
                queue: VecDeque::new(),
                running: false,
            }),
            cond: Condvar::new(),
            listener,
        }
    }

    pub fn add(&self, handle: TaskHandle) {
        let mut state = self.state.lock().unwrap();
        state.queue.push_back(handle);
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
        debug!("task worker initializing");
        let mut state = self.state.lock().unwrap();
        state.running = true;

        'run: while state.running {
            while state.queue.is_empty() {
                if !state.running {
                    break 'run;
                }
                state = self.cond.wait(state).unwrap();
            }
            let handle = state.queue.pop_front().unwrap();
            drop(state);

            handle.engine.lock().unwrap().run_delegated_tasks();
            self.listener.task_complete(handle.token);

            state = self.state.lock().unwrap();
        }

        debug!("task worker shutting down");
        state.queue.clear();
    }
}
