// Queue peers only share a filesystem, so there is no OS level wakeup we can
// wait on across processes. Waiting is a bounded poll: try, then sleep on a
// condition variable for at most the poll interval. Writers in this process
// notify the condition variable after each commit so local readers wake at
// once, peers in other processes are seen on the next interval.
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Called with a short description on every poll boundary while waiting, so
/// long running processes can report liveness.
pub type Heartbeat = Box<dyn FnMut(&str) + Send>;

/// Cancels waits at their next poll boundary. Clones share the flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        return CancelToken::default();
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        return self.cancelled.load(Ordering::SeqCst);
    }
}

/// Change counter shared by every handle created from one queue.
#[derive(Debug, Default)]
pub struct Notifier {
    generation: Mutex<u64>,
    changed: Condvar,
}

impl Notifier {
    pub fn generation(&self) -> u64 {
        return *self.generation.lock().unwrap();
    }

    pub fn notify(&self) {
        let mut generation = self.generation.lock().unwrap();
        *generation += 1;
        self.changed.notify_all();
    }

    /// Sleep until the counter moves past `seen` or `timeout` elapses.
    pub fn wait(&self, seen: u64, timeout: Duration) {
        let generation = self.generation.lock().unwrap();
        let _ = self
            .changed
            .wait_timeout_while(generation, timeout, |g| *g == seen)
            .unwrap();
    }
}

#[derive(Clone, Debug)]
pub struct PollSettings {
    pub interval: Duration,
    /// `None` waits until cancelled.
    pub timeout: Option<Duration>,
    pub cancel: Option<CancelToken>,
}

impl PollSettings {
    pub fn new(interval: Duration) -> PollSettings {
        return PollSettings {
            interval,
            timeout: None,
            cancel: None,
        };
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> PollSettings {
        self.timeout = timeout;
        return self;
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> PollSettings {
        self.cancel = Some(cancel);
        return self;
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Wait<T> {
    Ready(T),
    TimedOut,
}

/// Run `attempt` until it yields a value, the timeout passes, or the wait is
/// cancelled (`Error::Cancelled`). `attempt` always runs at least once.
pub fn poll_until<T>(
    notifier: &Notifier,
    settings: &PollSettings,
    mut heartbeat: Option<&mut Heartbeat>,
    label: &str,
    mut attempt: impl FnMut() -> Result<Option<T>>,
) -> Result<Wait<T>> {
    // a timeout too large to represent waits forever
    let deadline = settings.timeout.and_then(|t| Instant::now().checked_add(t));
    loop {
        // read before trying so a notify between the attempt and the wait
        // is not lost
        let seen = notifier.generation();
        if let Some(value) = attempt()? {
            return Ok(Wait::Ready(value));
        }

        if let Some(cancel) = &settings.cancel {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
        }

        let mut sleep = settings.interval;
        if let Some(deadline) = deadline {
            let now = Instant::now();
            if now >= deadline {
                return Ok(Wait::TimedOut);
            }
            sleep = sleep.min(deadline - now);
        }

        if let Some(beat) = heartbeat.as_mut() {
            beat(label);
        }
        notifier.wait(seen, sleep);
    }
}
