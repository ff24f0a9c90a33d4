//! Concurrency capability set shared by receivers, dispatch loops and
//! channels.
//!
//! Every blocking primitive the fabric needs lives behind this module:
//! named thread spawning, a settable event with timed wait, and the wake
//! interval used by blocked receivers so shutdown can interrupt them.
//! Queues are `crossbeam_channel` senders/receivers, used directly.

use std::io;
use std::sync::{Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use thiserror::Error;

/// How often a blocked wait re-checks its condition, so that a channel
/// closing under a waiter unblocks it promptly.
pub const WAKE_INTERVAL: Duration = Duration::from_millis(250);

/// The error text attached to a CHANNEL_EXEC that was refused because the
/// peer runs the main-thread-only model and is already busy.
pub const MAIN_THREAD_ONLY_DEADLOCK: &str =
    "main-thread-only execution model: a second concurrent remote_exec would deadlock";

/// The concurrency backend of a gateway's dispatch side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecModel {
    /// Preemptive OS threads; one per execution request. The default.
    Threaded,
    /// All execution requests run one at a time on the serving thread.
    /// Needed when remote code uses libraries that refuse to run off the
    /// main thread. Concurrent requests fail fast instead of deadlocking.
    MainThreadOnly,
}

/// A backend name that this implementation does not provide.
#[derive(Debug, Error)]
#[error("unknown execmodel {0:?} (supported: threaded, main-thread-only)")]
pub struct UnknownExecModel(pub String);

impl ExecModel {
    /// Resolve a backend by its spec name.
    pub fn from_name(name: &str) -> Result<ExecModel, UnknownExecModel> {
        match name {
            "threaded" => Ok(ExecModel::Threaded),
            "main-thread-only" | "main_thread_only" => Ok(ExecModel::MainThreadOnly),
            other => Err(UnknownExecModel(other.to_owned())),
        }
    }

    /// The spec name of this backend.
    pub fn name(self) -> &'static str {
        match self {
            ExecModel::Threaded => "threaded",
            ExecModel::MainThreadOnly => "main-thread-only",
        }
    }
}

impl Default for ExecModel {
    fn default() -> ExecModel {
        ExecModel::Threaded
    }
}

/// Spawn a named OS thread.
pub fn spawn_named<F>(name: &str, body: F) -> io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new().name(name.to_owned()).spawn(body)
}

/// A one-shot flag another task can wait for, with timeout.
#[derive(Debug, Default)]
pub struct Event {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    /// Make an unset event.
    pub fn new() -> Event {
        Event::default()
    }

    /// Set the flag and wake all waiters.
    pub fn set(&self) {
        let mut flag = self.flag.lock().expect("Cannot lock Event");
        *flag = true;
        self.cond.notify_all();
    }

    /// Whether the flag has been set.
    pub fn is_set(&self) -> bool {
        *self.flag.lock().expect("Cannot lock Event")
    }

    /// Wait for the flag. Returns `false` on timeout; `None` waits forever.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut flag = self.flag.lock().expect("Cannot lock Event");
        while !*flag {
            let step = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    (deadline - now).min(WAKE_INTERVAL)
                }
                None => WAKE_INTERVAL,
            };
            let (guard, _) = self
                .cond
                .wait_timeout(flag, step)
                .expect("Cannot wait on Event");
            flag = guard;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_name_resolves_known_backends() {
        assert_eq!(ExecModel::from_name("threaded").unwrap(), ExecModel::Threaded);
        assert_eq!(
            ExecModel::from_name("main-thread-only").unwrap(),
            ExecModel::MainThreadOnly
        );
        assert!(ExecModel::from_name("gevent").is_err());
    }

    #[test]
    fn event_wait_times_out_and_wakes() {
        let event = std::sync::Arc::new(Event::new());
        assert!(!event.wait(Some(Duration::from_millis(10))));

        let setter = event.clone();
        let handle = spawn_named("setter", move || {
            std::thread::sleep(Duration::from_millis(50));
            setter.set();
        })
        .unwrap();
        assert!(event.wait(Some(Duration::from_secs(5))));
        assert!(event.is_set());
        handle.join().unwrap();
    }
}
