//! Registry of running droid processes, so `/stop` and `/queue skip` can find
//! them.
//!
//! Direct runs and queue runs use separate keys. A second run under the same
//! key overwrites the first registration; `stop` always targets the most
//! recent one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

use crate::session::UserId;
use crate::sink::MessageRef;

/// Which logical run a process belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RunKey {
    /// A run started by a user's direct message.
    Direct(UserId),
    /// The task queue's in-flight item.
    Queue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NothingToStop,
}

#[derive(Debug)]
struct RunningProcess {
    ticket: u64,
    pid: Option<u32>,
    status: Option<MessageRef>,
    cancel: Arc<Notify>,
}

#[derive(Default)]
pub struct ProcessRegistry {
    running: Mutex<HashMap<RunKey, RunningProcess>>,
    next_ticket: AtomicU64,
}

/// Live registration. Dropping it removes the entry unless a newer run has
/// replaced it, so runs abandoned by a caller timeout clean up after
/// themselves.
pub struct Registration {
    registry: Arc<ProcessRegistry>,
    key: RunKey,
    ticket: u64,
    cancel: Arc<Notify>,
}

impl Registration {
    /// Resolves once `stop` was called for this run.
    pub async fn cancelled(&self) {
        self.cancel.notified().await;
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(self.key, self.ticket);
    }
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RunKey, RunningProcess>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a running process under `key`, replacing any earlier one.
    pub fn register(self: &Arc<Self>, key: RunKey, pid: Option<u32>, status: Option<MessageRef>) -> Registration {
        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        let cancel = Arc::new(Notify::new());
        let previous = self.lock().insert(
            key,
            RunningProcess {
                ticket,
                pid,
                status,
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = previous {
            tracing::warn!(
                "Run {:?} replaced registration of pid {:?}; stop now targets the newer process",
                key,
                previous.pid
            );
        }
        Registration {
            registry: Arc::clone(self),
            key,
            ticket,
            cancel,
        }
    }

    fn unregister(&self, key: RunKey, ticket: u64) {
        let mut running = self.lock();
        if running.get(&key).is_some_and(|p| p.ticket == ticket) {
            running.remove(&key);
        }
    }

    /// Ask the process registered under `key` to terminate.
    pub fn stop(&self, key: RunKey) -> StopOutcome {
        let Some(process) = self.lock().remove(&key) else {
            return StopOutcome::NothingToStop;
        };
        tracing::info!("Stopping {:?} (pid {:?})", key, process.pid);
        // notify_one stores a permit, so a stop issued before the bridge
        // starts waiting is not lost.
        process.cancel.notify_one();
        StopOutcome::Stopped
    }

    pub fn is_running(&self, key: RunKey) -> bool {
        self.lock().contains_key(&key)
    }

    /// Status message of the run registered under `key`.
    pub fn status_message(&self, key: RunKey) -> Option<MessageRef> {
        self.lock().get(&key).and_then(|p| p.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn stop_without_process_is_nothing_to_stop() {
        let registry = ProcessRegistry::new();
        assert_eq!(registry.stop(RunKey::Direct(1)), StopOutcome::NothingToStop);
    }

    #[tokio::test]
    async fn stop_signals_the_registered_run() {
        let registry = Arc::new(ProcessRegistry::new());
        let registration = registry.register(RunKey::Direct(1), Some(42), None);

        assert_eq!(registry.stop(RunKey::Direct(1)), StopOutcome::Stopped);
        tokio::time::timeout(Duration::from_secs(1), registration.cancelled())
            .await
            .expect("cancel was signalled");
        assert!(!registry.is_running(RunKey::Direct(1)));
    }

    #[test]
    fn direct_and_queue_keys_are_independent() {
        let registry = Arc::new(ProcessRegistry::new());
        let _queue = registry.register(RunKey::Queue, Some(7), None);

        assert_eq!(registry.stop(RunKey::Direct(1)), StopOutcome::NothingToStop);
        assert!(registry.is_running(RunKey::Queue));
    }

    #[test]
    fn dropping_a_stale_registration_keeps_the_newer_run() {
        let registry = Arc::new(ProcessRegistry::new());
        let status = MessageRef::new(1, 2);
        let first = registry.register(RunKey::Direct(1), Some(1), None);
        let second = registry.register(RunKey::Direct(1), Some(2), Some(status));

        drop(first);
        assert_eq!(registry.status_message(RunKey::Direct(1)), Some(status));

        drop(second);
        assert!(!registry.is_running(RunKey::Direct(1)));
    }
}
