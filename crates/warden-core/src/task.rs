//! Task identity and trust status.
//!
//! The engine models the calling process as a [`TaskState`]: its pid and
//! command name, the credential set that feeds COE capture, the task
//! identity digest derived from its executable, and the trust flags that
//! modeling outcomes are reported through.
//!
//! Synchronous export parks the caller on its own task state until an
//! external agent resolves its trust status. Delivery of a fatal signal
//! wakes the caller and forces it untrusted, so killing a trust-pending
//! process can never launder it into a trusted state.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};

use crate::digest::Digest;
use crate::errors::EngineError;

/// Maximum command-name length retained per task, mirroring the kernel's
/// fixed-width task comm.
pub const TASK_COMM_LEN: usize = 16;

/// Raw credential set of a task: the eight user/group ids plus the
/// effective capability mask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Credentials {
    /// Real user id.
    pub uid: u32,
    /// Effective user id.
    pub euid: u32,
    /// Saved user id.
    pub suid: u32,
    /// Real group id.
    pub gid: u32,
    /// Effective group id.
    pub egid: u32,
    /// Saved group id.
    pub sgid: u32,
    /// Filesystem user id.
    pub fsuid: u32,
    /// Filesystem group id.
    pub fsgid: u32,
    /// Effective capability mask.
    pub cap_effective: u64,
}

impl Credentials {
    /// Credentials with all ids set to `id` and an empty capability mask.
    #[must_use]
    pub const fn uniform(id: u32) -> Self {
        Self {
            uid: id,
            euid: id,
            suid: id,
            gid: id,
            egid: id,
            sgid: id,
            fsuid: id,
            fsgid: id,
            cap_effective: 0,
        }
    }
}

/// Translates raw ids into the id space a domain has chosen to describe
/// events in.
pub trait UserNamespace: Send + Sync {
    /// Maps a user id.
    fn map_uid(&self, uid: u32) -> u32;
    /// Maps a group id.
    fn map_gid(&self, gid: u32) -> u32;
}

/// The initial namespace: the identity mapping.
#[derive(Debug, Clone, Copy, Default)]
pub struct InitNamespace;

impl UserNamespace for InitNamespace {
    fn map_uid(&self, uid: u32) -> u32 {
        uid
    }

    fn map_gid(&self, gid: u32) -> u32 {
        gid
    }
}

/// Trust status of a task as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustStatus {
    /// No modeling violation observed.
    Trusted,
    /// Parked in a synchronous export, awaiting adjudication.
    TrustPending,
    /// A modeling violation was attributed to this task. Sticky.
    Untrusted,
}

#[derive(Debug, Default)]
struct TrustFlags {
    untrusted: bool,
    pending: bool,
    fatal_signal: bool,
}

/// The per-task state the engine reads identity from and reports
/// outcomes through.
pub struct TaskState {
    pid: u32,
    comm: String,
    task_id: Mutex<Digest>,
    credentials: Mutex<Credentials>,
    user_ns: Arc<dyn UserNamespace>,
    trust: Mutex<TrustFlags>,
    trust_changed: Condvar,
}

impl TaskState {
    /// Creates a task in the initial user namespace.
    #[must_use]
    pub fn new(pid: u32, comm: &str, credentials: Credentials) -> Arc<Self> {
        Self::with_namespace(pid, comm, credentials, Arc::new(InitNamespace))
    }

    /// Creates a task whose current user namespace is `user_ns`.
    #[must_use]
    pub fn with_namespace(
        pid: u32,
        comm: &str,
        credentials: Credentials,
        user_ns: Arc<dyn UserNamespace>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pid,
            comm: truncate_comm(comm),
            task_id: Mutex::new(Digest::default()),
            credentials: Mutex::new(credentials),
            user_ns,
            trust: Mutex::new(TrustFlags::default()),
            trust_changed: Condvar::new(),
        })
    }

    /// Process id.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Command name, truncated to [`TASK_COMM_LEN`].
    #[must_use]
    pub fn comm(&self) -> &str {
        &self.comm
    }

    /// The task identity digest, or the placeholder if none has been
    /// derived yet.
    #[must_use]
    pub fn task_id(&self) -> Digest {
        *self.task_id.lock().expect("lock poisoned")
    }

    /// Installs the task identity digest derived from the executable.
    pub fn set_task_id(&self, id: Digest) {
        *self.task_id.lock().expect("lock poisoned") = id;
    }

    /// Snapshot of the current credentials.
    #[must_use]
    pub fn credentials(&self) -> Credentials {
        *self.credentials.lock().expect("lock poisoned")
    }

    /// Replaces the credential set, as a credential-changing operation
    /// would.
    pub fn set_credentials(&self, credentials: Credentials) {
        *self.credentials.lock().expect("lock poisoned") = credentials;
    }

    /// The task's current user namespace.
    #[must_use]
    pub fn user_ns(&self) -> &Arc<dyn UserNamespace> {
        &self.user_ns
    }

    /// Current trust status.
    #[must_use]
    pub fn trust_status(&self) -> TrustStatus {
        let flags = self.trust.lock().expect("lock poisoned");
        if flags.untrusted {
            TrustStatus::Untrusted
        } else if flags.pending {
            TrustStatus::TrustPending
        } else {
            TrustStatus::Trusted
        }
    }

    /// Marks the task untrusted. One-way.
    pub fn set_untrusted(&self) {
        let mut flags = self.trust.lock().expect("lock poisoned");
        flags.untrusted = true;
        drop(flags);
        self.trust_changed.notify_all();
    }

    /// Marks the task trust-pending ahead of a synchronous export.
    pub(crate) fn begin_trust_pending(&self) {
        self.trust.lock().expect("lock poisoned").pending = true;
    }

    /// Parks the caller until an external agent resolves its trust status
    /// or a fatal signal arrives.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Cancelled`] when woken by a fatal signal;
    /// the task is untrusted on return in that case.
    pub(crate) fn wait_trust_resolution(&self) -> Result<(), EngineError> {
        let mut flags = self.trust.lock().expect("lock poisoned");
        while flags.pending {
            if flags.fatal_signal {
                flags.pending = false;
                flags.untrusted = true;
                return Err(EngineError::Cancelled);
            }
            flags = self.trust_changed.wait(flags).expect("lock poisoned");
        }
        Ok(())
    }

    /// Resolves a pending trust decision. Called on behalf of the
    /// external agent that adjudicated the exported event.
    pub fn resolve_trust(&self, trusted: bool) {
        let mut flags = self.trust.lock().expect("lock poisoned");
        flags.pending = false;
        if !trusted {
            flags.untrusted = true;
        }
        drop(flags);
        self.trust_changed.notify_all();
    }

    /// Records delivery of a fatal signal and wakes any trust-pending
    /// wait.
    pub fn deliver_fatal_signal(&self) {
        let mut flags = self.trust.lock().expect("lock poisoned");
        flags.fatal_signal = true;
        drop(flags);
        self.trust_changed.notify_all();
    }
}

impl fmt::Debug for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskState")
            .field("pid", &self.pid)
            .field("comm", &self.comm)
            .field("trust", &self.trust_status())
            .finish()
    }
}

fn truncate_comm(comm: &str) -> String {
    if comm.len() < TASK_COMM_LEN {
        return comm.to_string();
    }
    let mut end = TASK_COMM_LEN - 1;
    while !comm.is_char_boundary(end) {
        end -= 1;
    }
    comm[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn comm_is_truncated() {
        let task = TaskState::new(1, "a-very-long-process-name", Credentials::default());
        assert_eq!(task.comm(), "a-very-long-pro");
        assert!(task.comm().len() < TASK_COMM_LEN);
    }

    #[test]
    fn trust_starts_trusted_and_untrusted_is_sticky() {
        let task = TaskState::new(1, "proc", Credentials::default());
        assert_eq!(task.trust_status(), TrustStatus::Trusted);
        task.set_untrusted();
        assert_eq!(task.trust_status(), TrustStatus::Untrusted);
        task.resolve_trust(true);
        assert_eq!(task.trust_status(), TrustStatus::Untrusted);
    }

    #[test]
    fn pending_resolves_trusted() {
        let task = TaskState::new(1, "proc", Credentials::default());
        task.begin_trust_pending();
        assert_eq!(task.trust_status(), TrustStatus::TrustPending);

        let waiter = Arc::clone(&task);
        let handle = thread::spawn(move || waiter.wait_trust_resolution());
        thread::sleep(Duration::from_millis(20));
        task.resolve_trust(true);
        assert!(handle.join().unwrap().is_ok());
        assert_eq!(task.trust_status(), TrustStatus::Trusted);
    }

    #[test]
    fn fatal_signal_cancels_and_forces_untrusted() {
        let task = TaskState::new(1, "proc", Credentials::default());
        task.begin_trust_pending();

        let waiter = Arc::clone(&task);
        let handle = thread::spawn(move || waiter.wait_trust_resolution());
        thread::sleep(Duration::from_millis(20));
        task.deliver_fatal_signal();
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert_eq!(task.trust_status(), TrustStatus::Untrusted);
    }

    #[test]
    fn uniform_credentials() {
        let creds = Credentials::uniform(1000);
        assert_eq!(creds.uid, 1000);
        assert_eq!(creds.fsgid, 1000);
        assert_eq!(creds.cap_effective, 0);
    }
}
