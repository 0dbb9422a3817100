//! Export of security events to an external modeling agent.
//!
//! Externally modeled domains do not evaluate events in place; they queue
//! them for a trust orchestrator to adjudicate. The queue is a bounded
//! FIFO of export records; a consumer drains it one record at a time
//! through [`External::show`], which renders the record in the export
//! text format.
//!
//! Synchronous exports park the caller trust-pending until the
//! orchestrator resolves its status through
//! [`TaskState::resolve_trust`]. Asynchronous exports, captured in
//! non-blocking context, return immediately.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use serde_json::json;
use subtle::ConstantTimeEq;

use crate::digest::Digest;
use crate::errors::EngineError;
use crate::event::{AcceptAddress, Cell, Event, EventKind, SocketAddress};
use crate::magazine::Magazine;
use crate::ns::Action;
use crate::task::TaskState;

/// A queued export record.
///
/// `Default` yields the zeroed object magazines pre-allocate; records are
/// fully overwritten before queueing.
#[derive(Debug)]
#[non_exhaustive]
pub enum ExportRecord {
    /// The platform aggregate, queued when the domain is created.
    Aggregate {
        /// Aggregate digest.
        value: Digest,
    },
    /// A synchronously exported event; the caller is trust-pending.
    Event {
        /// The exported event.
        event: Arc<Event>,
    },
    /// An event exported from non-blocking context.
    AsyncEvent {
        /// The exported event.
        event: Arc<Event>,
    },
    /// The action taken against a disciplined event.
    Log {
        /// Event type the action applies to.
        event: EventKind,
        /// The configured action.
        action: Action,
        /// Command name of the disciplined process.
        comm: String,
    },
}

impl Default for ExportRecord {
    fn default() -> Self {
        Self::Log {
            event: EventKind::default(),
            action: Action::default(),
            comm: String::new(),
        }
    }
}

/// The per-domain channel surface consumed from the embedding layer.
///
/// Implementations typically expose one filesystem node per external
/// domain for the orchestrator to read records from.
pub trait ExportSurface: Send + Sync {
    /// Announces a new external domain.
    ///
    /// # Errors
    ///
    /// A registration failure aborts domain creation.
    fn register(&self, domain_id: u64) -> Result<(), EngineError>;

    /// Withdraws a torn-down domain.
    fn unregister(&self, domain_id: u64);
}

/// An [`ExportSurface`] that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopExportSurface;

impl ExportSurface for NoopExportSurface {
    fn register(&self, _domain_id: u64) -> Result<(), EngineError> {
        Ok(())
    }

    fn unregister(&self, _domain_id: u64) {}
}

/// The external half of a modeling domain: export queue, consumer wait
/// channel, and the authentication key for trust adjudication.
pub struct External {
    domain_id: u64,
    queue: Mutex<VecDeque<Box<ExportRecord>>>,
    have_event: Mutex<bool>,
    wakeup: Condvar,
    magazine: Magazine<ExportRecord>,
    auth_key: Digest,
    surface: Arc<dyn ExportSurface>,
}

impl External {
    pub(crate) fn new(
        domain_id: u64,
        magazine_size: usize,
        auth_key: Digest,
        surface: Arc<dyn ExportSurface>,
    ) -> Result<Self, EngineError> {
        surface.register(domain_id)?;
        Ok(Self {
            domain_id,
            queue: Mutex::new(VecDeque::new()),
            have_event: Mutex::new(false),
            wakeup: Condvar::new(),
            magazine: Magazine::new(magazine_size, "export", domain_id)?,
            auth_key,
            surface,
        })
    }

    /// The owning domain id.
    #[must_use]
    pub const fn domain_id(&self) -> u64 {
        self.domain_id
    }

    /// Constant-time check of an adjudicator's authentication key.
    #[must_use]
    pub fn authenticate(&self, candidate: &Digest) -> bool {
        self.auth_key
            .as_bytes()
            .ct_eq(candidate.as_bytes())
            .into()
    }

    /// Queues the platform aggregate, the first record of every external
    /// domain.
    pub fn export_aggregate(&self, aggregate: Digest) {
        let record = Box::new(ExportRecord::Aggregate { value: aggregate });
        self.enqueue(record);
    }

    /// Queues a security event for adjudication.
    ///
    /// Events captured in non-blocking context are queued asynchronously
    /// and return immediately. Otherwise the caller is marked
    /// trust-pending and parked until the orchestrator resolves its
    /// status.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::OutOfMemory`] when the export magazine is
    /// exhausted, and [`EngineError::Cancelled`] when a fatal signal
    /// interrupts the trust-pending wait; the caller is untrusted in that
    /// case, and the record remains queued.
    pub fn export_event(&self, task: &TaskState, event: &Arc<Event>) -> Result<(), EngineError> {
        let locked = event.locked;
        let mut record =
            self.magazine
                .acquire(locked, &event.comm)
                .ok_or(EngineError::OutOfMemory {
                    context: "export magazine",
                })?;
        *record = if locked {
            ExportRecord::AsyncEvent {
                event: Arc::clone(event),
            }
        } else {
            ExportRecord::Event {
                event: Arc::clone(event),
            }
        };

        if locked {
            self.enqueue(record);
            return Ok(());
        }

        task.begin_trust_pending();
        self.enqueue(record);
        task.wait_trust_resolution()
    }

    /// Queues the action taken against a disciplined event.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::OutOfMemory`] when the export magazine is
    /// exhausted.
    pub fn export_action(
        &self,
        event: EventKind,
        action: Action,
        comm: &str,
        locked: bool,
    ) -> Result<(), EngineError> {
        let mut record = self
            .magazine
            .acquire(locked, comm)
            .ok_or(EngineError::OutOfMemory {
                context: "export magazine",
            })?;
        *record = ExportRecord::Log {
            event,
            action,
            comm: comm.to_string(),
        };
        self.enqueue(record);
        Ok(())
    }

    /// Dequeues at most one record and renders it as a single export
    /// line. Returns `None` when the queue is empty.
    #[must_use]
    pub fn show(&self) -> Option<String> {
        let record = self.queue.lock().expect("lock poisoned").pop_front()?;
        Some(render_record(&record))
    }

    /// Number of queued records.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.lock().expect("lock poisoned").len()
    }

    /// Blocks until a record is queued or `timeout` elapses. Returns
    /// true when a record arrived.
    #[must_use]
    pub fn wait_for_export(&self, timeout: Duration) -> bool {
        let guard = self.have_event.lock().expect("lock poisoned");
        let (mut have, _) = self
            .wakeup
            .wait_timeout_while(guard, timeout, |have| !*have)
            .expect("lock poisoned");
        if *have {
            *have = false;
            true
        } else {
            false
        }
    }

    fn enqueue(&self, record: Box<ExportRecord>) {
        self.queue.lock().expect("lock poisoned").push_back(record);
        let mut have = self.have_event.lock().expect("lock poisoned");
        *have = true;
        drop(have);
        self.wakeup.notify_one();
    }
}

impl Drop for External {
    fn drop(&mut self) {
        self.surface.unregister(self.domain_id);
    }
}

impl std::fmt::Debug for External {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("External")
            .field("domain_id", &self.domain_id)
            .field("pending", &self.pending())
            .finish()
    }
}

fn render_record(record: &ExportRecord) -> String {
    let value = match record {
        ExportRecord::Aggregate { value } => json!({
            "export": {"type": "aggregate"},
            "aggregate": {"value": value.to_hex()},
        }),
        ExportRecord::Event { event } => json!({
            "export": {"type": "event"},
            "event": event_json(event),
        }),
        ExportRecord::AsyncEvent { event } => json!({
            "export": {"type": "async_event"},
            "event": event_json(event),
        }),
        ExportRecord::Log {
            event,
            action,
            comm,
        } => json!({
            "export": {"type": "log"},
            "log": {
                "process": comm,
                "event": event.name(),
                "action": action.name(),
            },
        }),
    };
    format!("{value}\n")
}

/// Renders an event in the trajectory format shared with the model query
/// surface.
pub(crate) fn event_json(event: &Event) -> serde_json::Value {
    let coe = &event.coe;
    let mut value = json!({
        "event": event.kind.name(),
        "pid": event.pid,
        "process": event.comm,
        "task_id": event.task_id.to_hex(),
        "COE": {
            "uid": coe.uid,
            "euid": coe.euid,
            "suid": coe.suid,
            "gid": coe.gid,
            "egid": coe.egid,
            "sgid": coe.sgid,
            "fsuid": coe.fsuid,
            "fsgid": coe.fsgid,
            "capability": coe.capability_mask,
        },
        "cell": cell_json(&event.cell),
    });

    let map = value.as_object_mut().expect("object literal");
    if let Some(pathname) = &event.pathname {
        map.insert("pathname".to_string(), json!(pathname));
    }
    if !event.coefficient().is_empty() {
        map.insert("mapping".to_string(), json!(event.coefficient().to_hex()));
    }
    value
}

fn file_json(file: &crate::event::FileIdentity) -> serde_json::Value {
    json!({
        "flags": file.flags,
        "uid": file.uid,
        "gid": file.gid,
        "mode": file.mode,
        "name_length": file.name_length,
        "name": file.name_digest.to_hex(),
        "s_magic": file.sb_magic,
        "s_id": hex::encode(file.sb_id),
        "s_uuid": hex::encode(file.sb_uuid),
        "digest": file.content_digest.to_hex(),
    })
}

fn socket_json(addr: &SocketAddress) -> serde_json::Value {
    match addr {
        SocketAddress::Ipv4 { port, addr } => json!({
            "family": AF_NAME_INET,
            "port": port,
            "addr": hex::encode(addr),
        }),
        SocketAddress::Ipv6 {
            port,
            addr,
            flowinfo,
            scope_id,
        } => json!({
            "family": AF_NAME_INET6,
            "port": port,
            "addr": hex::encode(addr),
            "flowinfo": flowinfo,
            "scope_id": scope_id,
        }),
        SocketAddress::Unix { path } => json!({
            "family": AF_NAME_UNIX,
            "path": path,
        }),
        SocketAddress::Other { family, digest } => json!({
            "family": family,
            "mapping": digest.to_hex(),
        }),
    }
}

const AF_NAME_UNIX: &str = "unix";
const AF_NAME_INET: &str = "inet";
const AF_NAME_INET6: &str = "inet6";

fn cell_json(cell: &Cell) -> serde_json::Value {
    match cell {
        Cell::File(file) => json!({"file": file_json(file)}),
        Cell::Mmap {
            reqprot,
            prot,
            flags,
            file,
        } => {
            let mut value = json!({
                "reqprot": reqprot,
                "prot": prot,
                "flags": flags,
                "anonymous": file.is_none(),
            });
            if let Some(file) = file {
                value
                    .as_object_mut()
                    .expect("object literal")
                    .insert("file".to_string(), file_json(file));
            }
            value
        },
        Cell::SocketCreate {
            family,
            kind,
            protocol,
            kern,
        } => json!({
            "family": family,
            "type": kind,
            "protocol": protocol,
            "kern": kern,
        }),
        Cell::SocketConnect(addr) | Cell::SocketBind(addr) => socket_json(addr),
        Cell::SocketAccept {
            family,
            kind,
            port,
            addr,
        } => {
            let mut value = json!({
                "family": family,
                "type": kind,
                "port": port,
            });
            let map = value.as_object_mut().expect("object literal");
            match addr {
                AcceptAddress::Ipv4(octets) => {
                    map.insert("addr".to_string(), json!(hex::encode(octets)));
                },
                AcceptAddress::Ipv6(octets) => {
                    map.insert("addr".to_string(), json!(hex::encode(octets)));
                },
                AcceptAddress::Unix { path } => {
                    map.insert("path".to_string(), json!(path));
                },
                AcceptAddress::Other(digest) => {
                    map.insert("mapping".to_string(), json!(digest.to_hex()));
                },
            }
            value
        },
        Cell::TaskKill {
            cross_model,
            signal,
            target,
        } => json!({
            "cross_model": cross_model,
            "signal": signal,
            "target": target.to_hex(),
        }),
        Cell::Generic => json!({}),
    }
}
