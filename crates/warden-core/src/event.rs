//! Security event descriptors.
//!
//! An [`Event`] captures everything that identifies one policy-relevant
//! operation: the caller's context of execution (COE), the
//! action-specific cell, and for file-backed events the file identity
//! including a content digest. Events are reference counted with [`Arc`]
//! because trajectories, forensic logs, export queues, and the hardware
//! trust worker all retain them independently.
//!
//! Construction is split from mapping: [`Event::init`] populates the
//! descriptor, the mapper in [`crate::map`] folds it into the domain's
//! coefficient.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::digest::{Digest, DigestAlgorithm};
use crate::errors::EngineError;
use crate::ns::Context;
use crate::task::TaskState;

pub use crate::task::TASK_COMM_LEN;

/// Address family numbers used by socket cells.
pub const AF_UNIX: u16 = 1;
/// IPv4 family number.
pub const AF_INET: u16 = 2;
/// IPv6 family number.
pub const AF_INET6: u16 = 10;

/// Chunk size used when streaming file contents into a digest.
const READ_CHUNK: usize = 4096;

/// Generic hooks modeled through the generic event cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
pub enum GenericEvent {
    /// Process group assignment.
    #[default]
    TaskSetpgid,
    /// Process group query.
    TaskGetpgid,
    /// Session id query.
    TaskGetsid,
    /// Nice value change.
    TaskSetnice,
    /// IO priority change.
    TaskSetioprio,
    /// IO priority query.
    TaskGetioprio,
    /// Resource limit change.
    TaskSetrlimit,
    /// Scheduling policy change.
    TaskSetscheduler,
    /// Scheduling policy query.
    TaskGetscheduler,
    /// Process control operation.
    TaskPrctl,
}

impl GenericEvent {
    /// The canonical hook name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::TaskSetpgid => "task_setpgid",
            Self::TaskGetpgid => "task_getpgid",
            Self::TaskGetsid => "task_getsid",
            Self::TaskSetnice => "task_setnice",
            Self::TaskSetioprio => "task_setioprio",
            Self::TaskGetioprio => "task_getioprio",
            Self::TaskSetrlimit => "task_setrlimit",
            Self::TaskSetscheduler => "task_setscheduler",
            Self::TaskGetscheduler => "task_getscheduler",
            Self::TaskPrctl => "task_prctl",
        }
    }
}

/// The event types the engine models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
pub enum EventKind {
    /// A file open.
    #[default]
    FileOpen,
    /// A memory mapping, file backed or anonymous.
    MmapFile,
    /// Credential installation for a new program image.
    BprmSetCreds,
    /// Socket creation.
    SocketCreate,
    /// Socket connect.
    SocketConnect,
    /// Socket bind.
    SocketBind,
    /// Socket accept.
    SocketAccept,
    /// Signal delivery to another task.
    TaskKill,
    /// Any hook without action-specific arguments.
    Generic(GenericEvent),
}

impl EventKind {
    /// The canonical event name, the leading component of the coefficient
    /// preimage.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::FileOpen => "file_open",
            Self::MmapFile => "mmap_file",
            Self::BprmSetCreds => "bprm_set_creds",
            Self::SocketCreate => "socket_create",
            Self::SocketConnect => "socket_connect",
            Self::SocketBind => "socket_bind",
            Self::SocketAccept => "socket_accept",
            Self::TaskKill => "task_kill",
            Self::Generic(generic) => generic.name(),
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Context of execution: the caller's credential state translated into
/// the domain's chosen user namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Coe {
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
    pub capability_mask: u64,
}

impl Coe {
    /// Captures the caller's COE, translating ids through the namespace
    /// the domain references.
    #[must_use]
    pub fn capture(ctx: &Context, task: &TaskState) -> Self {
        let creds = task.credentials();
        let map_uid = |id: u32| {
            if ctx.use_current_ns() {
                task.user_ns().map_uid(id)
            } else {
                id
            }
        };
        let map_gid = |id: u32| {
            if ctx.use_current_ns() {
                task.user_ns().map_gid(id)
            } else {
                id
            }
        };
        Self {
            uid: map_uid(creds.uid),
            euid: map_uid(creds.euid),
            suid: map_uid(creds.suid),
            gid: map_gid(creds.gid),
            egid: map_gid(creds.egid),
            sgid: map_gid(creds.sgid),
            fsuid: map_uid(creds.fsuid),
            fsgid: map_gid(creds.fsgid),
            capability_mask: creds.cap_effective,
        }
    }
}

/// How far content collection for an inode digest line has progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollectionStatus {
    /// No digest collected yet.
    #[default]
    Unknown,
    /// A digest computation is in flight.
    Collecting,
    /// The stored digest matches the recorded inode version.
    Collected,
}

/// One cached content digest for an inode, keyed by algorithm name.
#[derive(Debug, Clone)]
pub struct InodeDigest {
    /// Algorithm name the digest was computed with.
    pub algorithm: &'static str,
    /// The collected digest value.
    pub value: Digest,
    /// Inode version the digest was collected at.
    pub version: u64,
    /// Collection progress.
    pub status: CollectionStatus,
}

/// Per-inode digest cache shared by every event touching the inode.
///
/// The cache mutex is held across the file read that computes a missing
/// digest, so concurrent events against one inode serialize their
/// collection.
#[derive(Debug, Default)]
pub struct InodeCache {
    lines: Mutex<Vec<InodeDigest>>,
}

impl InodeCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Vec<InodeDigest>> {
        self.lines.lock().expect("lock poisoned")
    }

    /// Snapshot of the cache lines, for inspection.
    #[must_use]
    pub fn lines(&self) -> Vec<InodeDigest> {
        self.lock().clone()
    }
}

/// Filesystem metadata of the file behind an event.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileMetadata {
    /// Open flags.
    pub flags: u32,
    /// Owning user id, untranslated.
    pub uid: u32,
    /// Owning group id, untranslated.
    pub gid: u32,
    /// File mode bits.
    pub mode: u16,
    /// File size in bytes.
    pub size: u64,
    /// Inode version counter.
    pub iversion: u64,
    /// Superblock magic number.
    pub sb_magic: u64,
    /// Superblock id.
    pub sb_id: [u8; 32],
    /// Superblock uuid.
    pub sb_uuid: [u8; 16],
}

/// The file access primitive consumed from the embedding layer.
///
/// Implementations provide the pathname, metadata, a shared inode digest
/// cache, and positional reads used to stream contents into a digest.
pub trait FileSource: Send + Sync {
    /// Absolute pathname of the file.
    fn path(&self) -> &str;

    /// Current metadata.
    fn metadata(&self) -> FileMetadata;

    /// The digest cache shared by all users of this inode.
    fn inode(&self) -> &Arc<InodeCache>;

    /// Reads up to `buf.len()` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Propagates the underlying read failure.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
}

/// File identity as embedded in a coefficient preimage.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileIdentity {
    /// Open flags.
    pub flags: u32,
    /// Owning user id, namespace translated.
    pub uid: u32,
    /// Owning group id, namespace translated.
    pub gid: u32,
    /// File mode bits.
    pub mode: u16,
    /// Pathname length in bytes.
    pub name_length: u32,
    /// Digest of the pathname.
    pub name_digest: Digest,
    /// Superblock magic number.
    pub sb_magic: u64,
    /// Superblock id.
    pub sb_id: [u8; 32],
    /// Superblock uuid.
    pub sb_uuid: [u8; 16],
    /// Content digest, or the domain zero digest when erased.
    pub content_digest: Digest,
}

/// A socket endpoint as captured for connect and bind cells.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketAddress {
    /// An IPv4 endpoint, port and address in network byte order.
    Ipv4 {
        /// Port number.
        port: u16,
        /// Address octets.
        addr: [u8; 4],
    },
    /// An IPv6 endpoint.
    Ipv6 {
        /// Port number.
        port: u16,
        /// Address octets.
        addr: [u8; 16],
        /// Flow label.
        flowinfo: u32,
        /// Scope id.
        scope_id: u32,
    },
    /// A unix domain socket path.
    Unix {
        /// The socket path.
        path: String,
    },
    /// Any other family, identified by the digest of its raw address
    /// bytes.
    Other {
        /// The raw family number.
        family: u16,
        /// Digest of the raw address payload.
        digest: Digest,
    },
}

impl SocketAddress {
    /// The address family number.
    #[must_use]
    pub const fn family(&self) -> u16 {
        match self {
            Self::Ipv4 { .. } => AF_INET,
            Self::Ipv6 { .. } => AF_INET6,
            Self::Unix { .. } => AF_UNIX,
            Self::Other { family, .. } => *family,
        }
    }
}

/// A raw socket address as handed to the engine by the hook layer:
/// the family number plus the address payload that follows it in the
/// wire-format structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSocketAddress {
    /// Address family number.
    pub family: u16,
    /// Address payload bytes.
    pub data: Vec<u8>,
}

impl RawSocketAddress {
    /// An IPv4 address payload.
    #[must_use]
    pub fn ipv4(port: u16, addr: [u8; 4]) -> Self {
        let mut data = Vec::with_capacity(6);
        data.extend_from_slice(&port.to_be_bytes());
        data.extend_from_slice(&addr);
        Self {
            family: AF_INET,
            data,
        }
    }

    /// An IPv6 address payload.
    #[must_use]
    pub fn ipv6(port: u16, addr: [u8; 16], flowinfo: u32, scope_id: u32) -> Self {
        let mut data = Vec::with_capacity(26);
        data.extend_from_slice(&port.to_be_bytes());
        data.extend_from_slice(&flowinfo.to_be_bytes());
        data.extend_from_slice(&addr);
        data.extend_from_slice(&scope_id.to_le_bytes());
        Self {
            family: AF_INET6,
            data,
        }
    }

    /// A unix socket path payload.
    #[must_use]
    pub fn unix(path: &str) -> Self {
        Self {
            family: AF_UNIX,
            data: path.as_bytes().to_vec(),
        }
    }
}

/// The peer address captured for an accept cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptAddress {
    /// IPv4 address octets.
    Ipv4([u8; 4]),
    /// IPv6 address octets.
    Ipv6([u8; 16]),
    /// Unix socket path.
    Unix {
        /// The socket path.
        path: String,
    },
    /// Unrecognized family; identity is erased to the given digest.
    Other(Digest),
}

/// Accept address as supplied by the hook layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptAddressParam {
    /// IPv4 address octets.
    Ipv4([u8; 4]),
    /// IPv6 address octets.
    Ipv6([u8; 16]),
    /// Unix socket path.
    Unix {
        /// The socket path.
        path: String,
    },
    /// Unrecognized family.
    Unknown,
}

/// Action-specific arguments, keyed by event type.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum Cell {
    /// File identity for opens and credential installs.
    File(FileIdentity),
    /// Memory mapping arguments; `file` is `None` for anonymous maps.
    Mmap {
        /// Requested protection.
        reqprot: u32,
        /// Effective protection.
        prot: u32,
        /// Mapping flags.
        flags: u32,
        /// Backing file identity, if any.
        file: Option<FileIdentity>,
    },
    /// Socket creation arguments.
    SocketCreate {
        /// Address family.
        family: u32,
        /// Socket type.
        kind: u32,
        /// Protocol number.
        protocol: u32,
        /// Kernel-internal socket flag.
        kern: u32,
    },
    /// Connect target.
    SocketConnect(SocketAddress),
    /// Bind target.
    SocketBind(SocketAddress),
    /// Accepted peer.
    SocketAccept {
        /// Address family.
        family: u16,
        /// Socket type.
        kind: u32,
        /// Port number.
        port: u16,
        /// Peer address.
        addr: AcceptAddress,
    },
    /// Signal delivery arguments.
    TaskKill {
        /// One when the target lives in another modeling domain.
        cross_model: u32,
        /// Signal number.
        signal: u32,
        /// Task identity digest of the target.
        target: Digest,
    },
    /// No action-specific arguments.
    #[default]
    Generic,
}

/// Hook parameters handed to [`Event::init`].
#[non_exhaustive]
pub enum EventParams<'a> {
    /// A file-backed event (open, credential install).
    File {
        /// The file being acted on.
        file: &'a dyn FileSource,
    },
    /// A memory mapping; `file` is `None` for anonymous maps.
    Mmap {
        /// Requested protection.
        reqprot: u32,
        /// Effective protection.
        prot: u32,
        /// Mapping flags.
        flags: u32,
        /// Backing file, if any.
        file: Option<&'a dyn FileSource>,
    },
    /// Socket creation.
    SocketCreate {
        /// Address family.
        family: u32,
        /// Socket type.
        kind: u32,
        /// Protocol number.
        protocol: u32,
        /// Kernel-internal socket flag.
        kern: u32,
    },
    /// Socket connect.
    SocketConnect {
        /// Raw target address.
        addr: RawSocketAddress,
    },
    /// Socket bind.
    SocketBind {
        /// Raw bound address.
        addr: RawSocketAddress,
    },
    /// Socket accept.
    SocketAccept {
        /// Address family.
        family: u16,
        /// Socket type.
        kind: u32,
        /// Port number.
        port: u16,
        /// Peer address.
        addr: AcceptAddressParam,
    },
    /// Signal delivery.
    TaskKill {
        /// True when the target lives in another modeling domain.
        cross_model: bool,
        /// Signal number.
        signal: u32,
        /// Task identity digest of the target.
        target: Digest,
    },
    /// A hook without action-specific arguments.
    Generic,
}

/// A fully captured security event.
///
/// `Default` yields the zeroed object magazines pre-allocate; every field
/// is overwritten by [`Event::init`] before use.
#[derive(Debug, Default)]
pub struct Event {
    /// Event type.
    pub kind: EventKind,
    /// Caller pid at capture time.
    pub pid: u32,
    /// Caller command name.
    pub comm: String,
    /// Caller task identity digest.
    pub task_id: Digest,
    /// Captured context of execution.
    pub coe: Coe,
    /// Action-specific cell.
    pub cell: Cell,
    /// Pathname for file-backed events.
    pub pathname: Option<String>,
    /// True when captured in non-blocking context.
    pub locked: bool,
    /// Digest size of the capturing domain.
    pub digest_size: usize,
    coefficient: Digest,
}

impl Event {
    /// Captures a security event description.
    ///
    /// Populates caller identity and COE from `task`, then builds the
    /// cell from `params`. File-backed events also resolve the pathname,
    /// its digest, and the content digest, honoring pseudonyms and the
    /// inode digest cache.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidArgument`] when `params` does not
    /// match `kind` or a socket payload is malformed, and
    /// [`EngineError::Io`] when reading file contents fails.
    pub fn init(
        ctx: &Context,
        task: &TaskState,
        kind: EventKind,
        params: EventParams<'_>,
        locked: bool,
    ) -> Result<Self, EngineError> {
        let mut event = Self {
            kind,
            pid: task.pid(),
            comm: task.comm().to_string(),
            task_id: task.task_id(),
            coe: Coe::capture(ctx, task),
            cell: Cell::Generic,
            pathname: None,
            locked,
            digest_size: ctx.algorithm().digest_size(),
            coefficient: Digest::default(),
        };

        match (kind, params) {
            (EventKind::FileOpen | EventKind::BprmSetCreds, EventParams::File { file }) => {
                let (identity, path) = file_cell(ctx, task, file)?;
                event.cell = Cell::File(identity);
                event.pathname = Some(path);
            },
            (
                EventKind::MmapFile,
                EventParams::Mmap {
                    reqprot,
                    prot,
                    flags,
                    file,
                },
            ) => {
                let identity = match file {
                    Some(file) => {
                        let (identity, path) = file_cell(ctx, task, file)?;
                        event.pathname = Some(path);
                        Some(identity)
                    },
                    None => None,
                };
                event.cell = Cell::Mmap {
                    reqprot,
                    prot,
                    flags,
                    file: identity,
                };
            },
            (
                EventKind::SocketCreate,
                EventParams::SocketCreate {
                    family,
                    kind: socket_kind,
                    protocol,
                    kern,
                },
            ) => {
                event.cell = Cell::SocketCreate {
                    family,
                    kind: socket_kind,
                    protocol,
                    kern,
                };
            },
            (EventKind::SocketConnect, EventParams::SocketConnect { addr }) => {
                event.cell = Cell::SocketConnect(socket_cell(ctx, &addr)?);
            },
            (EventKind::SocketBind, EventParams::SocketBind { addr }) => {
                event.cell = Cell::SocketBind(socket_cell(ctx, &addr)?);
            },
            (
                EventKind::SocketAccept,
                EventParams::SocketAccept {
                    family,
                    kind: socket_kind,
                    port,
                    addr,
                },
            ) => {
                let addr = match addr {
                    AcceptAddressParam::Ipv4(octets) => AcceptAddress::Ipv4(octets),
                    AcceptAddressParam::Ipv6(octets) => AcceptAddress::Ipv6(octets),
                    AcceptAddressParam::Unix { path } => AcceptAddress::Unix { path },
                    // Identity of unrecognized peers is deliberately erased.
                    AcceptAddressParam::Unknown => AcceptAddress::Other(ctx.zero_digest()),
                };
                event.cell = Cell::SocketAccept {
                    family,
                    kind: socket_kind,
                    port,
                    addr,
                };
            },
            (
                EventKind::TaskKill,
                EventParams::TaskKill {
                    cross_model,
                    signal,
                    target,
                },
            ) => {
                event.cell = Cell::TaskKill {
                    cross_model: u32::from(cross_model),
                    signal,
                    target,
                };
            },
            (EventKind::Generic(_), EventParams::Generic) => {
                event.cell = Cell::Generic;
            },
            (kind, _) => {
                return Err(EngineError::InvalidArgument {
                    reason: format!("parameters do not match event {kind}"),
                });
            },
        }

        Ok(event)
    }

    /// Builds a synthetic event carrying only a coefficient: the
    /// aggregate injection and trusted point loads use these.
    #[must_use]
    pub(crate) fn synthetic(coefficient: Digest) -> Self {
        Self {
            digest_size: coefficient.size(),
            coefficient,
            ..Self::default()
        }
    }

    /// The coefficient this event mapped to, or the placeholder before
    /// mapping.
    #[must_use]
    pub fn coefficient(&self) -> &Digest {
        &self.coefficient
    }

    pub(crate) fn set_coefficient(&mut self, coefficient: Digest) {
        self.coefficient = coefficient;
    }
}

/// Builds the file identity block and pathname for a file-backed event.
fn file_cell(
    ctx: &Context,
    task: &TaskState,
    file: &dyn FileSource,
) -> Result<(FileIdentity, String), EngineError> {
    let alg = ctx.algorithm();
    let path = file.path().to_string();
    let meta = file.metadata();

    let name_length = path.len() as u32;
    let name_digest = alg.digest(path.as_bytes());
    let content_digest = content_digest(ctx, file, &path, &meta)?;

    let (uid, gid) = if ctx.use_current_ns() {
        (
            task.user_ns().map_uid(meta.uid),
            task.user_ns().map_gid(meta.gid),
        )
    } else {
        (meta.uid, meta.gid)
    };

    Ok((
        FileIdentity {
            flags: meta.flags,
            uid,
            gid,
            mode: meta.mode,
            name_length,
            name_digest,
            sb_magic: meta.sb_magic,
            sb_id: meta.sb_id,
            sb_uuid: meta.sb_uuid,
            content_digest,
        },
        path,
    ))
}

/// Resolves the content digest for a file-backed event.
///
/// Pseudonymized paths and empty files resolve to the domain zero digest
/// without touching the contents. Otherwise the per-inode cache line for
/// the domain's algorithm is reused when its version is current, or the
/// file is streamed and the line refreshed. The cache mutex is held
/// across the read so collection for one inode is serialized.
fn content_digest(
    ctx: &Context,
    file: &dyn FileSource,
    path: &str,
    meta: &FileMetadata,
) -> Result<Digest, EngineError> {
    let alg = ctx.algorithm();

    if let Some(model) = ctx.model() {
        if model.has_pseudonym(alg, path) {
            return Ok(ctx.zero_digest());
        }
    }

    if meta.size == 0 {
        return Ok(ctx.zero_digest());
    }

    let inode = Arc::clone(file.inode());
    let mut lines = inode.lock();

    if let Some(line) = lines.iter().find(|line| line.algorithm == alg.name()) {
        if line.status == CollectionStatus::Collected && line.version == meta.iversion {
            return Ok(line.value);
        }
    }

    let index = match lines.iter().position(|line| line.algorithm == alg.name()) {
        Some(index) => index,
        None => {
            lines.push(InodeDigest {
                algorithm: alg.name(),
                value: Digest::default(),
                version: 0,
                status: CollectionStatus::Unknown,
            });
            lines.len() - 1
        },
    };

    lines[index].status = CollectionStatus::Collecting;
    match stream_digest(alg, file, meta.size) {
        Ok(digest) => {
            lines[index].value = digest;
            lines[index].version = meta.iversion;
            lines[index].status = CollectionStatus::Collected;
            Ok(digest)
        },
        Err(err) => {
            lines[index].status = CollectionStatus::Unknown;
            Err(err.into())
        },
    }
}

fn stream_digest(alg: DigestAlgorithm, file: &dyn FileSource, size: u64) -> io::Result<Digest> {
    let mut cx = alg.context();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut offset = 0u64;
    while offset < size {
        let read = file.read_at(offset, &mut buf)?;
        if read == 0 {
            break;
        }
        cx.update(&buf[..read]);
        offset += read as u64;
    }
    Ok(cx.finish())
}

/// Parses a raw socket address into the connect/bind cell form.
///
/// Unrecognized families keep only the digest of their raw payload.
fn socket_cell(ctx: &Context, raw: &RawSocketAddress) -> Result<SocketAddress, EngineError> {
    let short = |what: &str| EngineError::InvalidArgument {
        reason: format!("truncated {what} socket address ({} bytes)", raw.data.len()),
    };
    match raw.family {
        AF_INET => {
            if raw.data.len() < 6 {
                return Err(short("ipv4"));
            }
            let port = u16::from_be_bytes([raw.data[0], raw.data[1]]);
            let mut addr = [0u8; 4];
            addr.copy_from_slice(&raw.data[2..6]);
            Ok(SocketAddress::Ipv4 { port, addr })
        },
        AF_INET6 => {
            if raw.data.len() < 26 {
                return Err(short("ipv6"));
            }
            let port = u16::from_be_bytes([raw.data[0], raw.data[1]]);
            let flowinfo = u32::from_be_bytes([raw.data[2], raw.data[3], raw.data[4], raw.data[5]]);
            let mut addr = [0u8; 16];
            addr.copy_from_slice(&raw.data[6..22]);
            let scope_id =
                u32::from_le_bytes([raw.data[22], raw.data[23], raw.data[24], raw.data[25]]);
            Ok(SocketAddress::Ipv6 {
                port,
                addr,
                flowinfo,
                scope_id,
            })
        },
        AF_UNIX => {
            let end = raw
                .data
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(raw.data.len());
            let path =
                String::from_utf8(raw.data[..end].to_vec()).map_err(|_| {
                    EngineError::InvalidArgument {
                        reason: "unix socket path is not valid utf-8".to_string(),
                    }
                })?;
            Ok(SocketAddress::Unix { path })
        },
        family => Ok(SocketAddress::Other {
            family,
            digest: ctx.algorithm().digest(&raw.data),
        }),
    }
}

/// An in-memory [`FileSource`], for tests and embedding demos.
#[derive(Debug)]
pub struct MemoryFile {
    path: String,
    metadata: Mutex<FileMetadata>,
    content: Mutex<Vec<u8>>,
    inode: Arc<InodeCache>,
}

impl MemoryFile {
    /// Creates a file with default metadata and the given contents.
    #[must_use]
    pub fn new(path: &str, content: &[u8]) -> Self {
        let metadata = FileMetadata {
            flags: 0,
            uid: 0,
            gid: 0,
            mode: 0o644,
            size: content.len() as u64,
            iversion: 1,
            sb_magic: 0xef53,
            sb_id: [0u8; 32],
            sb_uuid: [0u8; 16],
        };
        Self {
            path: path.to_string(),
            metadata: Mutex::new(metadata),
            content: Mutex::new(content.to_vec()),
            inode: InodeCache::new(),
        }
    }

    /// Overrides the metadata.
    #[must_use]
    pub fn with_metadata(self, metadata: FileMetadata) -> Self {
        let metadata = FileMetadata {
            size: self.content.lock().expect("lock poisoned").len() as u64,
            ..metadata
        };
        *self.metadata.lock().expect("lock poisoned") = metadata;
        self
    }

    /// Replaces the contents and bumps the inode version.
    pub fn write(&self, content: &[u8]) {
        *self.content.lock().expect("lock poisoned") = content.to_vec();
        let mut meta = self.metadata.lock().expect("lock poisoned");
        meta.size = content.len() as u64;
        meta.iversion += 1;
    }
}

impl FileSource for MemoryFile {
    fn path(&self) -> &str {
        &self.path
    }

    fn metadata(&self) -> FileMetadata {
        *self.metadata.lock().expect("lock poisoned")
    }

    fn inode(&self) -> &Arc<InodeCache> {
        &self.inode
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let content = self.content.lock().expect("lock poisoned");
        let offset = offset as usize;
        if offset >= content.len() {
            return Ok(0);
        }
        let available = &content[offset..];
        let len = available.len().min(buf.len());
        buf[..len].copy_from_slice(&available[..len]);
        Ok(len)
    }
}
