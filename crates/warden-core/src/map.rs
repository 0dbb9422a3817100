//! Mapping of security events into state coefficients.
//!
//! The coefficient of an event is a canonical hash:
//!
//! ```text
//! µ(E) = H( name(kind) || task_id || H_coe(E) || H_cell(E) )
//! ```
//!
//! `H_coe` digests the eight credential ids in fixed order followed by
//! the capability mask. `H_cell` digests a canonical byte sequence per
//! event type. Scalar fields contribute their little-endian encoding;
//! socket ports, addresses, and flow labels contribute the network byte
//! order they were captured in. Identical inputs under an identical
//! domain configuration therefore produce byte-identical coefficients on
//! every host.

use crate::digest::{Digest, DigestAlgorithm, DigestContext};
use crate::errors::EngineError;
use crate::event::{
    AcceptAddress, Cell, Coe, Event, EventKind, EventParams, FileIdentity, FileSource,
    SocketAddress,
};
use crate::ns::Context;
use crate::task::TaskState;

/// Digests the context of execution.
#[must_use]
pub fn coe_mapping(alg: DigestAlgorithm, coe: &Coe) -> Digest {
    let mut cx = alg.context();
    for id in [
        coe.uid, coe.euid, coe.suid, coe.gid, coe.egid, coe.sgid, coe.fsuid, coe.fsgid,
    ] {
        cx.update(&id.to_le_bytes());
    }
    cx.finup(&coe.capability_mask.to_le_bytes())
}

fn update_file_identity(cx: &mut DigestContext, file: &FileIdentity) {
    cx.update(&file.flags.to_le_bytes());
    cx.update(&file.uid.to_le_bytes());
    cx.update(&file.gid.to_le_bytes());
    cx.update(&file.mode.to_le_bytes());
    cx.update(&file.name_length.to_le_bytes());
    cx.update(file.name_digest.as_bytes());
    cx.update(&file.sb_magic.to_le_bytes());
    cx.update(&file.sb_id);
    cx.update(&file.sb_uuid);
}

fn socket_address_mapping(mut cx: DigestContext, addr: &SocketAddress) -> Digest {
    cx.update(&addr.family().to_le_bytes());
    match addr {
        SocketAddress::Ipv4 { port, addr } => {
            cx.update(&port.to_be_bytes());
            cx.finup(addr)
        },
        SocketAddress::Ipv6 {
            port,
            addr,
            flowinfo,
            scope_id,
        } => {
            cx.update(&port.to_be_bytes());
            cx.update(addr);
            cx.update(&flowinfo.to_be_bytes());
            cx.finup(&scope_id.to_le_bytes())
        },
        SocketAddress::Unix { path } => cx.finup(path.as_bytes()),
        SocketAddress::Other { digest, .. } => cx.finup(digest.as_bytes()),
    }
}

/// Digests the action-specific cell of an event.
///
/// `zero_digest` is the capturing domain's zero digest, folded into the
/// cell of generic events.
#[must_use]
pub fn cell_mapping(alg: DigestAlgorithm, zero_digest: &Digest, event: &Event) -> Digest {
    let mut cx = alg.context();
    match &event.cell {
        Cell::File(file) => {
            update_file_identity(&mut cx, file);
            cx.finup(file.content_digest.as_bytes())
        },
        Cell::Mmap {
            reqprot,
            prot,
            flags,
            file,
        } => {
            cx.update(&reqprot.to_le_bytes());
            cx.update(&prot.to_le_bytes());
            match file {
                // Anonymous mappings terminate at the prefix.
                None => cx.finup(&flags.to_le_bytes()),
                Some(file) => {
                    cx.update(&flags.to_le_bytes());
                    update_file_identity(&mut cx, file);
                    cx.finup(file.content_digest.as_bytes())
                },
            }
        },
        Cell::SocketCreate {
            family,
            kind,
            protocol,
            kern,
        } => {
            cx.update(&family.to_le_bytes());
            cx.update(&kind.to_le_bytes());
            cx.update(&protocol.to_le_bytes());
            cx.finup(&kern.to_le_bytes())
        },
        Cell::SocketConnect(addr) | Cell::SocketBind(addr) => socket_address_mapping(cx, addr),
        Cell::SocketAccept {
            family,
            kind,
            port,
            addr,
        } => {
            cx.update(&family.to_le_bytes());
            cx.update(&kind.to_le_bytes());
            cx.update(&port.to_be_bytes());
            match addr {
                AcceptAddress::Ipv4(octets) => cx.finup(octets),
                AcceptAddress::Ipv6(octets) => cx.finup(octets),
                AcceptAddress::Unix { path } => cx.finup(path.as_bytes()),
                AcceptAddress::Other(digest) => cx.finup(digest.as_bytes()),
            }
        },
        Cell::TaskKill {
            cross_model,
            signal,
            target,
        } => {
            cx.update(&cross_model.to_le_bytes());
            cx.update(&signal.to_le_bytes());
            cx.finup(target.as_bytes())
        },
        Cell::Generic => {
            cx.update(event.kind.name().as_bytes());
            cx.finup(zero_digest.as_bytes())
        },
    }
}

/// Combines the event name, task identity, COE digest, and cell digest
/// into the coefficient.
#[must_use]
pub fn event_mapping(
    alg: DigestAlgorithm,
    kind: EventKind,
    task_id: Option<&Digest>,
    coe_id: &Digest,
    cell_id: &Digest,
) -> Digest {
    let mut cx = alg.context();
    cx.update(kind.name().as_bytes());
    if let Some(task_id) = task_id {
        cx.update(task_id.as_bytes());
    }
    cx.update(coe_id.as_bytes());
    cx.finup(cell_id.as_bytes())
}

/// Maps an event into its coefficient and stores it on the event.
pub fn map_event(ctx: &Context, event: &mut Event) {
    let alg = ctx.algorithm();
    let zero = ctx.zero_digest();
    let coe_id = coe_mapping(alg, &event.coe);
    let cell_id = cell_mapping(alg, &zero, event);
    let task_id = event.task_id;
    let mapping = event_mapping(alg, event.kind, Some(&task_id), &coe_id, &cell_id);
    event.set_coefficient(mapping);
}

/// Derives the task identity digest for a program image.
///
/// The executable is captured as a credential-install event and mapped
/// with an all-zero task identity; the resulting coefficient becomes the
/// task id embedded in every event the process generates afterwards.
///
/// # Errors
///
/// Propagates event capture failures.
pub fn map_task(
    ctx: &Context,
    task: &TaskState,
    file: &dyn FileSource,
) -> Result<Digest, EngineError> {
    let event = Event::init(
        ctx,
        task,
        EventKind::BprmSetCreds,
        EventParams::File { file },
        false,
    )?;

    let alg = ctx.algorithm();
    let zero = ctx.zero_digest();
    let null_task_id = Digest::zeroed(alg.digest_size());
    let coe_id = coe_mapping(alg, &event.coe);
    let cell_id = cell_mapping(alg, &zero, &event);
    Ok(event_mapping(
        alg,
        EventKind::BprmSetCreds,
        Some(&null_task_id),
        &coe_id,
        &cell_id,
    ))
}
