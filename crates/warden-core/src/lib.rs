//! # warden-core
//!
//! A security event modeling engine. Every policy-relevant operation a
//! process performs is mapped into a content-addressed *coefficient*,
//! accumulated into a per-domain *model*, and either evaluated in place
//! against a sealed trust set or streamed to an external orchestrator
//! for adjudication. Each admitted event is also folded into a chained
//! measurement anchored in a hardware root of trust.
//!
//! ## Architecture
//!
//! - [`digest`]: the per-domain hash façade and the [`digest::Digest`]
//!   value type
//! - [`magazine`]: pre-allocated object caches for non-blocking contexts
//! - [`event`]: event descriptors (COE, cell, file identity)
//! - [`map`]: canonical hashing of descriptors into coefficients
//! - [`model`]: coefficient set, trajectory, forensics, measurement,
//!   state
//! - [`export`]: the record queue consumed by external orchestrators
//! - [`trust`]: platform aggregate and chained PCR extension
//! - [`ns`]: modeling domain lifecycle
//! - [`engine`]: the hook entry point tying it together
//!
//! ## Example
//!
//! ```rust
//! use warden_core::prelude::*;
//!
//! # fn main() -> Result<(), warden_core::EngineError> {
//! let engine = Engine::new(&EngineConfig::default())?;
//! let domain = engine.create_domain(None, DomainType::Internal, &DomainConfig::default())?;
//! let task = TaskState::new(1000, "shell", Credentials::uniform(1000));
//!
//! let file = MemoryFile::new("/etc/hostname", b"demo\n");
//! engine.handle_hook(
//!     &domain,
//!     &task,
//!     EventKind::FileOpen,
//!     EventParams::File { file: &file },
//!     false,
//! )?;
//!
//! let model = domain.model().expect("internal domain");
//! assert_eq!(model.trajectory().len(), 1);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod digest;
pub mod engine;
pub mod errors;
pub mod event;
pub mod export;
pub mod magazine;
pub mod map;
pub mod model;
pub mod ns;
pub mod task;
pub mod trust;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::digest::{Digest, DigestAlgorithm};
    pub use crate::engine::{Engine, EngineConfig};
    pub use crate::errors::EngineError;
    pub use crate::event::{EventKind, EventParams, MemoryFile};
    pub use crate::ns::{Action, DomainConfig, DomainType, NsReference};
    pub use crate::task::{Credentials, TaskState, TrustStatus};
}

/// Re-export commonly used types at the crate root.
pub use digest::{Digest, DigestAlgorithm};
pub use engine::{Engine, EngineConfig};
pub use errors::{DigestError, EngineError};
pub use event::{Event, EventKind, EventParams};
pub use ns::{Action, Context, DomainConfig, DomainType};
pub use task::{Credentials, TaskState, TrustStatus};
