//! Engine entry point.
//!
//! The hook dispatcher hands every policy-relevant operation to
//! [`Engine::handle_hook`], which captures the event descriptor and
//! routes it: internally modeled domains map it to a coefficient and
//! fold it into their model, externally modeled domains queue it for
//! their orchestrator.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::errors::EngineError;
use crate::event::{Event, EventKind, EventParams, FileSource};
use crate::export::{ExportSurface, NoopExportSurface};
use crate::map;
use crate::ns::{Context, DomainConfig, DomainRegistry, DomainType, DEFAULT_MAGAZINE_SIZE};
use crate::task::TaskState;
use crate::trust::{TpmProvider, TrustRoot, DEFAULT_ROOT_MODEL_PCR};

/// Engine-wide configuration, applied to the root domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hash algorithm of the root domain.
    #[serde(default = "default_digest_name")]
    pub digest_name: String,
    /// Magazine slot count for the root domain.
    #[serde(default = "default_magazine_size")]
    pub magazine_size: usize,
    /// PCR index the root model extends.
    #[serde(default = "default_pcr_index")]
    pub pcr_index: u32,
}

fn default_digest_name() -> String {
    "sha256".to_string()
}

const fn default_magazine_size() -> usize {
    DEFAULT_MAGAZINE_SIZE
}

const fn default_pcr_index() -> u32 {
    DEFAULT_ROOT_MODEL_PCR
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            digest_name: default_digest_name(),
            magazine_size: DEFAULT_MAGAZINE_SIZE,
            pcr_index: DEFAULT_ROOT_MODEL_PCR,
        }
    }
}

/// The security event modeling engine.
pub struct Engine {
    registry: Arc<DomainRegistry>,
    trust: Arc<TrustRoot>,
    surface: Arc<dyn ExportSurface>,
    root: Arc<Context>,
}

impl Engine {
    /// Creates an engine without hardware trust or an export surface.
    ///
    /// # Errors
    ///
    /// Propagates root domain creation failures.
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        Self::with_providers(config, None, None)
    }

    /// Creates an engine with the given collaborators. The root domain,
    /// id zero, is created internally modeled and anchors the hardware
    /// measurement chain.
    ///
    /// # Errors
    ///
    /// Propagates root domain creation failures.
    pub fn with_providers(
        config: &EngineConfig,
        tpm: Option<Arc<dyn TpmProvider>>,
        surface: Option<Arc<dyn ExportSurface>>,
    ) -> Result<Self, EngineError> {
        let registry = DomainRegistry::new();
        let trust = Arc::new(TrustRoot::new(tpm, config.pcr_index));
        let surface = surface.unwrap_or_else(|| Arc::new(NoopExportSurface));

        let root = Context::create(
            &registry,
            &trust,
            &surface,
            None,
            DomainType::Internal,
            &DomainConfig {
                digest_name: config.digest_name.clone(),
                magazine_size: config.magazine_size,
                ..DomainConfig::default()
            },
        )?;

        Ok(Self {
            registry,
            trust,
            surface,
            root,
        })
    }

    /// The root modeling domain.
    #[must_use]
    pub fn root(&self) -> &Arc<Context> {
        &self.root
    }

    /// The hardware trust root.
    #[must_use]
    pub fn trust(&self) -> &Arc<TrustRoot> {
        &self.trust
    }

    /// Creates a modeling domain. The new domain inherits the action
    /// table of `parent`, or of the root domain when `parent` is `None`.
    ///
    /// # Errors
    ///
    /// Propagates domain creation failures.
    pub fn create_domain(
        &self,
        parent: Option<&Arc<Context>>,
        domain_type: DomainType,
        config: &DomainConfig,
    ) -> Result<Arc<Context>, EngineError> {
        let parent = parent.unwrap_or(&self.root);
        Context::create(
            &self.registry,
            &self.trust,
            &self.surface,
            Some(parent),
            domain_type,
            config,
        )
    }

    /// Derives and installs the task identity for a program image.
    ///
    /// The identity is the coefficient of the credential-install event
    /// for `file`, mapped with an all-zero task id; every event the task
    /// generates afterwards embeds it.
    ///
    /// # Errors
    ///
    /// Propagates event capture failures.
    pub fn derive_task_id(
        &self,
        ctx: &Arc<Context>,
        task: &Arc<TaskState>,
        file: &dyn FileSource,
    ) -> Result<Digest, EngineError> {
        let task_id = map::map_task(ctx, task, file)?;
        task.set_task_id(task_id);
        Ok(task_id)
    }

    /// Dispatches one security hook event.
    ///
    /// Captures the event descriptor, then either queues it for the
    /// domain's external orchestrator (honoring the blocking mode implied
    /// by `locked`) or maps it and folds it into the internal model. The
    /// modeling outcome lands on `task`'s trust status.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::OutOfMemory`] on magazine exhaustion,
    /// [`EngineError::Cancelled`] when a synchronous export is
    /// interrupted by a fatal signal, and propagates capture failures.
    pub fn handle_hook(
        &self,
        ctx: &Arc<Context>,
        task: &Arc<TaskState>,
        kind: EventKind,
        params: EventParams<'_>,
        locked: bool,
    ) -> Result<(), EngineError> {
        let mut event = ctx
            .alloc_event(locked, task.comm())
            .ok_or(EngineError::OutOfMemory {
                context: "event magazine",
            })?;
        *event = Event::init(ctx, task, kind, params, locked)?;

        if let Some(external) = ctx.external() {
            let event: Arc<Event> = Arc::from(event);
            return external.export_event(task, &event);
        }

        map::map_event(ctx, &mut event);
        let event: Arc<Event> = Arc::from(event);
        let model = ctx.model().expect("domain is internal");
        model.event(ctx.is_sealed(), task, &event)
    }

    /// Reports the action taken against a disciplined event.
    ///
    /// Externally modeled domains queue a log record carrying the
    /// process name, the event type, and the configured action;
    /// internally modeled domains keep the outcome in the model itself
    /// and this is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::OutOfMemory`] on export magazine
    /// exhaustion.
    pub fn report_action(
        &self,
        ctx: &Arc<Context>,
        task: &Arc<TaskState>,
        kind: EventKind,
        locked: bool,
    ) -> Result<(), EngineError> {
        match ctx.external() {
            Some(external) => {
                external.export_action(kind, ctx.action_for(kind), task.comm(), locked)
            },
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("root", &self.root)
            .field("trust", &self.trust)
            .finish()
    }
}
