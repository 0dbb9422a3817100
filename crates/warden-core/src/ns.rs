//! Modeling domain lifecycle.
//!
//! A [`Context`] is one modeling domain: a digest selection, an event
//! magazine, a per-event action table, and either an internal model or
//! an external export channel. Domains are created from a parent domain,
//! inherit its action table, and receive a monotonically increasing id
//! from the [`DomainRegistry`].
//!
//! External domains authenticate their trust orchestrator with a key
//! derived from a random per-domain secret and the caller-supplied key
//! material; the registry guarantees derived keys are unique among live
//! domains.
//!
//! Sealing is one-way. After sealing, novel coefficients are treated as
//! modeling violations and captured forensically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::digest::{Digest, DigestAlgorithm};
use crate::errors::EngineError;
use crate::event::{Event, EventKind};
use crate::export::{ExportSurface, External};
use crate::magazine::Magazine;
use crate::model::Model;
use crate::trust::TrustRoot;

/// Default number of slots in each per-domain magazine.
pub const DEFAULT_MAGAZINE_SIZE: usize = 96;

/// The action configured for a disciplined event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    /// Record the event and allow it.
    #[default]
    Log,
    /// Record the event and deny it.
    Deny,
}

impl Action {
    /// The export spelling of the action.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Log => "LOG",
            Self::Deny => "DENY",
        }
    }
}

/// Which user namespace event descriptions reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NsReference {
    /// Translate ids through the initial namespace.
    #[default]
    Initial,
    /// Translate ids through the caller's current namespace.
    Current,
}

/// Whether a domain models internally or exports to an orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainType {
    /// Evaluated by the in-engine modeling agent.
    Internal,
    /// Streamed to an external modeling agent.
    External,
}

/// Configuration for domain creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    /// Hash algorithm name for the domain.
    #[serde(default = "default_digest_name")]
    pub digest_name: String,
    /// Namespace reference for id translation.
    #[serde(default)]
    pub ns: NsReference,
    /// Hex-encoded authentication key material; required for external
    /// domains, exactly two characters per digest byte.
    #[serde(default)]
    pub auth_key_hex: Option<String>,
    /// Slot count for the domain's magazines.
    #[serde(default = "default_magazine_size")]
    pub magazine_size: usize,
}

fn default_digest_name() -> String {
    "sha256".to_string()
}

const fn default_magazine_size() -> usize {
    DEFAULT_MAGAZINE_SIZE
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            digest_name: default_digest_name(),
            ns: NsReference::default(),
            auth_key_hex: None,
            magazine_size: DEFAULT_MAGAZINE_SIZE,
        }
    }
}

struct RegistryInner {
    next_id: u64,
    keys: Vec<(u64, Digest)>,
}

/// Allocates domain ids and enforces authentication-key uniqueness
/// across live external domains.
pub struct DomainRegistry {
    inner: Mutex<RegistryInner>,
}

impl DomainRegistry {
    /// Creates a registry. Ids start at zero; the first domain created
    /// from a fresh registry is the root domain.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(RegistryInner {
                next_id: 0,
                keys: Vec::new(),
            }),
        })
    }

    fn allocate_id(&self) -> u64 {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let id = inner.next_id;
        inner.next_id += 1;
        id
    }

    /// Registers a derived key if it collides with no live domain's key.
    fn try_register_key(&self, domain_id: u64, key: &Digest) -> bool {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let collision = inner
            .keys
            .iter()
            .any(|(_, existing)| bool::from(existing.as_bytes().ct_eq(key.as_bytes())));
        if collision {
            return false;
        }
        inner.keys.push((domain_id, *key));
        true
    }

    fn remove_key(&self, domain_id: u64) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.keys.retain(|(id, _)| *id != domain_id);
    }

    /// Number of live registered authentication keys.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.inner.lock().expect("lock poisoned").keys.len()
    }
}

/// Internal or external modeling scope of a domain.
#[non_exhaustive]
pub enum Scope {
    /// Modeled by the in-engine agent.
    Internal(Model),
    /// Exported to an external agent.
    External(External),
}

/// One modeling domain.
pub struct Context {
    id: u64,
    alg: DigestAlgorithm,
    zero_digest: Digest,
    use_current_ns: bool,
    sealed: AtomicBool,
    actions: Mutex<HashMap<EventKind, Action>>,
    scope: Scope,
    event_magazine: Magazine<Event>,
    registry: Arc<DomainRegistry>,
}

impl Context {
    /// Creates a modeling domain.
    ///
    /// Internal domains allocate a model and fold in the platform
    /// aggregate. External domains derive and register an authentication
    /// key, announce themselves on the export surface, and queue an
    /// aggregate export. The new domain inherits `parent`'s action
    /// table.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidArgument`] for an unknown digest
    /// name or malformed authentication key, and propagates magazine and
    /// surface failures; any failure rolls the domain back.
    pub fn create(
        registry: &Arc<DomainRegistry>,
        trust: &Arc<TrustRoot>,
        surface: &Arc<dyn ExportSurface>,
        parent: Option<&Context>,
        domain_type: DomainType,
        config: &DomainConfig,
    ) -> Result<Arc<Self>, EngineError> {
        let alg = DigestAlgorithm::from_name(&config.digest_name)?;
        let zero_digest = alg.zero_digest();
        let id = registry.allocate_id();

        let event_magazine = Magazine::new(config.magazine_size, "event", id)?;

        let scope = match domain_type {
            DomainType::Internal => {
                let model = Model::new(alg, Arc::clone(trust), id, config.magazine_size)?;
                model.add_aggregate();
                Scope::Internal(model)
            },
            DomainType::External => {
                let auth_key = derive_auth_key(registry, alg, id, config)?;
                let external = match External::new(
                    id,
                    config.magazine_size,
                    auth_key,
                    Arc::clone(surface),
                ) {
                    Ok(external) => external,
                    Err(err) => {
                        registry.remove_key(id);
                        return Err(err);
                    },
                };
                external.export_aggregate(trust.aggregate(alg));
                Scope::External(external)
            },
        };

        let actions = match parent {
            Some(parent) => parent.actions.lock().expect("lock poisoned").clone(),
            None => HashMap::new(),
        };

        Ok(Arc::new(Self {
            id,
            alg,
            zero_digest,
            use_current_ns: config.ns == NsReference::Current,
            sealed: AtomicBool::new(false),
            actions: Mutex::new(actions),
            scope,
            event_magazine,
            registry: Arc::clone(registry),
        }))
    }

    /// The domain id. Zero identifies the root domain.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// The domain's digest algorithm.
    #[must_use]
    pub const fn algorithm(&self) -> DigestAlgorithm {
        self.alg
    }

    /// The domain zero digest.
    #[must_use]
    pub const fn zero_digest(&self) -> Digest {
        self.zero_digest
    }

    /// True when event descriptions reference the caller's current user
    /// namespace.
    #[must_use]
    pub const fn use_current_ns(&self) -> bool {
        self.use_current_ns
    }

    /// Seals the domain. One-way: every novel coefficient afterwards is
    /// a modeling violation.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    /// Whether the domain is sealed.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// The internal model, if this domain has one.
    #[must_use]
    pub fn model(&self) -> Option<&Model> {
        match &self.scope {
            Scope::Internal(model) => Some(model),
            Scope::External(_) => None,
        }
    }

    /// The export channel, if this domain is externally modeled.
    #[must_use]
    pub fn external(&self) -> Option<&External> {
        match &self.scope {
            Scope::Internal(_) => None,
            Scope::External(external) => Some(external),
        }
    }

    /// The configured action for an event type. Defaults to
    /// [`Action::Log`].
    #[must_use]
    pub fn action_for(&self, kind: EventKind) -> Action {
        self.actions
            .lock()
            .expect("lock poisoned")
            .get(&kind)
            .copied()
            .unwrap_or_default()
    }

    /// Configures the action for an event type.
    pub fn set_action(&self, kind: EventKind, action: Action) {
        self.actions
            .lock()
            .expect("lock poisoned")
            .insert(kind, action);
    }

    /// Loads a known-trusted coefficient into the domain's model.
    ///
    /// # Errors
    ///
    /// Rejected with [`EngineError::InvalidArgument`] on sealed or
    /// external domains; propagates model failures.
    pub fn load_point(&self, point: Digest) -> Result<(), EngineError> {
        let model = self.internal_unsealed("load point")?;
        model.load_point(point)
    }

    /// Sets the model base point.
    ///
    /// # Errors
    ///
    /// Rejected with [`EngineError::InvalidArgument`] on sealed or
    /// external domains.
    pub fn load_base(&self, base: Digest) -> Result<(), EngineError> {
        let model = self.internal_unsealed("load base")?;
        model.load_base(base);
        Ok(())
    }

    /// Declares a file pseudonym.
    ///
    /// # Errors
    ///
    /// Rejected with [`EngineError::InvalidArgument`] on sealed or
    /// external domains.
    pub fn load_pseudonym(&self, pseudonym: Digest) -> Result<(), EngineError> {
        let model = self.internal_unsealed("load pseudonym")?;
        model.load_pseudonym(pseudonym);
        Ok(())
    }

    fn internal_unsealed(&self, what: &str) -> Result<&Model, EngineError> {
        if self.is_sealed() {
            return Err(EngineError::InvalidArgument {
                reason: format!("cannot {what} in a sealed domain"),
            });
        }
        self.model().ok_or_else(|| EngineError::InvalidArgument {
            reason: format!("cannot {what} in an externally modeled domain"),
        })
    }

    /// Allocates an event descriptor, from the magazine in non-blocking
    /// context.
    pub(crate) fn alloc_event(&self, locked: bool, comm: &str) -> Option<Box<Event>> {
        self.event_magazine.acquire(locked, comm)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.registry.remove_key(self.id);
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("algorithm", &self.alg.name())
            .field("sealed", &self.is_sealed())
            .field("external", &self.external().is_some())
            .finish()
    }
}

/// Derives the per-domain authentication key: the digest of a random
/// domain secret followed by the decoded key material. Regenerates the
/// secret until the derived key is unique among live domains.
fn derive_auth_key(
    registry: &Arc<DomainRegistry>,
    alg: DigestAlgorithm,
    domain_id: u64,
    config: &DomainConfig,
) -> Result<Digest, EngineError> {
    let key_hex = config
        .auth_key_hex
        .as_deref()
        .ok_or_else(|| EngineError::InvalidArgument {
            reason: "external domain requires an authentication key".to_string(),
        })?;

    if key_hex.len() != 2 * alg.digest_size() {
        return Err(EngineError::InvalidArgument {
            reason: format!(
                "authentication key must be {} hex characters, got {}",
                2 * alg.digest_size(),
                key_hex.len()
            ),
        });
    }

    let key_bytes = hex::decode(key_hex).map_err(|err| EngineError::InvalidArgument {
        reason: format!("authentication key is not valid hex: {err}"),
    })?;

    loop {
        let mut task_key = vec![0u8; alg.digest_size()];
        OsRng.fill_bytes(&mut task_key);

        let mut cx = alg.context();
        cx.update(&task_key);
        let derived = cx.finup(&key_bytes);

        if registry.try_register_key(domain_id, &derived) {
            return Ok(derived);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::NoopExportSurface;

    fn fixtures() -> (Arc<DomainRegistry>, Arc<TrustRoot>, Arc<dyn ExportSurface>) {
        (
            DomainRegistry::new(),
            Arc::new(TrustRoot::without_hardware()),
            Arc::new(NoopExportSurface),
        )
    }

    fn auth_key_hex() -> String {
        "ab".repeat(32)
    }

    #[test]
    fn ids_are_monotonic_from_zero() {
        let (registry, trust, surface) = fixtures();
        let config = DomainConfig::default();
        let root =
            Context::create(&registry, &trust, &surface, None, DomainType::Internal, &config)
                .unwrap();
        let child = Context::create(
            &registry,
            &trust,
            &surface,
            Some(&root),
            DomainType::Internal,
            &config,
        )
        .unwrap();
        assert_eq!(root.id(), 0);
        assert_eq!(child.id(), 1);
    }

    #[test]
    fn internal_domain_starts_with_aggregate_measurement() {
        let ctx = test_support::internal_context("sha256");
        let model = ctx.model().unwrap();
        assert!(model.have_aggregate());
        assert_ne!(
            model.measurement(),
            Digest::zeroed(ctx.algorithm().digest_size())
        );
    }

    #[test]
    fn external_domain_requires_well_formed_key() {
        let (registry, trust, surface) = fixtures();

        let missing = Context::create(
            &registry,
            &trust,
            &surface,
            None,
            DomainType::External,
            &DomainConfig::default(),
        );
        assert!(matches!(missing, Err(EngineError::InvalidArgument { .. })));

        let short = Context::create(
            &registry,
            &trust,
            &surface,
            None,
            DomainType::External,
            &DomainConfig {
                auth_key_hex: Some("abcd".to_string()),
                ..DomainConfig::default()
            },
        );
        assert!(matches!(short, Err(EngineError::InvalidArgument { .. })));

        let bad_hex = Context::create(
            &registry,
            &trust,
            &surface,
            None,
            DomainType::External,
            &DomainConfig {
                auth_key_hex: Some("zz".repeat(32)),
                ..DomainConfig::default()
            },
        );
        assert!(matches!(bad_hex, Err(EngineError::InvalidArgument { .. })));
    }

    #[test]
    fn external_domain_queues_aggregate_and_registers_key() {
        let (registry, trust, surface) = fixtures();
        let ctx = Context::create(
            &registry,
            &trust,
            &surface,
            None,
            DomainType::External,
            &DomainConfig {
                auth_key_hex: Some(auth_key_hex()),
                ..DomainConfig::default()
            },
        )
        .unwrap();

        let external = ctx.external().unwrap();
        assert_eq!(external.pending(), 1);
        assert!(external.show().unwrap().contains("aggregate"));
        assert_eq!(registry.key_count(), 1);

        drop(ctx);
        assert_eq!(registry.key_count(), 0);
    }

    #[test]
    fn derived_keys_differ_for_same_material() {
        let (registry, trust, surface) = fixtures();
        let config = DomainConfig {
            auth_key_hex: Some(auth_key_hex()),
            ..DomainConfig::default()
        };
        let a =
            Context::create(&registry, &trust, &surface, None, DomainType::External, &config)
                .unwrap();
        let b =
            Context::create(&registry, &trust, &surface, None, DomainType::External, &config)
                .unwrap();
        assert_eq!(registry.key_count(), 2);
        drop(a);
        drop(b);
    }

    #[test]
    fn seal_is_one_way() {
        let ctx = test_support::internal_context("sha256");
        assert!(!ctx.is_sealed());
        ctx.seal();
        assert!(ctx.is_sealed());
        ctx.seal();
        assert!(ctx.is_sealed());
    }

    #[test]
    fn sealed_domain_rejects_loads() {
        let ctx = test_support::internal_context("sha256");
        ctx.seal();
        let point = DigestAlgorithm::Sha256.digest(b"p");
        assert!(matches!(
            ctx.load_point(point),
            Err(EngineError::InvalidArgument { .. })
        ));
        assert!(matches!(
            ctx.load_base(point),
            Err(EngineError::InvalidArgument { .. })
        ));
        assert!(matches!(
            ctx.load_pseudonym(point),
            Err(EngineError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn action_table_inherits_from_parent() {
        let (registry, trust, surface) = fixtures();
        let config = DomainConfig::default();
        let parent =
            Context::create(&registry, &trust, &surface, None, DomainType::Internal, &config)
                .unwrap();
        parent.set_action(EventKind::SocketConnect, Action::Deny);

        let child = Context::create(
            &registry,
            &trust,
            &surface,
            Some(&parent),
            DomainType::Internal,
            &config,
        )
        .unwrap();
        assert_eq!(child.action_for(EventKind::SocketConnect), Action::Deny);
        assert_eq!(child.action_for(EventKind::FileOpen), Action::Log);
    }

    #[test]
    fn unknown_digest_name_is_rejected() {
        let (registry, trust, surface) = fixtures();
        let result = Context::create(
            &registry,
            &trust,
            &surface,
            None,
            DomainType::Internal,
            &DomainConfig {
                digest_name: "md5".to_string(),
                ..DomainConfig::default()
            },
        );
        assert!(matches!(result, Err(EngineError::Digest(_))));
    }

    #[test]
    fn domain_config_deserializes_with_defaults() {
        let config: DomainConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.digest_name, "sha256");
        assert_eq!(config.magazine_size, DEFAULT_MAGAZINE_SIZE);
        assert_eq!(config.ns, NsReference::Initial);

        let config: DomainConfig =
            serde_json::from_str(r#"{"digest_name": "blake3", "ns": "current"}"#).unwrap();
        assert_eq!(config.digest_name, "blake3");
        assert_eq!(config.ns, NsReference::Current);
    }
}
