//! The in-kernel-style modeling agent: per-domain security model state.
//!
//! A model is the content-addressed set of coefficients a domain has
//! admitted, the trajectory of admitted events, the forensic log of
//! events rejected after sealing, the pseudonym set, and two digests over
//! the whole history:
//!
//! - `measurement` is an order-dependent chain folded as events arrive,
//! - `state` is an order-independent chain over the sorted coefficient
//!   set, the model's canonical identity.
//!
//! Both chains domain-separate each coefficient with the model base, so
//! identical coefficients in different domains contribute distinct
//! values.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::digest::{Digest, DigestAlgorithm};
use crate::errors::EngineError;
use crate::event::Event;
use crate::magazine::Magazine;
use crate::task::TaskState;
use crate::trust::TrustRoot;

/// A coefficient set member as produced by magazine allocation.
///
/// `Default` yields the zeroed object the magazines pre-allocate.
#[derive(Debug, Default)]
pub struct EventPoint {
    pub(crate) point: Digest,
    pub(crate) valid: bool,
    pub(crate) count: u64,
}

/// Read-only view of one coefficient set member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointSnapshot {
    /// The coefficient.
    pub coefficient: Digest,
    /// False when the coefficient was first seen after sealing.
    pub valid: bool,
    /// How many events mapped to this coefficient.
    pub count: u64,
}

#[derive(Default)]
struct PointStore {
    entries: Vec<Box<EventPoint>>,
    index: HashMap<Digest, usize>,
}

/// Per-domain model state.
pub struct Model {
    alg: DigestAlgorithm,
    domain_id: u64,
    trust: Arc<TrustRoot>,
    base: Mutex<Digest>,
    measurement: Mutex<Digest>,
    state: Mutex<Digest>,
    points: Mutex<PointStore>,
    trajectory: Mutex<Vec<Arc<Event>>>,
    forensics: Mutex<Vec<Arc<Event>>>,
    pseudonyms: Mutex<Vec<Digest>>,
    have_aggregate: Mutex<bool>,
    magazine: Magazine<EventPoint>,
}

/// Digest identifying a pathname for pseudonym declaration and lookup:
/// the hash of the name length followed by the name bytes.
#[must_use]
pub fn pseudonym_digest(alg: DigestAlgorithm, path: &str) -> Digest {
    let mut cx = alg.context();
    cx.update(&(path.len() as u32).to_le_bytes());
    cx.finup(path.as_bytes())
}

impl Model {
    /// Allocates a model with a coefficient magazine of `magazine_size`
    /// slots.
    ///
    /// # Errors
    ///
    /// Magazine construction failure is fatal for the owning domain.
    pub fn new(
        alg: DigestAlgorithm,
        trust: Arc<TrustRoot>,
        domain_id: u64,
        magazine_size: usize,
    ) -> Result<Self, EngineError> {
        let size = alg.digest_size();
        Ok(Self {
            alg,
            domain_id,
            trust,
            base: Mutex::new(Digest::zeroed(size)),
            measurement: Mutex::new(Digest::zeroed(size)),
            state: Mutex::new(Digest::zeroed(size)),
            points: Mutex::new(PointStore::default()),
            trajectory: Mutex::new(Vec::new()),
            forensics: Mutex::new(Vec::new()),
            pseudonyms: Mutex::new(Vec::new()),
            have_aggregate: Mutex::new(false),
            magazine: Magazine::new(magazine_size, "point", domain_id)?,
        })
    }

    /// The algorithm this model digests with.
    #[must_use]
    pub const fn algorithm(&self) -> DigestAlgorithm {
        self.alg
    }

    /// Sets the model base point. No chaining happens here; the base
    /// only separates future contributions.
    pub fn load_base(&self, base: Digest) {
        *self.base.lock().expect("lock poisoned") = base;
    }

    /// The current base point.
    #[must_use]
    pub fn base(&self) -> Digest {
        *self.base.lock().expect("lock poisoned")
    }

    /// The rolling measurement over admitted coefficients.
    #[must_use]
    pub fn measurement(&self) -> Digest {
        *self.measurement.lock().expect("lock poisoned")
    }

    /// The canonical state as of the last [`Self::compute_state`] call.
    #[must_use]
    pub fn state(&self) -> Digest {
        *self.state.lock().expect("lock poisoned")
    }

    /// Declares a pseudonym. Duplicate declarations are idempotent.
    pub fn load_pseudonym(&self, pseudonym: Digest) {
        let mut pseudonyms = self.pseudonyms.lock().expect("lock poisoned");
        if !pseudonyms.contains(&pseudonym) {
            pseudonyms.push(pseudonym);
        }
    }

    /// Whether a pseudonym has been declared for `path`.
    #[must_use]
    pub fn has_pseudonym(&self, alg: DigestAlgorithm, path: &str) -> bool {
        let wanted = pseudonym_digest(alg, path);
        self.pseudonyms
            .lock()
            .expect("lock poisoned")
            .contains(&wanted)
    }

    /// Injects the platform aggregate as a synthetic event, the first
    /// event of an internally modeled domain.
    pub fn add_aggregate(&self) {
        let aggregate = self.trust.aggregate(self.alg);
        let event = Arc::new(Event::synthetic(aggregate));
        self.update_measurement(&event);
        *self.have_aggregate.lock().expect("lock poisoned") = true;
    }

    /// Loads a known-trusted coefficient into an unsealed domain.
    ///
    /// The first load also injects the platform aggregate if the model
    /// does not carry it yet. Duplicate loads are no-ops.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::OutOfMemory`] on point allocation failure.
    pub fn load_point(&self, point: Digest) -> Result<(), EngineError> {
        {
            let store = self.points.lock().expect("lock poisoned");
            if store.index.contains_key(&point) {
                return Ok(());
            }
        }

        self.insert_point(point, true, false, "")?;

        {
            let mut have = self.have_aggregate.lock().expect("lock poisoned");
            if !*have {
                *have = true;
                drop(have);
                let aggregate = self.trust.aggregate(self.alg);
                self.update_measurement(&Arc::new(Event::synthetic(aggregate)));
            }
        }

        self.update_measurement(&Arc::new(Event::synthetic(point)));
        Ok(())
    }

    /// The hot path: folds one mapped event into the model.
    ///
    /// A known coefficient only increments its count, marking the caller
    /// untrusted if the coefficient is invalid. A novel coefficient
    /// extends the measurement and either joins the trajectory (unsealed)
    /// or the forensic log (sealed, caller untrusted).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::OutOfMemory`] when the point magazine is
    /// exhausted in non-blocking context.
    pub fn event(
        &self,
        sealed: bool,
        task: &TaskState,
        event: &Arc<Event>,
    ) -> Result<(), EngineError> {
        let coefficient = *event.coefficient();

        {
            let mut store = self.points.lock().expect("lock poisoned");
            if let Some(&index) = store.index.get(&coefficient) {
                let entry = &mut store.entries[index];
                entry.count += 1;
                if !entry.valid {
                    task.set_untrusted();
                }
                return Ok(());
            }
        }

        self.update_measurement(event);

        if sealed {
            self.insert_point(coefficient, false, event.locked, &event.comm)?;
            self.forensics
                .lock()
                .expect("lock poisoned")
                .push(Arc::clone(event));
            task.set_untrusted();
        } else {
            self.insert_point(coefficient, true, event.locked, &event.comm)?;
            self.trajectory
                .lock()
                .expect("lock poisoned")
                .push(Arc::clone(event));
        }

        Ok(())
    }

    fn insert_point(
        &self,
        coefficient: Digest,
        valid: bool,
        locked: bool,
        comm: &str,
    ) -> Result<(), EngineError> {
        let mut entry = self
            .magazine
            .acquire(locked, comm)
            .ok_or(EngineError::OutOfMemory {
                context: "point magazine",
            })?;
        entry.point = coefficient;
        entry.valid = valid;
        entry.count = 1;

        let mut store = self.points.lock().expect("lock poisoned");
        // A racing insert of the same coefficient collapses to a count
        // increment.
        if let Some(&index) = store.index.get(&coefficient) {
            store.entries[index].count += 1;
            return Ok(());
        }
        let index = store.entries.len();
        store.entries.push(entry);
        store.index.insert(coefficient, index);
        Ok(())
    }

    /// Chains one coefficient into the measurement. The root domain also
    /// extends the hardware trust root with the event.
    fn update_measurement(&self, event: &Arc<Event>) {
        let host = self.host_measurement(event.coefficient());
        {
            let mut measurement = self.measurement.lock().expect("lock poisoned");
            let mut cx = self.alg.context();
            cx.update(measurement.as_bytes());
            *measurement = cx.finup(host.as_bytes());
        }
        if self.domain_id == 0 {
            self.trust.extend(event);
        }
    }

    /// `H(base || value)`: the domain-separated contribution of one
    /// digest.
    fn host_measurement(&self, value: &Digest) -> Digest {
        let base = self.base();
        let mut cx = self.alg.context();
        cx.update(base.as_bytes());
        cx.finup(value.as_bytes())
    }

    /// Computes the canonical state of the model.
    ///
    /// The coefficient list is snapshotted under its lock; entries
    /// appended afterwards do not contribute. Sorting the snapshot makes
    /// the result independent of admission order.
    pub fn compute_state(&self) {
        let size = self.alg.digest_size();
        let aggregate = self.trust.aggregate(self.alg);

        let mut cx = self.alg.context();
        cx.update(Digest::zeroed(size).as_bytes());
        let seed = self.host_measurement(&aggregate);
        let mut state = cx.finup(seed.as_bytes());

        let mut points: Vec<Digest> = {
            let store = self.points.lock().expect("lock poisoned");
            store.entries.iter().map(|entry| entry.point).collect()
        };
        points.sort_unstable();

        for point in points {
            let host = self.host_measurement(&point);
            let mut cx = self.alg.context();
            cx.update(state.as_bytes());
            state = cx.finup(host.as_bytes());
        }

        *self.state.lock().expect("lock poisoned") = state;
    }

    /// Snapshot of the coefficient set in insertion order.
    #[must_use]
    pub fn points(&self) -> Vec<PointSnapshot> {
        self.points
            .lock()
            .expect("lock poisoned")
            .entries
            .iter()
            .map(|entry| PointSnapshot {
                coefficient: entry.point,
                valid: entry.valid,
                count: entry.count,
            })
            .collect()
    }

    /// Snapshot of the trajectory in admission order.
    #[must_use]
    pub fn trajectory(&self) -> Vec<Arc<Event>> {
        self.trajectory.lock().expect("lock poisoned").clone()
    }

    /// Snapshot of the forensic log in rejection order.
    #[must_use]
    pub fn forensics(&self) -> Vec<Arc<Event>> {
        self.forensics.lock().expect("lock poisoned").clone()
    }

    /// Snapshot of the declared pseudonyms.
    #[must_use]
    pub fn pseudonyms(&self) -> Vec<Digest> {
        self.pseudonyms.lock().expect("lock poisoned").clone()
    }

    /// Whether the platform aggregate has been folded in.
    #[must_use]
    pub fn have_aggregate(&self) -> bool {
        *self.have_aggregate.lock().expect("lock poisoned")
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("algorithm", &self.alg.name())
            .field("domain_id", &self.domain_id)
            .field("points", &self.points.lock().expect("lock poisoned").entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Credentials;
    use proptest::prelude::*;

    fn test_model() -> Model {
        Model::new(
            DigestAlgorithm::Sha256,
            Arc::new(TrustRoot::without_hardware()),
            1,
            8,
        )
        .unwrap()
    }

    fn test_task() -> Arc<TaskState> {
        TaskState::new(9, "model-test", Credentials::default())
    }

    fn coefficient(tag: &[u8]) -> Digest {
        DigestAlgorithm::Sha256.digest(tag)
    }

    fn mapped_event(tag: &[u8]) -> Arc<Event> {
        Arc::new(Event::synthetic(coefficient(tag)))
    }

    /// Recomputes the expected measurement fold over a coefficient
    /// sequence.
    fn expected_measurement(alg: DigestAlgorithm, base: &Digest, points: &[Digest]) -> Digest {
        let mut measurement = Digest::zeroed(alg.digest_size());
        for point in points {
            let mut host = alg.context();
            host.update(base.as_bytes());
            let host = host.finup(point.as_bytes());
            let mut cx = alg.context();
            cx.update(measurement.as_bytes());
            measurement = cx.finup(host.as_bytes());
        }
        measurement
    }

    #[test]
    fn duplicate_coefficient_only_increments_count() {
        let model = test_model();
        let task = test_task();

        model.event(false, &task, &mapped_event(b"a")).unwrap();
        let measurement = model.measurement();

        model.event(false, &task, &mapped_event(b"a")).unwrap();
        let points = model.points();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].count, 2);
        assert_eq!(model.trajectory().len(), 1);
        assert_eq!(model.measurement(), measurement);
        assert_eq!(task.trust_status(), crate::task::TrustStatus::Trusted);
    }

    #[test]
    fn sealed_novel_coefficient_is_forensic() {
        let model = test_model();
        let task = test_task();

        model.event(false, &task, &mapped_event(b"a")).unwrap();
        model.event(true, &task, &mapped_event(b"b")).unwrap();

        assert_eq!(model.trajectory().len(), 1);
        assert_eq!(model.forensics().len(), 1);
        let points = model.points();
        assert_eq!(points.len(), 2);
        assert!(points[0].valid);
        assert!(!points[1].valid);
        assert_eq!(task.trust_status(), crate::task::TrustStatus::Untrusted);
    }

    #[test]
    fn replaying_invalid_coefficient_marks_untrusted() {
        let model = test_model();
        let first = test_task();
        model.event(true, &first, &mapped_event(b"bad")).unwrap();

        let second = test_task();
        model.event(true, &second, &mapped_event(b"bad")).unwrap();
        assert_eq!(second.trust_status(), crate::task::TrustStatus::Untrusted);
        assert_eq!(model.points()[0].count, 2);
    }

    #[test]
    fn measurement_is_order_dependent_fold() {
        let model = test_model();
        let task = test_task();
        let base = DigestAlgorithm::Sha256.digest(b"base");
        model.load_base(base);

        let tags: [&[u8]; 3] = [b"a", b"b", b"c"];
        for tag in tags {
            model.event(false, &task, &mapped_event(tag)).unwrap();
        }

        let points: Vec<Digest> = tags.iter().map(|tag| coefficient(tag)).collect();
        assert_eq!(
            model.measurement(),
            expected_measurement(DigestAlgorithm::Sha256, &base, &points)
        );
    }

    #[test]
    fn base_separates_measurements() {
        let with_base = test_model();
        with_base.load_base(DigestAlgorithm::Sha256.digest(b"base"));
        let without_base = test_model();

        let task = test_task();
        with_base.event(false, &task, &mapped_event(b"a")).unwrap();
        without_base
            .event(false, &task, &mapped_event(b"a"))
            .unwrap();
        assert_ne!(with_base.measurement(), without_base.measurement());
    }

    #[test]
    fn state_is_order_independent() {
        let forward = test_model();
        let reverse = test_model();
        let task = test_task();

        let tags: [&[u8]; 4] = [b"a", b"b", b"c", b"d"];
        for tag in tags {
            forward.event(false, &task, &mapped_event(tag)).unwrap();
        }
        for tag in tags.iter().rev() {
            reverse.event(false, &task, &mapped_event(tag)).unwrap();
        }

        forward.compute_state();
        reverse.compute_state();
        assert_eq!(forward.state(), reverse.state());
        assert_ne!(forward.measurement(), reverse.measurement());
    }

    #[test]
    fn load_point_injects_aggregate_once() {
        let model = test_model();
        assert!(!model.have_aggregate());

        model.load_point(coefficient(b"p1")).unwrap();
        assert!(model.have_aggregate());
        let measurement = model.measurement();

        // Duplicate load is a no-op.
        model.load_point(coefficient(b"p1")).unwrap();
        assert_eq!(model.measurement(), measurement);

        model.load_point(coefficient(b"p2")).unwrap();
        assert_eq!(model.points().len(), 2);
    }

    #[test]
    fn loaded_points_admit_silently() {
        let model = test_model();
        let task = test_task();
        model.load_point(coefficient(b"known")).unwrap();

        model.event(true, &task, &mapped_event(b"known")).unwrap();
        assert_eq!(task.trust_status(), crate::task::TrustStatus::Trusted);
        assert!(model.forensics().is_empty());
    }

    #[test]
    fn pseudonym_declaration_is_idempotent() {
        let model = test_model();
        let pseudonym = pseudonym_digest(DigestAlgorithm::Sha256, "/etc/passwd");
        model.load_pseudonym(pseudonym);
        model.load_pseudonym(pseudonym);
        assert_eq!(model.pseudonyms().len(), 1);
        assert!(model.has_pseudonym(DigestAlgorithm::Sha256, "/etc/passwd"));
        assert!(!model.has_pseudonym(DigestAlgorithm::Sha256, "/etc/shadow"));
    }

    proptest! {
        /// Any permutation of the same coefficient multiset yields the
        /// same state.
        #[test]
        fn state_commutes_over_permutations(
            mut tags in proptest::collection::vec(0u16..64, 1..24),
        ) {
            let forward = test_model();
            let reverse = test_model();
            let task = test_task();

            for tag in &tags {
                let event = mapped_event(&tag.to_le_bytes());
                forward.event(false, &task, &event).unwrap();
            }
            tags.reverse();
            for tag in &tags {
                let event = mapped_event(&tag.to_le_bytes());
                reverse.event(false, &task, &event).unwrap();
            }

            forward.compute_state();
            reverse.compute_state();
            prop_assert_eq!(forward.state(), reverse.state());
        }
    }
}
