//! Pre-allocated object magazines.
//!
//! Security hooks can fire in contexts that must not block, so every
//! modeling domain keeps a fixed-capacity cache of pre-allocated, zeroed
//! objects. A non-blocking acquire takes the first free slot and reserves
//! it; a background worker replenishes the slot with a fresh allocation
//! and then publishes it again.
//!
//! Publication order matters: the fresh object is installed in the slot
//! before the reservation bit is cleared, with a release store paired
//! against the acquire on the consumer side, so a consumer that wins the
//! reservation always observes the installed object.
//!
//! Capacity is fixed for the lifetime of the owning domain; there is no
//! resize path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::errors::EngineError;

/// Minimum interval between exhaustion warnings per magazine.
const WARN_INTERVAL: Duration = Duration::from_secs(1);

struct Slot<T> {
    /// True while the slot is reserved: taken by a consumer and not yet
    /// replenished. The paired release/acquire on this flag publishes the
    /// object installed under `value`.
    reserved: AtomicBool,
    value: Mutex<Option<Box<T>>>,
}

struct Shared<T> {
    slots: Vec<Slot<T>>,
    label: &'static str,
    domain_id: u64,
    warn_after: Mutex<Option<Instant>>,
}

impl<T: Default> Shared<T> {
    fn refill_slot(&self, index: usize) {
        let fresh = Box::new(T::default());
        *self.slots[index].value.lock().expect("lock poisoned") = Some(fresh);
        self.slots[index].reserved.store(false, Ordering::Release);
    }

    fn warn_allowed(&self) -> bool {
        let mut gate = self.warn_after.lock().expect("lock poisoned");
        let now = Instant::now();
        match *gate {
            Some(last) if now.duration_since(last) < WARN_INTERVAL => false,
            _ => {
                *gate = Some(now);
                true
            },
        }
    }
}

enum RefillDriver {
    Background {
        tx: Option<mpsc::Sender<usize>>,
        worker: Option<thread::JoinHandle<()>>,
    },
    /// Refills are queued and only applied by an explicit pump call.
    /// Unit tests use this to pin down the exhaustion window.
    #[cfg(test)]
    Manual { pending: Mutex<Vec<usize>> },
}

/// A fixed-capacity cache of pre-allocated objects with background
/// replenishment.
pub struct Magazine<T: Default + Send + 'static> {
    shared: Arc<Shared<T>>,
    driver: RefillDriver,
}

impl<T: Default + Send + 'static> Magazine<T> {
    /// Builds a magazine with `capacity` pre-allocated objects and starts
    /// its refill worker.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::OutOfMemory`] if the worker thread cannot
    /// be spawned; the owning domain treats this as fatal and rolls back.
    pub fn new(capacity: usize, label: &'static str, domain_id: u64) -> Result<Self, EngineError> {
        let shared = Arc::new(Self::build_shared(capacity, label, domain_id));
        let (tx, rx) = mpsc::channel::<usize>();
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(format!("{label}-refill"))
            .spawn(move || {
                while let Ok(index) = rx.recv() {
                    worker_shared.refill_slot(index);
                }
            })
            .map_err(|_| EngineError::OutOfMemory {
                context: "magazine refill worker",
            })?;

        Ok(Self {
            shared,
            driver: RefillDriver::Background {
                tx: Some(tx),
                worker: Some(worker),
            },
        })
    }

    /// Builds a magazine whose refills only land when [`Self::pump_refills`]
    /// runs.
    #[cfg(test)]
    fn with_manual_refill(capacity: usize, label: &'static str, domain_id: u64) -> Self {
        Self {
            shared: Arc::new(Self::build_shared(capacity, label, domain_id)),
            driver: RefillDriver::Manual {
                pending: Mutex::new(Vec::new()),
            },
        }
    }

    fn build_shared(capacity: usize, label: &'static str, domain_id: u64) -> Shared<T> {
        let slots = (0..capacity)
            .map(|_| Slot {
                reserved: AtomicBool::new(false),
                value: Mutex::new(Some(Box::new(T::default()))),
            })
            .collect();
        Shared {
            slots,
            label,
            domain_id,
            warn_after: Mutex::new(None),
        }
    }

    /// Acquires a zeroed object.
    ///
    /// With `locked == false` this is a direct allocation and always
    /// succeeds. With `locked == true` the first free magazine slot is
    /// reserved and its pre-allocated object returned; a refill is queued
    /// for the slot. Returns `None` on exhaustion, after a rate-limited
    /// warning naming the calling task and the owning domain.
    pub fn acquire(&self, locked: bool, comm: &str) -> Option<Box<T>> {
        if !locked {
            return Some(Box::new(T::default()));
        }

        for (index, slot) in self.shared.slots.iter().enumerate() {
            if slot
                .reserved
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            let taken = slot.value.lock().expect("lock poisoned").take();
            self.request_refill(index);
            match taken {
                Some(object) => return Some(object),
                // A cleared reservation always has an installed object;
                // repair the slot and keep scanning.
                None => continue,
            }
        }

        if self.shared.warn_allowed() {
            tracing::warn!(
                task = comm,
                domain = self.shared.domain_id,
                capacity = self.shared.slots.len(),
                "{} magazine exhausted",
                self.shared.label,
            );
        }
        None
    }

    /// Returns an object to the underlying allocator.
    ///
    /// Objects never re-enter the magazine; slots are replenished with
    /// fresh allocations by the refill worker.
    pub fn release(&self, object: Box<T>) {
        drop(object);
    }

    /// Number of slots currently available for non-blocking acquire.
    #[must_use]
    pub fn available(&self) -> usize {
        self.shared
            .slots
            .iter()
            .filter(|slot| !slot.reserved.load(Ordering::Acquire))
            .count()
    }

    /// Total slot count.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.slots.len()
    }

    fn request_refill(&self, index: usize) {
        match &self.driver {
            RefillDriver::Background { tx, .. } => {
                if let Some(tx) = tx {
                    // A send failure means the worker is gone during
                    // teardown; the slot simply stays reserved.
                    let _ = tx.send(index);
                }
            },
            #[cfg(test)]
            RefillDriver::Manual { pending } => {
                pending.lock().expect("lock poisoned").push(index);
            },
        }
    }

    /// Applies all queued refills. Manual-refill magazines only.
    #[cfg(test)]
    fn pump_refills(&self) {
        if let RefillDriver::Manual { pending } = &self.driver {
            let drained: Vec<usize> = pending.lock().expect("lock poisoned").drain(..).collect();
            for index in drained {
                self.shared.refill_slot(index);
            }
        }
    }
}

impl<T: Default + Send + 'static> Drop for Magazine<T> {
    fn drop(&mut self) {
        match &mut self.driver {
            RefillDriver::Background { tx, worker } => {
                drop(tx.take());
                if let Some(handle) = worker.take() {
                    let _ = handle.join();
                }
            },
            #[cfg(test)]
            RefillDriver::Manual { .. } => {},
        }
    }
}

impl<T: Default + Send + 'static> std::fmt::Debug for Magazine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Magazine")
            .field("label", &self.shared.label)
            .field("domain_id", &self.shared.domain_id)
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Payload {
        value: u64,
    }

    #[test]
    fn unlocked_acquire_always_succeeds() {
        let magazine: Magazine<Payload> = Magazine::with_manual_refill(1, "test", 0);
        for _ in 0..16 {
            assert!(magazine.acquire(false, "proc").is_some());
        }
        assert_eq!(magazine.available(), 1);
    }

    #[test]
    fn locked_acquire_exhausts_and_recovers() {
        let magazine: Magazine<Payload> = Magazine::with_manual_refill(1, "test", 7);

        let first = magazine.acquire(true, "proc");
        assert!(first.is_some());
        // Back-to-back acquire without yielding: the single slot is still
        // reserved, so allocation fails.
        assert!(magazine.acquire(true, "proc").is_none());
        assert_eq!(magazine.available(), 0);

        magazine.pump_refills();
        assert_eq!(magazine.available(), 1);
        assert!(magazine.acquire(true, "proc").is_some());
    }

    #[test]
    fn acquired_objects_are_zeroed() {
        let magazine: Magazine<Payload> = Magazine::with_manual_refill(2, "test", 0);
        let object = magazine.acquire(true, "proc").unwrap();
        assert_eq!(object.value, 0);
        magazine.release(object);
    }

    #[test]
    fn refill_replaces_consumed_slots() {
        let magazine: Magazine<Payload> = Magazine::with_manual_refill(3, "test", 0);
        let a = magazine.acquire(true, "proc").unwrap();
        let b = magazine.acquire(true, "proc").unwrap();
        assert_eq!(magazine.available(), 1);
        magazine.pump_refills();
        assert_eq!(magazine.available(), 3);
        magazine.release(a);
        magazine.release(b);
    }

    #[test]
    fn background_worker_refills() {
        let magazine: Magazine<Payload> = Magazine::new(1, "test", 0).unwrap();
        assert!(magazine.acquire(true, "proc").is_some());
        // The worker runs asynchronously; poll until the slot returns.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(object) = magazine.acquire(true, "proc") {
                magazine.release(object);
                break;
            }
            assert!(Instant::now() < deadline, "refill never landed");
            thread::yield_now();
        }
    }

    #[test]
    fn concurrent_locked_acquires_never_duplicate() {
        let magazine: Arc<Magazine<Payload>> = Arc::new(Magazine::new(8, "test", 0).unwrap());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let magazine = Arc::clone(&magazine);
            handles.push(thread::spawn(move || {
                let mut got = 0usize;
                for _ in 0..64 {
                    if let Some(object) = magazine.acquire(true, "proc") {
                        got += 1;
                        magazine.release(object);
                    }
                }
                got
            }));
        }
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert!(total > 0);
    }
}
