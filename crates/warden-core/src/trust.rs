//! Hardware root of trust integration.
//!
//! Internally modeled domains anchor their measurements in the platform:
//! the aggregate over the first eight PCRs seeds every model, and the
//! root domain chains each admitted coefficient into a configured PCR.
//! Extensions run on a single ordered worker so the PCR sees coefficients
//! in admission order; the worker retains each event until its extension
//! completes.
//!
//! Absent hardware degrades to a fixed zero aggregate, reported once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use crate::digest::{Digest, DigestAlgorithm};
use crate::errors::EngineError;
use crate::event::Event;

/// PCR index the root model extends when none is configured.
pub const DEFAULT_ROOT_MODEL_PCR: u32 = 11;

/// Number of PCRs folded into the platform aggregate.
const AGGREGATE_PCRS: u32 = 8;

/// Hash banks a PCR device may expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum PcrBankAlgorithm {
    /// SHA-1 bank, 20-byte digests.
    Sha1,
    /// SHA-256 bank, 32-byte digests.
    Sha256,
}

impl PcrBankAlgorithm {
    /// Digest size of the bank in bytes.
    #[must_use]
    pub const fn digest_size(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
        }
    }
}

/// One digest destined for a bank during an extension.
#[derive(Debug, Clone)]
pub struct PcrExtendDigest {
    /// Target bank.
    pub bank: PcrBankAlgorithm,
    /// Digest bytes sized to the bank.
    pub digest: Vec<u8>,
}

/// The platform trust device consumed from the embedding layer.
pub trait TpmProvider: Send + Sync {
    /// The banks the device has allocated.
    fn banks(&self) -> Vec<PcrBankAlgorithm>;

    /// Reads one PCR of one bank.
    ///
    /// # Errors
    ///
    /// Propagates device failures.
    fn pcr_read(&self, bank: PcrBankAlgorithm, index: u32) -> Result<Vec<u8>, EngineError>;

    /// Extends one PCR across the given banks.
    ///
    /// # Errors
    ///
    /// Propagates device failures.
    fn pcr_extend(&self, index: u32, digests: &[PcrExtendDigest]) -> Result<(), EngineError>;
}

struct ExtendJob {
    event: Arc<Event>,
}

/// Platform aggregate computation and chained PCR extension.
pub struct TrustRoot {
    tpm: Option<Arc<dyn TpmProvider>>,
    pcr_index: u32,
    aggregates: Mutex<HashMap<&'static str, Digest>>,
    extend_tx: Option<mpsc::Sender<ExtendJob>>,
    worker: Option<thread::JoinHandle<()>>,
    warned_missing: AtomicBool,
}

impl TrustRoot {
    /// Creates the trust root. With `tpm == None` every aggregate is the
    /// zero aggregate and extensions are dropped.
    #[must_use]
    pub fn new(tpm: Option<Arc<dyn TpmProvider>>, pcr_index: u32) -> Self {
        let (extend_tx, worker) = match &tpm {
            Some(tpm) => {
                let tpm = Arc::clone(tpm);
                let (tx, rx) = mpsc::channel::<ExtendJob>();
                let worker = thread::Builder::new()
                    .name("pcr-extend".to_string())
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            extend_worker(tpm.as_ref(), pcr_index, &job.event);
                        }
                    })
                    .ok();
                match worker {
                    Some(worker) => (Some(tx), Some(worker)),
                    None => (None, None),
                }
            },
            None => (None, None),
        };

        Self {
            tpm,
            pcr_index,
            aggregates: Mutex::new(HashMap::new()),
            extend_tx,
            worker,
            warned_missing: AtomicBool::new(false),
        }
    }

    /// A trust root without hardware.
    #[must_use]
    pub fn without_hardware() -> Self {
        Self::new(None, DEFAULT_ROOT_MODEL_PCR)
    }

    /// The PCR index extended by the root model.
    #[must_use]
    pub const fn pcr_index(&self) -> u32 {
        self.pcr_index
    }

    /// Returns the platform aggregate encoded with `alg`, memoized per
    /// algorithm.
    ///
    /// The aggregate is the chain over the first eight PCR readings of
    /// the preferred bank. Without hardware, or on a read failure, the
    /// zero aggregate is returned and a warning logged.
    #[must_use]
    pub fn aggregate(&self, alg: DigestAlgorithm) -> Digest {
        let Some(tpm) = &self.tpm else {
            if !self.warned_missing.swap(true, Ordering::Relaxed) {
                tracing::warn!("no hardware trust device, using zero aggregate");
            }
            return Digest::zeroed(alg.digest_size());
        };

        let mut aggregates = self.aggregates.lock().expect("lock poisoned");
        if let Some(value) = aggregates.get(alg.name()) {
            return *value;
        }

        match compute_aggregate(tpm.as_ref(), alg) {
            Ok(value) => {
                aggregates.insert(alg.name(), value);
                value
            },
            Err(err) => {
                tracing::warn!(error = %err, "error generating platform aggregate");
                Digest::zeroed(alg.digest_size())
            },
        }
    }

    /// Queues an asynchronous extension of the configured PCR with the
    /// event's coefficient. The event is retained until the extension
    /// completes; failures are logged and never fail the caller.
    pub fn extend(&self, event: &Arc<Event>) {
        if let Some(tx) = &self.extend_tx {
            let _ = tx.send(ExtendJob {
                event: Arc::clone(event),
            });
        }
    }
}

impl Drop for TrustRoot {
    fn drop(&mut self) {
        drop(self.extend_tx.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for TrustRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustRoot")
            .field("hardware", &self.tpm.is_some())
            .field("pcr_index", &self.pcr_index)
            .finish()
    }
}

fn preferred_bank(tpm: &dyn TpmProvider) -> Option<PcrBankAlgorithm> {
    let banks = tpm.banks();
    if banks.contains(&PcrBankAlgorithm::Sha256) {
        Some(PcrBankAlgorithm::Sha256)
    } else {
        banks.first().copied()
    }
}

fn compute_aggregate(tpm: &dyn TpmProvider, alg: DigestAlgorithm) -> Result<Digest, EngineError> {
    let bank = preferred_bank(tpm).ok_or(EngineError::NotAvailable)?;
    let mut cx = alg.context();
    for index in 0..AGGREGATE_PCRS {
        let reading = tpm.pcr_read(bank, index)?;
        cx.update(&reading[..bank.digest_size().min(reading.len())]);
    }
    Ok(cx.finish())
}

fn extend_worker(tpm: &dyn TpmProvider, pcr_index: u32, event: &Arc<Event>) {
    let coefficient = event.coefficient();
    let digests: Vec<PcrExtendDigest> = tpm
        .banks()
        .into_iter()
        .map(|bank| {
            // Truncate or zero-pad the coefficient to the bank size.
            let mut digest = vec![0u8; bank.digest_size()];
            let amount = bank.digest_size().min(event.digest_size);
            digest[..amount].copy_from_slice(&coefficient.as_bytes()[..amount]);
            PcrExtendDigest { bank, digest }
        })
        .collect();

    if let Err(err) = tpm.pcr_extend(pcr_index, &digests) {
        tracing::warn!(error = %err, pcr = pcr_index, "failed hardware trust update");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    /// A software PCR device: per-bank registers extended by hash
    /// chaining, recording every extension.
    struct FakeTpm {
        banks: Vec<PcrBankAlgorithm>,
        extensions: Mutex<Vec<Vec<PcrExtendDigest>>>,
        fail_reads: bool,
    }

    impl FakeTpm {
        fn new(banks: Vec<PcrBankAlgorithm>) -> Self {
            Self {
                banks,
                extensions: Mutex::new(Vec::new()),
                fail_reads: false,
            }
        }
    }

    impl TpmProvider for FakeTpm {
        fn banks(&self) -> Vec<PcrBankAlgorithm> {
            self.banks.clone()
        }

        fn pcr_read(&self, bank: PcrBankAlgorithm, index: u32) -> Result<Vec<u8>, EngineError> {
            if self.fail_reads {
                return Err(EngineError::NotAvailable);
            }
            let mut reading = vec![0u8; bank.digest_size()];
            reading[0] = index as u8;
            Ok(reading)
        }

        fn pcr_extend(&self, _index: u32, digests: &[PcrExtendDigest]) -> Result<(), EngineError> {
            self.extensions
                .lock()
                .expect("lock poisoned")
                .push(digests.to_vec());
            Ok(())
        }
    }

    #[test]
    fn missing_hardware_yields_zero_aggregate() {
        let trust = TrustRoot::without_hardware();
        let aggregate = trust.aggregate(DigestAlgorithm::Sha256);
        assert_eq!(aggregate, Digest::zeroed(32));
    }

    #[test]
    fn aggregate_is_memoized_per_algorithm() {
        let tpm = Arc::new(FakeTpm::new(vec![PcrBankAlgorithm::Sha256]));
        let trust = TrustRoot::new(Some(tpm), DEFAULT_ROOT_MODEL_PCR);

        let first = trust.aggregate(DigestAlgorithm::Sha256);
        let second = trust.aggregate(DigestAlgorithm::Sha256);
        assert_eq!(first, second);
        assert_ne!(first, Digest::zeroed(32));

        let other = trust.aggregate(DigestAlgorithm::Sha384);
        assert_eq!(other.size(), 48);
        assert_ne!(other.as_bytes(), first.as_bytes());
    }

    #[test]
    fn read_failure_degrades_to_zero_aggregate() {
        let mut tpm = FakeTpm::new(vec![PcrBankAlgorithm::Sha256]);
        tpm.fail_reads = true;
        let trust = TrustRoot::new(Some(Arc::new(tpm)), DEFAULT_ROOT_MODEL_PCR);
        assert_eq!(trust.aggregate(DigestAlgorithm::Sha256), Digest::zeroed(32));
    }

    #[test]
    fn extension_truncates_and_pads_per_bank() {
        let tpm = Arc::new(FakeTpm::new(vec![
            PcrBankAlgorithm::Sha1,
            PcrBankAlgorithm::Sha256,
        ]));
        let trust = TrustRoot::new(
            Some(Arc::clone(&tpm) as Arc<dyn TpmProvider>),
            DEFAULT_ROOT_MODEL_PCR,
        );

        let coefficient = DigestAlgorithm::Sha256.digest(b"event");
        let event = Arc::new(Event::synthetic(coefficient));
        trust.extend(&event);

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let extensions = tpm.extensions.lock().expect("lock poisoned");
            if !extensions.is_empty() {
                let digests = &extensions[0];
                assert_eq!(digests.len(), 2);
                let sha1 = digests
                    .iter()
                    .find(|d| d.bank == PcrBankAlgorithm::Sha1)
                    .unwrap();
                assert_eq!(sha1.digest, coefficient.as_bytes()[..20].to_vec());
                let sha256 = digests
                    .iter()
                    .find(|d| d.bank == PcrBankAlgorithm::Sha256)
                    .unwrap();
                assert_eq!(sha256.digest, coefficient.as_bytes().to_vec());
                break;
            }
            drop(extensions);
            assert!(Instant::now() < deadline, "extension never ran");
            thread::yield_now();
        }
    }

    #[test]
    fn extensions_preserve_order() {
        let tpm = Arc::new(FakeTpm::new(vec![PcrBankAlgorithm::Sha256]));
        let trust = TrustRoot::new(
            Some(Arc::clone(&tpm) as Arc<dyn TpmProvider>),
            DEFAULT_ROOT_MODEL_PCR,
        );

        let coefficients: Vec<Digest> = (0u8..8)
            .map(|n| DigestAlgorithm::Sha256.digest(&[n]))
            .collect();
        for coefficient in &coefficients {
            trust.extend(&Arc::new(Event::synthetic(*coefficient)));
        }
        drop(trust); // joins the worker, flushing the queue

        let extensions = tpm.extensions.lock().expect("lock poisoned");
        assert_eq!(extensions.len(), coefficients.len());
        for (recorded, expected) in extensions.iter().zip(&coefficients) {
            assert_eq!(recorded[0].digest, expected.as_bytes().to_vec());
        }
    }
}
