//! Digest façade over the supported hash primitives.
//!
//! Every modeling domain selects one hash function by name at creation
//! time. All coefficients, measurements, and state values inside that
//! domain are digests of that single function, so the engine only ever
//! deals in the fixed-width [`Digest`] value type plus a streaming
//! [`DigestContext`].
//!
//! The zero digest of a domain is the digest of empty input. It stands in
//! for content identity whenever the engine deliberately erases it (empty
//! files, pseudonymized paths, unknown socket address families).

use std::fmt;

use sha2::Digest as _;

use crate::errors::DigestError;

/// Largest digest size any supported algorithm produces, in bytes.
pub const MAX_DIGEST_SIZE: usize = 64;

/// A fixed-width digest value.
///
/// Identity is byte-equality over the active prefix; the storage beyond
/// `size` is always zero, so derived equality and ordering behave as
/// byte-lexicographic comparison of the active bytes for values of equal
/// size. Within a domain all digests share one size.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    size: u8,
    bytes: [u8; MAX_DIGEST_SIZE],
}

impl Default for Digest {
    /// The zero-size placeholder, never equal to any computed digest.
    fn default() -> Self {
        Self {
            size: 0,
            bytes: [0u8; MAX_DIGEST_SIZE],
        }
    }
}

impl Digest {
    /// Builds a digest from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`DigestError::InvalidLength`] if `bytes` is empty or
    /// longer than [`MAX_DIGEST_SIZE`].
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DigestError> {
        if bytes.is_empty() || bytes.len() > MAX_DIGEST_SIZE {
            return Err(DigestError::InvalidLength {
                len: bytes.len(),
                max: MAX_DIGEST_SIZE,
            });
        }
        let mut out = [0u8; MAX_DIGEST_SIZE];
        out[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            size: bytes.len() as u8,
            bytes: out,
        })
    }

    /// Returns an all-zero digest of the given size.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero or exceeds [`MAX_DIGEST_SIZE`]; callers
    /// always pass an algorithm's digest size.
    #[must_use]
    pub fn zeroed(size: usize) -> Self {
        assert!(size > 0 && size <= MAX_DIGEST_SIZE);
        Self {
            size: size as u8,
            bytes: [0u8; MAX_DIGEST_SIZE],
        }
    }

    /// Decodes a lowercase or uppercase hex string.
    ///
    /// # Errors
    ///
    /// Returns [`DigestError::InvalidHex`] on malformed hex and
    /// [`DigestError::InvalidLength`] on an unusable decoded length.
    pub fn from_hex(hex_str: &str) -> Result<Self, DigestError> {
        let bytes = hex::decode(hex_str).map_err(|err| DigestError::InvalidHex {
            reason: err.to_string(),
        })?;
        Self::from_slice(&bytes)
    }

    /// The active digest bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.size as usize]
    }

    /// The digest size in bytes. Zero only for the default placeholder.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size as usize
    }

    /// True for the default placeholder value.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Lowercase hex encoding of the active bytes.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

/// The hash primitives a domain may select by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum DigestAlgorithm {
    /// SHA-256, 32-byte output.
    Sha256,
    /// SHA-384, 48-byte output.
    Sha384,
    /// SHA-512, 64-byte output.
    Sha512,
    /// BLAKE3, 32-byte output.
    Blake3,
}

impl DigestAlgorithm {
    /// Resolves an algorithm from its canonical name.
    ///
    /// # Errors
    ///
    /// Returns [`DigestError::UnknownAlgorithm`] for unrecognized names.
    pub fn from_name(name: &str) -> Result<Self, DigestError> {
        match name {
            "sha256" => Ok(Self::Sha256),
            "sha384" => Ok(Self::Sha384),
            "sha512" => Ok(Self::Sha512),
            "blake3" => Ok(Self::Blake3),
            other => Err(DigestError::UnknownAlgorithm {
                name: other.to_string(),
            }),
        }
    }

    /// The canonical name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
            Self::Blake3 => "blake3",
        }
    }

    /// Output size in bytes.
    #[must_use]
    pub const fn digest_size(self) -> usize {
        match self {
            Self::Sha256 | Self::Blake3 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }

    /// Starts a streaming digest context.
    #[must_use]
    pub fn context(self) -> DigestContext {
        let inner = match self {
            Self::Sha256 => ContextInner::Sha256(sha2::Sha256::new()),
            Self::Sha384 => ContextInner::Sha384(sha2::Sha384::new()),
            Self::Sha512 => ContextInner::Sha512(sha2::Sha512::new()),
            Self::Blake3 => ContextInner::Blake3(Box::new(blake3::Hasher::new())),
        };
        DigestContext { inner }
    }

    /// Single-shot digest of `data`.
    #[must_use]
    pub fn digest(self, data: &[u8]) -> Digest {
        let mut cx = self.context();
        cx.update(data);
        cx.finish()
    }

    /// The digest of empty input, stable per algorithm.
    #[must_use]
    pub fn zero_digest(self) -> Digest {
        self.digest(&[])
    }
}

enum ContextInner {
    Sha256(sha2::Sha256),
    Sha384(sha2::Sha384),
    Sha512(sha2::Sha512),
    Blake3(Box<blake3::Hasher>),
}

/// A streaming hash in progress.
pub struct DigestContext {
    inner: ContextInner,
}

impl DigestContext {
    /// Absorbs `data`.
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.inner {
            ContextInner::Sha256(h) => h.update(data),
            ContextInner::Sha384(h) => h.update(data),
            ContextInner::Sha512(h) => h.update(data),
            ContextInner::Blake3(h) => {
                h.update(data);
            },
        }
    }

    /// Finalizes and returns the digest.
    #[must_use]
    pub fn finish(self) -> Digest {
        let digest = match self.inner {
            ContextInner::Sha256(h) => Digest::from_slice(h.finalize().as_slice()),
            ContextInner::Sha384(h) => Digest::from_slice(h.finalize().as_slice()),
            ContextInner::Sha512(h) => Digest::from_slice(h.finalize().as_slice()),
            ContextInner::Blake3(h) => Digest::from_slice(h.finalize().as_bytes()),
        };
        digest.expect("hash output within MAX_DIGEST_SIZE")
    }

    /// Absorbs a final block of `data` and finalizes.
    #[must_use]
    pub fn finup(mut self, data: &[u8]) -> Digest {
        self.update(data);
        self.finish()
    }
}

impl fmt::Debug for DigestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.inner {
            ContextInner::Sha256(_) => "sha256",
            ContextInner::Sha384(_) => "sha384",
            ContextInner::Sha512(_) => "sha512",
            ContextInner::Blake3(_) => "blake3",
        };
        f.debug_struct("DigestContext").field("algorithm", &name).finish()
    }
}
