//! Streaming MD5 digest.
//!
//! Used to fingerprint data written to flash and to check the digests the
//! device reports for flash regions.

use {
    crate::error::{Error, Result},
    md5::{Digest, Md5},
};

/// Length of an MD5 digest in bytes.
pub const DIGEST_LEN: usize = 16;

/// Incremental MD5 that freezes once its digest has been taken.
#[derive(Debug, Clone, Default)]
pub struct Md5Digest {
    hasher: Option<Md5>,
    result: Option<[u8; DIGEST_LEN]>,
}

impl Md5Digest {
    /// Create an empty digest.
    pub fn new() -> Self {
        Self {
            hasher: Some(Md5::new()),
            result: None,
        }
    }

    /// Absorb more bytes.
    ///
    /// Fails with [`Error::DigestFinalized`] once [`digest`](Self::digest)
    /// has been called.
    pub fn update(&mut self, data: &[u8]) -> Result<()> {
        match self.hasher.as_mut() {
            Some(hasher) => {
                hasher.update(data);
                Ok(())
            },
            None => Err(Error::DigestFinalized),
        }
    }

    /// Finish and return the digest. Repeated calls return the same bytes.
    pub fn digest(&mut self) -> [u8; DIGEST_LEN] {
        if let Some(result) = self.result {
            return result;
        }
        let hasher = self.hasher.take().unwrap_or_default();
        let result: [u8; DIGEST_LEN] = hasher.finalize().into();
        self.result = Some(result);
        result
    }

    /// Finish and return the digest as lowercase hex.
    pub fn hex_digest(&mut self) -> String {
        hex::encode(self.digest())
    }

    /// Whether the digest has been taken.
    pub fn is_finalized(&self) -> bool {
        self.result.is_some()
    }
}

/// One-shot MD5 of `data`.
pub fn md5(data: &[u8]) -> [u8; DIGEST_LEN] {
    Md5::digest(data).into()
}

/// One-shot MD5 of `data` as lowercase hex.
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(md5(data))
}

/// Compare two hex digests, ignoring case.
pub fn hex_eq(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}
