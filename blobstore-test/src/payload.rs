//! Deterministic object payloads.

use std::io;

use bytes::Bytes;
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};

/// A reproducible stream of pseudo-random bytes.
///
/// Two payloads with the same seed and length always produce identical contents, so tests can
/// regenerate the expected bytes instead of keeping them around.
#[derive(Debug)]
pub struct Payload {
    len: u64,
    rng: SmallRng,
}

impl Payload {
    /// Creates a payload of `len` bytes derived from `seed`.
    pub fn new(seed: u64, len: u64) -> Self {
        let rng = SmallRng::seed_from_u64(seed);
        Self { len, rng }
    }

    /// Remaining number of bytes.
    pub fn remaining(&self) -> u64 {
        self.len
    }

    /// Collects the remaining bytes into a buffer.
    pub fn into_bytes(mut self) -> Bytes {
        let mut buf = vec![0; self.len as usize];
        self.rng.fill_bytes(&mut buf);
        self.len = 0;
        buf.into()
    }
}

impl io::Read for Payload {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = buf.len().min(self.len as usize);
        self.rng.fill_bytes(&mut buf[..len]);
        self.len -= len as u64;
        Ok(len)
    }
}

/// Returns `len` deterministic bytes for the given `seed`.
pub fn bytes(seed: u64, len: usize) -> Bytes {
    Payload::new(seed, len as u64).into_bytes()
}
