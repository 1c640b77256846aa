//! Password hashing contract consumed by SessionService.
//!
//! The default implementation is salted, iterated SHA-256 with a tunable
//! work factor, encoded as `iter$salt$digest` (base64 fields). Verify is
//! deterministic for a given hash string and compares in constant time.

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine};
use rand::RngCore;
use sha2::{Digest, Sha256};

pub trait CredentialVerifier: Send + Sync {
    fn hash(&self, password: &str) -> String;
    fn verify(&self, password: &str, hash: &str) -> bool;
}

const SALT_LEN: usize = 16;

/// Default verifier. The iteration count is baked into each hash string,
/// so raising the work factor later leaves existing hashes verifiable.
pub struct IteratedSha256 {
    iterations: u32,
}

impl IteratedSha256 {
    pub fn new(iterations: u32) -> Self {
        Self {
            iterations: iterations.max(1),
        }
    }

    fn digest(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(password.as_bytes());
        let mut out: [u8; 32] = hasher.finalize().into();
        for _ in 1..iterations {
            let mut hasher = Sha256::new();
            hasher.update(out);
            hasher.update(salt);
            out = hasher.finalize().into();
        }
        out
    }
}

impl Default for IteratedSha256 {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl CredentialVerifier for IteratedSha256 {
    fn hash(&self, password: &str) -> String {
        let mut salt = [0u8; SALT_LEN];
        rand::rng().fill_bytes(&mut salt);
        let digest = Self::digest(password, &salt, self.iterations);
        format!(
            "{}${}${}",
            self.iterations,
            STANDARD_NO_PAD.encode(salt),
            STANDARD_NO_PAD.encode(digest)
        )
    }

    fn verify(&self, password: &str, hash: &str) -> bool {
        let mut parts = hash.splitn(3, '$');
        let (Some(iter_str), Some(salt_b64), Some(digest_b64)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return false;
        };
        let Ok(iterations) = iter_str.parse::<u32>() else {
            return false;
        };
        let (Ok(salt), Ok(expected)) = (
            STANDARD_NO_PAD.decode(salt_b64),
            STANDARD_NO_PAD.decode(digest_b64),
        ) else {
            return false;
        };
        let actual = Self::digest(password, &salt, iterations.max(1));
        constant_time_eq(&actual, &expected)
    }
}

/// Compare two digests without short-circuiting on the first mismatch, so
/// comparison time leaks nothing about where they diverge.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
