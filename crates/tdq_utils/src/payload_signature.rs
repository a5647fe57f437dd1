//! The shared secret that authenticates workers to the queue.
//!
//! The queue generates a signature at startup and hands it to each worker on registration.
//! Every later worker request must carry it back.

use std::{fmt, str::FromStr};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

const SIGNATURE_LEN: usize = 30;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PayloadSignature([u8; SIGNATURE_LEN]);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("payload signature must be {SIGNATURE_LEN} ascii alphanumeric characters")]
pub struct InvalidSignature;

impl PayloadSignature {
    /// Creates a new, randomly generated signature.
    pub fn new_random() -> Self {
        // ChaCha20 seeded from the OS entropy source.
        let mut rng: ChaCha20Rng = SeedableRng::from_entropy();
        let mut buf = [0; SIGNATURE_LEN];
        for b in buf.iter_mut() {
            *b = rng.sample(rand::distributions::Alphanumeric);
        }
        Self(buf)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, InvalidSignature> {
        if bytes.len() != SIGNATURE_LEN || !bytes.iter().all(u8::is_ascii_alphanumeric) {
            return Err(InvalidSignature);
        }
        let mut buf = [0; SIGNATURE_LEN];
        buf.copy_from_slice(bytes);
        Ok(Self(buf))
    }

    fn as_str(&self) -> &str {
        // Only ever constructed from ascii alphanumerics.
        std::str::from_utf8(&self.0).unwrap_or_default()
    }
}

impl FromStr for PayloadSignature {
    type Err = InvalidSignature;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_bytes(s.as_bytes())
    }
}

impl fmt::Display for PayloadSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for PayloadSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PayloadSignature(<redacted>)")
    }
}

impl Serialize for PayloadSignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PayloadSignature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
