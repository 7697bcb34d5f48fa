use blake3::{hash, keyed_hash};

use crate::hex::HexDisplayExt;

/// Turns a plaintext password into the digest that is stored and sent
/// between nodes. Injected wherever a [`User`](super::User) gets a password,
/// so nodes that share a user base can agree on a keyed hasher.
pub trait PasswordHasher: Send + Sync {
    fn hash(&self, plaintext: &str) -> String;
}

/// blake3 digest, keyed when a deployment-wide key is configured.
#[derive(Clone, Default)]
pub struct Blake3Hasher {
    key: Option<[u8; 32]>,
}

impl Blake3Hasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keyed(key: [u8; 32]) -> Self {
        Self { key: Some(key) }
    }
}

impl PasswordHasher for Blake3Hasher {
    fn hash(&self, plaintext: &str) -> String {
        let digest = match &self.key {
            Some(key) => keyed_hash(key, plaintext.as_bytes()),
            None => hash(plaintext.as_bytes()),
        };
        digest.as_bytes().hex().to_string()
    }
}
