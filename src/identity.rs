use std::hash::Hash;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_seeder::SipHasher;
use russh::keys::{
    HashAlg, PrivateKey, PublicKey, decode_secret_key,
    ssh_key::{LineEnding, private::Ed25519Keypair},
};

use crate::error::ServerError;

/// The server's SSH host key, along with its SHA256 fingerprint.
///
/// Clients pin the gateway by this fingerprint, so the same seed must always
/// produce the same key across restarts.
#[derive(Debug)]
pub struct ServerIdentity {
    key: PrivateKey,
    fingerprint: String,
}

impl ServerIdentity {
    /// Derive an Ed25519 host key from a seed.
    ///
    /// An empty seed yields a random key instead.
    pub fn derive(seed: &str) -> Result<Self, ServerError> {
        let mut rng = if seed.is_empty() {
            ChaCha20Rng::from_os_rng()
        } else {
            // Stretch the seed into a ChaCha20 seed, so that any string is usable
            let mut hasher = SipHasher::default();
            seed.hash(&mut hasher);
            let mut rng_seed: <ChaCha20Rng as SeedableRng>::Seed = Default::default();
            hasher.into_rng().fill(&mut rng_seed);
            ChaCha20Rng::from_seed(rng_seed)
        };
        let keypair = Ed25519Keypair::from_seed(&rng.random());
        let key_string = PrivateKey::from(keypair)
            .to_openssh(LineEnding::LF)
            .map_err(|error| ServerError::KeyGeneration(error.to_string()))?;
        // Round-trip through the OpenSSH encoding to validate the generated material.
        let key = decode_secret_key(&key_string, None)
            .map_err(|error| ServerError::KeyParse(error.to_string()))?;
        let fingerprint = fingerprint(key.public_key());
        Ok(ServerIdentity { key, fingerprint })
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub(crate) fn key(&self) -> &PrivateKey {
        &self.key
    }
}

/// SHA256 fingerprint of a public key, in the `SHA256:<base64>` format used by OpenSSH.
pub fn fingerprint(key: &PublicKey) -> String {
    key.fingerprint(HashAlg::Sha256).to_string()
}
