use anyhow::{anyhow, Result};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const ED25519_SCHEME_ID: &str = "ed25519";

pub const DOMAIN_AUTH_ASSERTION: &str = "is-kernel:auth-assertion:v1";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignatureSet {
    pub ed25519_scheme: String,
    pub ed25519_signature: Vec<u8>,
}

impl SignatureSet {
    pub fn new(ed25519_signature: [u8; 64]) -> Self {
        Self {
            ed25519_scheme: ED25519_SCHEME_ID.to_string(),
            ed25519_signature: ed25519_signature.to_vec(),
        }
    }

    pub fn from_storage(ed25519_signature: &[u8]) -> Result<Self> {
        if ed25519_signature.len() != 64 {
            return Err(anyhow!(
                "invalid ed25519 signature length: expected 64 bytes, got {}",
                ed25519_signature.len()
            ));
        }
        Ok(Self {
            ed25519_scheme: ED25519_SCHEME_ID.to_string(),
            ed25519_signature: ed25519_signature.to_vec(),
        })
    }

    pub fn ed25519_signature_array(&self) -> Result<[u8; 64]> {
        if self.ed25519_signature.len() != 64 {
            return Err(anyhow!(
                "invalid ed25519 signature length: expected 64 bytes, got {}",
                self.ed25519_signature.len()
            ));
        }
        let mut out = [0u8; 64];
        out.copy_from_slice(&self.ed25519_signature);
        Ok(out)
    }
}

/// Sign a 32-byte digest under a domain-separation tag so signatures for
/// different message kinds can never be confused for one another.
pub fn sign_with_domain(
    domain: &str,
    signing_key: &SigningKey,
    entry_hash: &[u8; 32],
) -> SignatureSet {
    let signing_hash = domain_separated_hash(domain, entry_hash);
    let ed25519_signature = signing_key.sign(&signing_hash).to_bytes();
    SignatureSet::new(ed25519_signature)
}

pub fn verify_with_domain(
    domain: &str,
    verifying_key: &VerifyingKey,
    entry_hash: &[u8; 32],
    signatures: &SignatureSet,
) -> Result<()> {
    let signing_hash = domain_separated_hash(domain, entry_hash);
    let signature_bytes = signatures.ed25519_signature_array()?;
    let sig = ed25519_dalek::Signature::from_bytes(&signature_bytes);
    verifying_key
        .verify(&signing_hash, &sig)
        .map_err(|e| anyhow!("signature verification failed: {}", e))
}

pub fn sign_ed25519_only(
    domain: &str,
    signing_key: &SigningKey,
    entry_hash: &[u8; 32],
) -> [u8; 64] {
    let signing_hash = domain_separated_hash(domain, entry_hash);
    signing_key.sign(&signing_hash).to_bytes()
}

pub fn verify_ed25519_only(
    domain: &str,
    verifying_key: &VerifyingKey,
    entry_hash: &[u8; 32],
    signature: &[u8; 64],
) -> Result<()> {
    let signing_hash = domain_separated_hash(domain, entry_hash);
    let sig = ed25519_dalek::Signature::from_bytes(signature);
    verifying_key
        .verify(&signing_hash, &sig)
        .map_err(|e| anyhow!("signature verification failed: {}", e))
}

fn domain_separated_hash(domain: &str, entry_hash: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    let domain_bytes = domain.as_bytes();
    hasher.update((domain_bytes.len() as u32).to_le_bytes());
    hasher.update(domain_bytes);
    hasher.update(entry_hash);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn sign_and_verify_round_trip() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        let hash = Sha256::digest(b"auth assertion payload").into();

        let sigs = sign_with_domain(DOMAIN_AUTH_ASSERTION, &signing_key, &hash);
        verify_with_domain(DOMAIN_AUTH_ASSERTION, &verifying_key, &hash, &sigs)
            .expect("signature should verify");
    }

    #[test]
    fn wrong_domain_fails_verification() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        let hash = Sha256::digest(b"auth assertion payload").into();

        let sigs = sign_with_domain(DOMAIN_AUTH_ASSERTION, &signing_key, &hash);
        let other_domain = "is-kernel:something-else:v1";
        assert!(verify_with_domain(other_domain, &verifying_key, &hash, &sigs).is_err());
    }
}
