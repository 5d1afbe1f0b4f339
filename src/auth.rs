//! Auth assertion decryption/verification and the dispatcher's process
//! table (the `(pid, esaf) -> private queue key` cache).

use crate::crypto::signatures::{self, DOMAIN_AUTH_ASSERTION};
use anyhow::{anyhow, Context, Result};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signature, VerifyingKey};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use zeroize::Zeroize;

const NONCE_LEN: usize = 12;
const SIGNATURE_LEN: usize = 64;

/// The decrypted contents of an `isAuth` blob: the submitter's identity
/// and the OS-level identity a supervisor should assume on their
/// behalf. The plaintext JSON buffer is zeroized on drop since it is
/// the one place in the pipeline holding decrypted authentication
/// material.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthAssertion {
    pub pid: String,
    pub esaf: i64,
    pub uid: u32,
    pub gid: u32,
}

struct ZeroizingString(String);

impl Drop for ZeroizingString {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Decrypt and verify a raw `isAuth` blob (as stored under `HGET <pid>
/// isAuth`). Wire format: `nonce(12) || ciphertext || signature(64)`,
/// base64-encoded. The signature covers `nonce || ciphertext` under
/// [`DOMAIN_AUTH_ASSERTION`]; only once that verifies is the ciphertext
/// decrypted.
pub fn decrypt_and_verify(
    blob_b64: &str,
    cipher_key: &Key,
    verifying_key: &VerifyingKey,
) -> Result<AuthAssertion> {
    use base64::Engine;
    let raw = base64::engine::general_purpose::STANDARD
        .decode(blob_b64.trim())
        .context("isAuth blob is not valid base64")?;
    if raw.len() < NONCE_LEN + SIGNATURE_LEN {
        return Err(anyhow!("isAuth blob too short to contain nonce and signature"));
    }
    let (signed_part, sig_bytes) = raw.split_at(raw.len() - SIGNATURE_LEN);
    let (nonce_bytes, ciphertext) = signed_part.split_at(NONCE_LEN);

    let digest: [u8; 32] = Sha256::digest(signed_part).into();
    let mut sig_arr = [0u8; SIGNATURE_LEN];
    sig_arr.copy_from_slice(sig_bytes);
    let signature = Signature::from_bytes(&sig_arr);
    signatures::verify_with_domain(
        DOMAIN_AUTH_ASSERTION,
        verifying_key,
        &digest,
        &signatures::SignatureSet::new(signature.to_bytes()),
    )
    .context("isAuth signature verification failed")?;

    let cipher = ChaCha20Poly1305::new(cipher_key);
    let nonce = Nonce::from_slice(nonce_bytes);
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| anyhow!("isAuth decryption failed"))?;
    let plaintext_str = ZeroizingString(
        String::from_utf8(plaintext).context("decrypted isAuth is not valid UTF-8")?,
    );

    let assertion: AuthAssertion = serde_json::from_str(&plaintext_str.0)
        .context("decrypted isAuth is not a valid assertion")?;
    Ok(assertion)
}

/// Derive the symmetric decryption key from the configured seed, the
/// way `crypto::load_or_create_device_seed`'s callers turn a stored hex
/// seed into usable key bytes elsewhere in this codebase.
pub fn derive_cipher_key(seed: &str) -> Key {
    let digest = Sha256::digest(seed.as_bytes());
    *Key::from_slice(&digest)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ProcessEntryState {
    Active,
    DoNotCall,
}

struct ProcessEntry {
    state: ProcessEntryState,
    private_queue_key: String,
}

/// Dispatcher-local cache of `(pid, esaf) -> private queue key`, with
/// "do not call" tombstoning for sessions that have expired. A single
/// dispatcher thread owns this, so internal synchronization only
/// matters for the supervisor teardown path that marks entries dead
/// from a watcher thread.
#[derive(Default)]
pub struct ProcessTable {
    entries: Mutex<HashMap<(String, i64), ProcessEntry>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Look up a cached, still-live private queue key for `(pid, esaf)`.
    /// Returns `None` both for a cold cache and for an entry already
    /// marked "do not call" — the caller treats both the same way, by
    /// re-authenticating or dropping the request.
    pub fn find(&self, pid: &str, esaf: i64) -> Option<String> {
        let entries = self.entries.lock().expect("lock poisoned");
        entries.get(&(pid.to_string(), esaf)).and_then(|entry| {
            if entry.state == ProcessEntryState::Active {
                Some(entry.private_queue_key.clone())
            } else {
                None
            }
        })
    }

    /// Register a newly spawned supervisor's private queue key.
    pub fn run(&self, pid: &str, esaf: i64, private_queue_key: String) {
        let mut entries = self.entries.lock().expect("lock poisoned");
        entries.insert(
            (pid.to_string(), esaf),
            ProcessEntry {
                state: ProcessEntryState::Active,
                private_queue_key,
            },
        );
    }

    /// Tombstone an entry whose backing session no longer exists
    /// (`EXISTS <pid>` returned false). A future request for the same
    /// `(pid, esaf)` falls through to re-authentication.
    pub fn do_not_call(&self, pid: &str, esaf: i64) {
        let mut entries = self.entries.lock().expect("lock poisoned");
        if let Some(entry) = entries.get_mut(&(pid.to_string(), esaf)) {
            entry.state = ProcessEntryState::DoNotCall;
        }
    }
}
