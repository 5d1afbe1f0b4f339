//! Component F: the dispatcher's shared-queue loop — pop a request,
//! authenticate its submitter (from cache or by decrypting a fresh
//! `isAuth` blob), and route it to that submitter's private queue.

use crate::auth::{self, AuthAssertion, ProcessTable};
use crate::queue::QueueClient;
use crate::request::RequestDescriptor;
use anyhow::Result;
use chacha20poly1305::Key;
use ed25519_dalek::VerifyingKey;
use log::{debug, warn};
use std::time::Duration;

/// What a caller must supply to spawn a supervisor for a newly
/// authenticated submitter. Abstracted so dispatcher tests don't need a
/// real process fork/exec.
pub trait SupervisorSpawner {
    /// Returns the private queue key the new supervisor is listening
    /// on.
    fn spawn(&self, assertion: &AuthAssertion) -> Result<String>;
}

pub struct Dispatcher<'a> {
    shared_queue: &'a dyn QueueClient,
    shared_key: &'a str,
    local_queue: &'a dyn QueueClient,
    process_table: ProcessTable,
    cipher_key: Key,
    verifying_key: VerifyingKey,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        shared_queue: &'a dyn QueueClient,
        shared_key: &'a str,
        local_queue: &'a dyn QueueClient,
        cipher_key: Key,
        verifying_key: VerifyingKey,
    ) -> Self {
        Self {
            shared_queue,
            shared_key,
            local_queue,
            process_table: ProcessTable::new(),
            cipher_key,
            verifying_key,
        }
    }

    /// Run forever, processing one shared-queue element at a time.
    /// Environmental/protocol errors (a broken queue connection) are
    /// propagated to the caller, which is expected to treat them as
    /// fatal; per-request failures are logged here and never stop the
    /// loop.
    pub fn run_forever(&self, spawner: &dyn SupervisorSpawner) -> Result<()> {
        loop {
            self.run_once(spawner)?;
        }
    }

    /// Process a single shared-queue element, or return `Ok(())`
    /// immediately if none was available within `timeout`. Exposed
    /// separately from [`Self::run_forever`] so tests can drive one
    /// iteration at a time.
    pub fn run_once(&self, spawner: &dyn SupervisorSpawner) -> Result<()> {
        let raw = match self.shared_queue.brpop(self.shared_key, Duration::from_secs(0))? {
            Some(raw) => raw,
            None => return Ok(()),
        };

        let request = match RequestDescriptor::from_json_str(&raw) {
            Ok(r) => r,
            Err(e) => {
                warn!("dropping malformed shared-queue request: {}", e);
                return Ok(());
            }
        };

        let private_key = match self.process_table.find(&request.pid, request.esaf) {
            Some(cached_key) => {
                if !self.local_queue.exists(&request.pid)? {
                    self.process_table.do_not_call(&request.pid, request.esaf);
                    warn!(
                        "session for pid {} has expired, dropping request",
                        request.pid
                    );
                    return Ok(());
                }
                cached_key
            }
            None => match self.authenticate_and_spawn(&request, spawner)? {
                Some(key) => key,
                None => return Ok(()),
            },
        };

        let jobstr = request.to_json_string()?;
        self.local_queue.lpush(&private_key, &jobstr)?;
        Ok(())
    }

    fn authenticate_and_spawn(
        &self,
        request: &RequestDescriptor,
        spawner: &dyn SupervisorSpawner,
    ) -> Result<Option<String>> {
        let blob = match self.local_queue.hget(&request.pid, "isAuth")? {
            Some(blob) => blob,
            None => {
                warn!("no isAuth on record for pid {}, dropping request", request.pid);
                return Ok(None);
            }
        };

        let assertion = match auth::decrypt_and_verify(&blob, &self.cipher_key, &self.verifying_key)
        {
            Ok(a) => a,
            Err(e) => {
                warn!("isAuth decrypt/verify failed for pid {}: {}", request.pid, e);
                return Ok(None);
            }
        };
        debug!(
            "decrypted auth assertion for pid {} (uid={}, gid={}, esaf={})",
            assertion.pid, assertion.uid, assertion.gid, assertion.esaf
        );

        if assertion.pid != request.pid {
            warn!(
                "auth assertion pid {} does not match request pid {}, dropping request",
                assertion.pid, request.pid
            );
            return Ok(None);
        }

        let private_key = spawner.spawn(&assertion)?;
        self.process_table
            .run(&request.pid, request.esaf, private_key.clone());
        Ok(Some(private_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryQueueClient;
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;

    struct RecordingSpawner {
        private_key: String,
    }

    impl SupervisorSpawner for RecordingSpawner {
        fn spawn(&self, _assertion: &AuthAssertion) -> Result<String> {
            Ok(self.private_key.clone())
        }
    }

    fn encrypt_blob(assertion: &AuthAssertion, cipher_key: &Key, signing_key: &SigningKey) -> String {
        use base64::Engine;
        use chacha20poly1305::aead::{Aead, KeyInit};
        use chacha20poly1305::{ChaCha20Poly1305, Nonce};
        use sha2::{Digest, Sha256};

        let plaintext = serde_json::to_vec(assertion).unwrap();
        let cipher = ChaCha20Poly1305::new(cipher_key);
        let nonce_bytes = [9u8; 12];
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher.encrypt(nonce, plaintext.as_ref()).unwrap();
        let mut signed_part = nonce_bytes.to_vec();
        signed_part.extend_from_slice(&ciphertext);
        let digest: [u8; 32] = Sha256::digest(&signed_part).into();
        let sig = crate::crypto::signatures::sign_ed25519_only(
            crate::crypto::signatures::DOMAIN_AUTH_ASSERTION,
            signing_key,
            &digest,
        );
        let mut raw = signed_part;
        raw.extend_from_slice(&sig);
        base64::engine::general_purpose::STANDARD.encode(raw)
    }

    #[test]
    fn happy_path_authenticates_and_routes() {
        let shared = InMemoryQueueClient::new();
        let local = InMemoryQueueClient::new();
        let signing_key = SigningKey::generate(&mut OsRng);
        let cipher_key = auth::derive_cipher_key("seed");

        let assertion = AuthAssertion {
            pid: "alice".to_string(),
            esaf: 1,
            uid: 1000,
            gid: 1000,
        };
        local.seed_hash("alice", "isAuth", &encrypt_blob(&assertion, &cipher_key, &signing_key));
        local.lpush("alice", "session-marker").unwrap(); // EXISTS alice -> true

        shared.push_shared(
            "ISREQUESTS",
            r#"{"pid":"alice","esaf":1,"type":"jpeg","filename":"x.h5","frame":1}"#,
        );

        let dispatcher = Dispatcher::new(
            &shared,
            "ISREQUESTS",
            &local,
            cipher_key,
            signing_key.verifying_key(),
        );
        let spawner = RecordingSpawner {
            private_key: "private:alice".to_string(),
        };
        dispatcher.run_once(&spawner).unwrap();

        assert!(local.exists("private:alice").unwrap());
    }

    #[test]
    fn pid_mismatch_drops_request() {
        let shared = InMemoryQueueClient::new();
        let local = InMemoryQueueClient::new();
        let signing_key = SigningKey::generate(&mut OsRng);
        let cipher_key = auth::derive_cipher_key("seed");

        let assertion = AuthAssertion {
            pid: "bob".to_string(),
            esaf: 1,
            uid: 1000,
            gid: 1000,
        };
        local.seed_hash("alice", "isAuth", &encrypt_blob(&assertion, &cipher_key, &signing_key));

        shared.push_shared(
            "ISREQUESTS",
            r#"{"pid":"alice","esaf":1,"type":"jpeg","filename":"x.h5","frame":1}"#,
        );

        let dispatcher = Dispatcher::new(
            &shared,
            "ISREQUESTS",
            &local,
            cipher_key,
            signing_key.verifying_key(),
        );
        let spawner = RecordingSpawner {
            private_key: "private:alice".to_string(),
        };
        dispatcher.run_once(&spawner).unwrap();

        assert!(!local.exists("private:alice").unwrap());
    }

    #[test]
    fn expired_session_is_marked_do_not_call() {
        let shared = InMemoryQueueClient::new();
        let local = InMemoryQueueClient::new();
        let signing_key = SigningKey::generate(&mut OsRng);
        let cipher_key = auth::derive_cipher_key("seed");

        let dispatcher = Dispatcher::new(
            &shared,
            "ISREQUESTS",
            &local,
            cipher_key,
            signing_key.verifying_key(),
        );
        dispatcher.process_table.run("alice", 1, "private:alice".to_string());
        // local queue has no "alice" session marker, so EXISTS is false

        shared.push_shared(
            "ISREQUESTS",
            r#"{"pid":"alice","esaf":1,"type":"jpeg","filename":"x.h5","frame":1}"#,
        );
        let spawner = RecordingSpawner {
            private_key: "private:alice".to_string(),
        };
        dispatcher.run_once(&spawner).unwrap();

        assert!(dispatcher.process_table.find("alice", 1).is_none());
    }
}
