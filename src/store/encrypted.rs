// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Encrypt-at-rest decorator for any [`LocalStore`] backend.
//!
//! Values are sealed with ChaCha20-Poly1305 under a key derived from the
//! configured passphrase via HKDF-SHA256. Each write uses a fresh random
//! 12-byte nonce, stored as a prefix of the ciphertext. Namespaces and keys
//! stay in the clear so ordering and lookups keep working.
//!
//! This replaces what used to be a whole parallel "encrypted storage"
//! implementation: wrap the backend once at construction and everything
//! above it is oblivious.

use async_trait::async_trait;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

use super::traits::{BatchOp, LocalStore, Namespace, StoreError, WriteBatch};

const NONCE_LEN: usize = 12;
const HKDF_SALT: &[u8] = b"medsync.store.v1";
const HKDF_INFO: &[u8] = b"record value key";

pub struct EncryptedStore<S> {
    inner: S,
    cipher: ChaCha20Poly1305,
}

impl<S: LocalStore> EncryptedStore<S> {
    /// Wrap `inner`, deriving the data key from `passphrase`.
    #[must_use]
    pub fn new(inner: S, passphrase: &str) -> Self {
        let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), passphrase.as_bytes());
        let mut okm = [0u8; 32];
        // Expand cannot fail for a 32-byte output with SHA-256
        hk.expand(HKDF_INFO, &mut okm)
            .unwrap_or_else(|_| unreachable!("32-byte HKDF output"));

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&okm));
        Self { inner, cipher }
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| StoreError::Backend("encryption failed".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn open_sealed(&self, sealed: &[u8]) -> Result<Vec<u8>, StoreError> {
        if sealed.len() < NONCE_LEN {
            return Err(StoreError::Backend(
                "sealed value shorter than nonce".to_string(),
            ));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| StoreError::Backend("decryption failed (wrong passphrase or corrupt value)".to_string()))
    }
}

#[async_trait]
impl<S: LocalStore> LocalStore for EncryptedStore<S> {
    async fn put(&self, namespace: Namespace, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let sealed = self.seal(value)?;
        self.inner.put(namespace, key, &sealed).await
    }

    async fn get(&self, namespace: Namespace, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match self.inner.get(namespace, key).await? {
            Some(sealed) => Ok(Some(self.open_sealed(&sealed)?)),
            None => Ok(None),
        }
    }

    async fn get_all(&self, namespace: Namespace) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let rows = self.inner.get_all(namespace).await?;
        let mut out = Vec::with_capacity(rows.len());
        for (key, sealed) in rows {
            out.push((key, self.open_sealed(&sealed)?));
        }
        Ok(out)
    }

    async fn delete(&self, namespace: Namespace, key: &str) -> Result<(), StoreError> {
        self.inner.delete(namespace, key).await
    }

    async fn clear(&self, namespace: Namespace) -> Result<(), StoreError> {
        self.inner.clear(namespace).await
    }

    async fn apply(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut sealed_batch = WriteBatch::new();
        for op in batch.ops {
            match op {
                BatchOp::Put {
                    namespace,
                    key,
                    value,
                } => {
                    let sealed = self.seal(&value)?;
                    sealed_batch.put(namespace, key, sealed);
                }
                BatchOp::Delete { namespace, key } => {
                    sealed_batch.delete(namespace, key);
                }
            }
        }
        self.inner.apply(sealed_batch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;

    fn encrypted() -> EncryptedStore<InMemoryStore> {
        EncryptedStore::new(InMemoryStore::new(), "correct horse battery staple")
    }

    #[tokio::test]
    async fn test_roundtrip() {
        let store = encrypted();

        store.put(Namespace::Reports, "r-1", b"secret payload").await.unwrap();

        let value = store.get(Namespace::Reports, "r-1").await.unwrap();
        assert_eq!(value, Some(b"secret payload".to_vec()));
    }

    #[tokio::test]
    async fn test_values_are_opaque_at_rest() {
        let inner = std::sync::Arc::new(InMemoryStore::new());
        let store = EncryptedStore::new(inner.clone(), "passphrase");

        store.put(Namespace::Reports, "r-1", b"plaintext-marker").await.unwrap();

        // Read through the decorated trait works
        assert!(store.get(Namespace::Reports, "r-1").await.unwrap().is_some());

        // The raw stored bytes do not contain the plaintext
        let raw = inner.get(Namespace::Reports, "r-1").await.unwrap().unwrap();
        assert!(!raw
            .windows(b"plaintext-marker".len())
            .any(|w| w == b"plaintext-marker"));
        // nonce + ciphertext + tag is strictly longer than the plaintext
        assert!(raw.len() > b"plaintext-marker".len());
    }

    #[tokio::test]
    async fn test_nonces_differ_per_write() {
        let inner = std::sync::Arc::new(InMemoryStore::new());
        let store = EncryptedStore::new(inner.clone(), "passphrase");

        store.put(Namespace::Reports, "a", b"same").await.unwrap();
        store.put(Namespace::Reports, "b", b"same").await.unwrap();

        let raw_a = inner.get(Namespace::Reports, "a").await.unwrap().unwrap();
        let raw_b = inner.get(Namespace::Reports, "b").await.unwrap().unwrap();
        assert_ne!(raw_a, raw_b);
    }

    #[tokio::test]
    async fn test_wrong_passphrase_fails_cleanly() {
        let inner = std::sync::Arc::new(InMemoryStore::new());
        {
            let store = EncryptedStore::new(inner.clone(), "right");
            store.put(Namespace::Session, "current", b"token").await.unwrap();
        }

        let store = EncryptedStore::new(inner, "wrong");
        let result = store.get(Namespace::Session, "current").await;
        assert!(matches!(result, Err(StoreError::Backend(_))));
    }

    #[tokio::test]
    async fn test_get_all_decrypts_every_row() {
        let store = encrypted();

        for i in 0..5 {
            let key = format!("{:08}", i);
            store
                .put(Namespace::Queue, &key, format!("item-{}", i).as_bytes())
                .await
                .unwrap();
        }

        let rows = store.get_all(Namespace::Queue).await.unwrap();
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[0].1, b"item-0".to_vec());
        assert_eq!(rows[4].1, b"item-4".to_vec());
    }

    #[tokio::test]
    async fn test_apply_batch_seals_puts() {
        let store = encrypted();

        let mut batch = WriteBatch::new();
        batch.put(Namespace::Reports, "r-1", b"entity".to_vec());
        batch.put(Namespace::Queue, "00000001", b"item".to_vec());
        store.apply(batch).await.unwrap();

        assert_eq!(
            store.get(Namespace::Reports, "r-1").await.unwrap(),
            Some(b"entity".to_vec())
        );
        assert_eq!(
            store.get(Namespace::Queue, "00000001").await.unwrap(),
            Some(b"item".to_vec())
        );
    }
}
