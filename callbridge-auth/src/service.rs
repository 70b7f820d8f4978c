//! Key-based authentication service
//!
//! Registering an identity generates a random 32-byte key whose hash is
//! persisted; the plaintext is returned exactly once. Authentication
//! verifies a presented key against the stored hash.

use crate::store::{Store, StoreError};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use std::sync::Arc;
use thiserror::Error;
use tokio::task;

pub const DEFAULT_KEY_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("registration failed: already registered")]
    AlreadyRegistered,

    #[error("authentication failed")]
    InvalidKey,

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AuthError>;

pub struct AuthService {
    store: Arc<dyn Store>,
}

impl AuthService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Generates and stores credentials for `id`. The returned plaintext
    /// key is shown exactly once; only its hash is persisted.
    pub async fn register(&self, id: &str) -> Result<String> {
        match self.store.get(id) {
            Ok(_) => return Err(AuthError::AlreadyRegistered),
            Err(StoreError::NotFound) => {}
            Err(err) => return Err(err.into()),
        }

        let auth_key = new_random_key(DEFAULT_KEY_LEN);
        let hash = hash_key(auth_key.clone()).await?;

        self.store.set(id, &hash)?;

        Ok(auth_key)
    }

    /// Verifies `auth_key` against the stored hash. The comparison is
    /// performed by the hash verifier, not on the raw strings.
    pub async fn authenticate(&self, id: &str, auth_key: &str) -> Result<()> {
        let hash = self.store.get(id)?;

        if verify_key(auth_key.to_string(), hash).await? {
            Ok(())
        } else {
            Err(AuthError::InvalidKey)
        }
    }

    pub async fn unregister(&self, id: &str) -> Result<()> {
        // Surface a missing id rather than silently deleting nothing.
        self.store.get(id)?;
        self.store.delete(id)?;
        Ok(())
    }
}

fn new_random_key(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    BASE64.encode(bytes)
}

async fn hash_key(key: String) -> Result<String> {
    task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(key.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| AuthError::Internal(format!("failed to hash key: {e}")))
    })
    .await
    .map_err(|e| AuthError::Internal(format!("hashing task failed: {e}")))?
}

async fn verify_key(key: String, hash: String) -> Result<bool> {
    task::spawn_blocking(move || {
        let parsed = PasswordHash::new(&hash)
            .map_err(|e| AuthError::Internal(format!("invalid key hash format: {e}")))?;
        match Argon2::default().verify_password(key.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(AuthError::Internal(format!("key verification failed: {e}"))),
        }
    })
    .await
    .map_err(|e| AuthError::Internal(format!("verification task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    fn service() -> AuthService {
        AuthService::new(Arc::new(MemStore::new()))
    }

    #[tokio::test]
    async fn test_register_authenticate_roundtrip() {
        let svc = service();

        let key = svc.register("srvA").await.unwrap();
        assert!(!key.is_empty());

        svc.authenticate("srvA", &key).await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_key_rejected() {
        let svc = service();

        let key = svc.register("srvA").await.unwrap();
        let err = svc.authenticate("srvA", "not-the-key").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidKey));

        // The right key still works afterwards.
        svc.authenticate("srvA", &key).await.unwrap();
    }

    #[tokio::test]
    async fn test_double_register_fails_without_altering_storage() {
        let store = Arc::new(MemStore::new());
        let svc = AuthService::new(Arc::clone(&store) as Arc<dyn Store>);

        let key = svc.register("srvA").await.unwrap();
        let stored = store.get("srvA").unwrap();

        let err = svc.register("srvA").await.unwrap_err();
        assert!(matches!(err, AuthError::AlreadyRegistered));

        // The original hash survived, and the original key authenticates.
        assert_eq!(store.get("srvA").unwrap(), stored);
        svc.authenticate("srvA", &key).await.unwrap();
    }

    #[tokio::test]
    async fn test_unregister_then_authenticate_fails() {
        let svc = service();

        let key = svc.register("srvA").await.unwrap();
        svc.unregister("srvA").await.unwrap();

        let err = svc.authenticate("srvA", &key).await.unwrap_err();
        assert!(matches!(err, AuthError::Store(StoreError::NotFound)));
    }

    #[tokio::test]
    async fn test_unregister_unknown_id() {
        let svc = service();
        let err = svc.unregister("ghost").await.unwrap_err();
        assert!(matches!(err, AuthError::Store(StoreError::NotFound)));
    }

    #[tokio::test]
    async fn test_keys_are_unique() {
        let svc = service();
        let k1 = svc.register("a").await.unwrap();
        let k2 = svc.register("b").await.unwrap();
        assert_ne!(k1, k2);
    }
}
