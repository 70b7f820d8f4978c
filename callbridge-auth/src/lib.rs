//! Credential storage and authentication for server-to-server callers
//!
//! - **`Store`**: the key/value capability the service persists hashes in
//! - **`AuthService`**: register/authenticate/unregister over random
//!   32-byte keys, hashed at rest

mod service;
mod store;

pub use service::{AuthError, AuthService, Result, DEFAULT_KEY_LEN};
pub use store::{MemStore, Store, StoreError};
