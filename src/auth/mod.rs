//! Public-key authentication for SSH clients.
//!
//! The authorized keys store is re-read on every attempt so operators can
//! add or revoke keys without restarting the server.  Any failure to read
//! the store rejects the connection.

pub mod authorized_keys;
pub mod gate;

pub use authorized_keys::{AuthorizedKey, FileKeyStore, KeyStore, MemoryKeyStore};
pub use gate::{AuthDecision, AuthenticationGate, Identity};
