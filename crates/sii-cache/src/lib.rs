//! # sii-cache — Key-Value Backends with TTL
//!
//! Session tokens, certificates and folio authorizations are cached behind
//! one [`KeyValueStore`] interface:
//!
//! - [`MemoryStore`]: reader/writer-locked map with lazy expiry on read.
//! - `RedisStore` (feature `redis`): remote backend using native TTLs.
//!
//! Keys are built through [`KeySpace`] so every consumer shares one naming
//! scheme.

#![deny(missing_docs)]

pub mod error;
pub mod keys;
pub mod memory;
#[cfg(feature = "redis")]
pub mod remote;
pub mod store;

pub use error::CacheError;
pub use keys::{KeySpace, CAF_TTL, CERTIFICATE_TTL, TOKEN_TTL};
pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use remote::RedisStore;
pub use store::{get_json, set_json, KeyValueStore};
