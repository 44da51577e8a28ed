//! Credential storage for the API client
//!
//! The resilience layer treats credential persistence as an external
//! collaborator: a key-value store with `get`, `set` and `remove`. This crate
//! defines that seam (`CredentialStore`) and ships two implementations:
//!
//! - `MemoryCredentialStore` for tests and embedding
//! - `FileCredentialStore`, a JSON file written atomically with 0600 perms
//!
//! It also owns the well-known keys for the access and refresh credentials
//! and the wire types of the refresh endpoint.
//!
//! Credential flow:
//! 1. Login stores both tokens via `token::store_tokens()`
//! 2. The executor reads the access token via `token::access_token()`
//! 3. On 401 the refresh coordinator reads `token::refresh_token()`, posts a
//!    `RefreshRequest`, and stores the rotated pair from the `TokenResponse`
//! 4. A rejected refresh credential is wiped via `token::clear_tokens()`

pub mod constants;
pub mod error;
pub mod file;
pub mod store;
pub mod token;

pub use constants::*;
pub use error::{Error, Result};
pub use file::FileCredentialStore;
pub use store::{CredentialStore, MemoryCredentialStore, validate_key};
pub use token::{RefreshRequest, TokenResponse, access_token, clear_tokens, refresh_token, store_tokens};
