//! Well-known credential keys
//!
//! Keys are restricted to `[A-Za-z0-9._-]` so they are valid in platform
//! secure stores (keychain, keystore) as well as in the JSON file store.

/// Key under which the current access (bearer) token is stored
pub const ACCESS_TOKEN_KEY: &str = "client.access_token";

/// Key under which the current refresh token is stored
pub const REFRESH_TOKEN_KEY: &str = "client.refresh_token";
