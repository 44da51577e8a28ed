//! Token helpers and refresh endpoint wire types
//!
//! The refresh endpoint takes `{"refresh_token": "..."}` and answers
//! `{"access_token": "...", "refresh_token": "..."}`. Servers that do not
//! rotate refresh tokens omit `refresh_token`; the stored one is kept.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};
use crate::error::Result;
use crate::store::CredentialStore;

/// Body POSTed to the refresh endpoint.
#[derive(Debug, Serialize)]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// Successful refresh endpoint response.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

/// Current access token, if signed in.
pub async fn access_token(store: &dyn CredentialStore) -> Result<Option<String>> {
    store.get(ACCESS_TOKEN_KEY).await
}

/// Current refresh token, if signed in.
pub async fn refresh_token(store: &dyn CredentialStore) -> Result<Option<String>> {
    store.get(REFRESH_TOKEN_KEY).await
}

/// Persist a new access token and, when provided, a rotated refresh token.
pub async fn store_tokens(
    store: &dyn CredentialStore,
    access: &str,
    refresh: Option<&str>,
) -> Result<()> {
    store.set(ACCESS_TOKEN_KEY, access.to_string()).await?;
    if let Some(refresh) = refresh {
        store.set(REFRESH_TOKEN_KEY, refresh.to_string()).await?;
    }
    debug!(rotated = refresh.is_some(), "stored tokens");
    Ok(())
}

/// Remove both tokens (sign out, or refresh token rejected).
pub async fn clear_tokens(store: &dyn CredentialStore) -> Result<()> {
    store.remove(&[ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY]).await
}
