// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session-token acquisition and caching.
//!
//! The token is fetched lazily on first use and re-fetched when a caller
//! forces a refresh (typically after a 400/401 from an authenticated call).

use std::sync::Arc;

use serde_json::json;
use tokio::sync::Mutex;

use crate::config::Auth;
use crate::crypto::SigningIdentity;
use crate::error::ClientError;
use crate::rest::RestClient;

pub struct Session {
    auth: Auth,
    identity: Option<Arc<SigningIdentity>>,
    rest: Arc<RestClient>,
    token: Mutex<Option<String>>,
}

impl Session {
    pub fn new(auth: Auth, identity: Option<Arc<SigningIdentity>>, rest: Arc<RestClient>) -> Self {
        Self { auth, identity, rest, token: Mutex::new(None) }
    }

    /// The cached session token, logging in first when missing or when
    /// `force_refresh` is set. Anonymous clients resolve to `None`.
    pub async fn get_session_token(&self, force_refresh: bool) -> Result<Option<String>, ClientError> {
        let mut token = self.token.lock().await;
        if force_refresh {
            token.take();
        }
        if let Some(token) = token.as_ref() {
            return Ok(Some(token.clone()));
        }
        let fresh = self.login().await?;
        *token = fresh.clone();
        Ok(fresh)
    }

    async fn login(&self) -> Result<Option<String>, ClientError> {
        match &self.auth {
            Auth::None => Ok(None),
            Auth::ApiKey(api_key) => {
                let body = json!({ "apiKey": api_key });
                let value =
                    self.rest.post_json("/login/apikey", &body, None).await.map_err(auth_err)?;
                Ok(Some(token_of(&value)?))
            }
            Auth::PrivateKey(_) => {
                let identity = self
                    .identity
                    .as_ref()
                    .ok_or_else(|| ClientError::Auth("no signing identity".to_owned()))?;
                let address = identity.address();

                // Challenge/response: sign the server-issued challenge text.
                let challenge = self
                    .rest
                    .post_json(&format!("/login/challenge/{address}"), &json!({}), None)
                    .await
                    .map_err(auth_err)?;
                let challenge_text = challenge
                    .get("challenge")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| ClientError::Auth("challenge response missing text".to_owned()))?;
                let signature = identity.sign(challenge_text.as_bytes())?;

                let body = json!({
                    "challenge": challenge,
                    "signature": signature,
                    "address": address,
                });
                let value =
                    self.rest.post_json("/login/response", &body, None).await.map_err(auth_err)?;
                Ok(Some(token_of(&value)?))
            }
        }
    }
}

fn token_of(value: &serde_json::Value) -> Result<String, ClientError> {
    value
        .get("token")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .ok_or_else(|| ClientError::Auth("login response missing token".to_owned()))
}

fn auth_err(e: ClientError) -> ClientError {
    match e {
        ClientError::Rest { status, message } => {
            ClientError::Auth(format!("login rejected ({status}): {message}"))
        }
        other => other,
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
