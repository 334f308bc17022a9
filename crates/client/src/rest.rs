// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Minimal REST collaborator: stream metadata and login endpoints.
//!
//! Authenticated calls attach `Authorization: Bearer <sessionToken>`; a
//! 400/401 response clears the cached token and the call is retried exactly
//! once with a fresh one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Mutex;

use crate::error::ClientError;
use crate::session::Session;

/// Stream metadata as served by `GET /streams/<id>`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamInfo {
    pub id: String,
    pub partitions: u32,
    pub require_signed_data: bool,
    pub require_encrypted_data: bool,
}

impl Default for StreamInfo {
    fn default() -> Self {
        Self {
            id: String::new(),
            partitions: 1,
            require_signed_data: false,
            require_encrypted_data: false,
        }
    }
}

/// Plain HTTP wrapper around the collaborator endpoints.
pub struct RestClient {
    base_url: String,
    client: reqwest::Client,
}

impl RestClient {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder().timeout(timeout).build().unwrap_or_default();
        Self { base_url: base_url.trim_end_matches('/').to_owned(), client }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn apply_auth(&self, req: reqwest::RequestBuilder, token: Option<&str>) -> reqwest::RequestBuilder {
        match token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    pub async fn get_json(
        &self,
        path: &str,
        token: Option<&str>,
    ) -> Result<serde_json::Value, ClientError> {
        let req = self.client.get(self.url(path));
        let resp = self.apply_auth(req, token).send().await.map_err(transport_err)?;
        read_json(resp).await
    }

    pub async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
        token: Option<&str>,
    ) -> Result<serde_json::Value, ClientError> {
        let req = self.client.post(self.url(path)).json(body);
        let resp = self.apply_auth(req, token).send().await.map_err(transport_err)?;
        read_json(resp).await
    }
}

fn transport_err(e: reqwest::Error) -> ClientError {
    ClientError::Connection(e.to_string())
}

async fn read_json(resp: reqwest::Response) -> Result<serde_json::Value, ClientError> {
    let status = resp.status();
    if !status.is_success() {
        let message = resp.text().await.unwrap_or_default();
        return Err(ClientError::Rest { status: status.as_u16(), message });
    }
    let bytes = resp.bytes().await.map_err(transport_err)?;
    if bytes.is_empty() {
        return Ok(serde_json::Value::Null);
    }
    Ok(serde_json::from_slice(&bytes)?)
}

/// Cached stream-metadata lookups with the retry-once auth policy.
pub struct StreamRegistry {
    rest: Arc<RestClient>,
    session: Arc<Session>,
    cache: Mutex<HashMap<String, StreamInfo>>,
}

impl StreamRegistry {
    pub fn new(rest: Arc<RestClient>, session: Arc<Session>) -> Self {
        Self { rest, session, cache: Mutex::new(HashMap::new()) }
    }

    /// Resolve stream metadata, hitting the collaborator on a cache miss.
    pub async fn get_stream(&self, stream_id: &str) -> Result<StreamInfo, ClientError> {
        if let Some(info) = self.cache.lock().await.get(stream_id) {
            return Ok(info.clone());
        }
        let path = format!("/streams/{stream_id}");
        let value = self.authenticated_get(&path).await?;
        let info: StreamInfo = serde_json::from_value(value)
            .map_err(|e| ClientError::Rest { status: 200, message: format!("bad stream body: {e}") })?;
        self.cache.lock().await.insert(stream_id.to_owned(), info.clone());
        Ok(info)
    }

    async fn authenticated_get(&self, path: &str) -> Result<serde_json::Value, ClientError> {
        let token = self.session.get_session_token(false).await?;
        match self.rest.get_json(path, token.as_deref()).await {
            Err(ClientError::Rest { status: 400 | 401, .. }) => {
                let token = self.session.get_session_token(true).await?;
                self.rest.get_json(path, token.as_deref()).await
            }
            other => other,
        }
    }
}

#[cfg(test)]
#[path = "rest_tests.rs"]
mod tests;
