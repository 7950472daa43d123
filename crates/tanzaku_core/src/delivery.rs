/*
 * SPDX-FileCopyrightText: 2026 Tanzaku Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::http_retry::send_with_retry;
use crate::http_sig::sign_request_rsa_sha256;
use anyhow::{anyhow, Context, Result};
use http::{HeaderMap, Method, Uri};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::Deserialize;
use thiserror::Error;

/// One delivery attempt's failure, classified for the queue's state machine.
#[derive(Debug, Error)]
pub enum DeliverError {
    /// The inbox is gone for good; terminal, and the address is dropped.
    #[error("inbox gone (410)")]
    Gone,

    /// Any other non-success status; retried with backoff up to the cap.
    #[error("delivery failed: {status} {body}")]
    Status { status: u16, body: String },

    /// Network/timeout; retried with backoff up to the cap.
    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),
}

#[derive(Clone)]
pub struct Delivery {
    client: reqwest::Client,
}

impl Delivery {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Signed POST of an activity document to one inbox.
    pub async fn deliver_json(
        &self,
        private_key_pem: &str,
        key_id: &str,
        inbox_url: &str,
        body: &[u8],
    ) -> Result<(), DeliverError> {
        let uri: Uri = inbox_url
            .parse()
            .map_err(|e| anyhow!("parse inbox url: {e}"))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            "Accept",
            "application/activity+json".parse().expect("static header"),
        );
        headers.insert(
            "Content-Type",
            "application/activity+json".parse().expect("static header"),
        );

        sign_request_rsa_sha256(
            private_key_pem,
            key_id,
            &Method::POST,
            &uri,
            &mut headers,
            body,
            &["(request-target)", "host", "date", "digest", "content-type"],
        )?;

        let mut req = self
            .client
            .post(inbox_url)
            .header(ACCEPT, "application/activity+json");
        for (k, v) in headers.iter() {
            req = req.header(k.as_str(), v.to_str().unwrap_or_default());
        }
        req = req.header(CONTENT_TYPE, "application/activity+json");

        let resp = send_with_retry(|| req.try_clone().expect("clonable body").body(body.to_vec()), 3)
            .await?;
        let status = resp.status();
        if status.is_success() || status.as_u16() == 202 {
            return Ok(());
        }
        if status.as_u16() == 410 {
            return Err(DeliverError::Gone);
        }
        let text = resp.text().await.unwrap_or_default();
        Err(DeliverError::Status {
            status: status.as_u16(),
            body: text.chars().take(200).collect(),
        })
    }

    /// Fetches a remote actor document and extracts what delivery needs,
    /// preferring the shared inbox when the host publishes one.
    pub async fn resolve_actor_info(
        &self,
        private_key_pem: &str,
        key_id: &str,
        actor_url: &str,
    ) -> Result<ActorInfo> {
        let uri: Uri = actor_url.parse().context("parse actor url")?;

        let accept = "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";
        let mut headers = HeaderMap::new();
        headers.insert("Accept", accept.parse().expect("static header"));

        sign_request_rsa_sha256(
            private_key_pem,
            key_id,
            &Method::GET,
            &uri,
            &mut headers,
            &[],
            &["(request-target)", "host", "date"],
        )?;

        let mut req = self.client.get(actor_url).header(ACCEPT, accept);
        for (k, v) in headers.iter() {
            req = req.header(k.as_str(), v.to_str().unwrap_or_default());
        }

        let resp = req
            .send()
            .await
            .with_context(|| format!("fetch actor: {actor_url}"))?
            .error_for_status()
            .with_context(|| format!("actor not ok: {actor_url}"))?;

        let text = resp.text().await?;
        let actor: ActorDoc = serde_json::from_str(&text)
            .with_context(|| format!("parse actor json from {actor_url}"))?;
        let public_key_pem = actor.public_key.map(|p| p.public_key_pem);

        let shared_inbox = actor.endpoints.and_then(|e| e.shared_inbox);
        let inbox = actor.inbox.ok_or_else(|| anyhow!("actor missing inbox"))?;
        Ok(ActorInfo {
            id: actor.id,
            inbox,
            shared_inbox,
            public_key_pem,
            preferred_username: actor.preferred_username,
            name: actor.name,
            url: actor.url,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ActorInfo {
    pub id: Option<String>,
    pub inbox: String,
    pub shared_inbox: Option<String>,
    pub public_key_pem: Option<String>,
    pub preferred_username: Option<String>,
    pub name: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ActorDoc {
    id: Option<String>,
    inbox: Option<String>,
    endpoints: Option<ActorEndpoints>,
    #[serde(rename = "publicKey")]
    public_key: Option<ActorPublicKey>,
    #[serde(rename = "preferredUsername")]
    preferred_username: Option<String>,
    name: Option<String>,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ActorPublicKey {
    #[serde(rename = "publicKeyPem")]
    public_key_pem: String,
}

#[derive(Debug, Deserialize)]
struct ActorEndpoints {
    #[serde(rename = "sharedInbox")]
    shared_inbox: Option<String>,
}

/// Host portion of an inbox/actor URL, for per-host grouping and the
/// instance reachability record.
pub fn host_of(url: &str) -> Option<String> {
    let uri: Uri = url.parse().ok()?;
    uri.host().map(|h| h.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_extraction() {
        assert_eq!(
            host_of("https://Remote.Example/users/bob/inbox"),
            Some("remote.example".to_string())
        );
        assert_eq!(host_of("not a url"), None);
    }
}
