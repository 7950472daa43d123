/*
 * SPDX-FileCopyrightText: 2026 Tanzaku Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Remote user resolution: webfinger the acct, fetch the actor document as
//! the proxy actor, persist a Remote user row. Used by the pipeline's
//! mention extraction; each failure drops only that mention.

use crate::delivery::Delivery;
use crate::http_retry::send_with_retry;
use crate::id::{gen_id, now_ms};
use crate::pipeline::RemoteUserResolver;
use crate::resolver::SignedFetchConfig;
use crate::social_db::{SocialDb, User, UserKind};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct Webfinger {
    links: Vec<WebfingerLink>,
}

#[derive(Debug, Deserialize)]
struct WebfingerLink {
    rel: String,
    #[serde(rename = "type")]
    media_type: Option<String>,
    href: Option<String>,
}

pub struct WebfingerUserResolver {
    social: Arc<SocialDb>,
    delivery: Delivery,
    http: reqwest::Client,
    proxy: SignedFetchConfig,
}

impl WebfingerUserResolver {
    pub fn new(
        social: Arc<SocialDb>,
        delivery: Delivery,
        http: reqwest::Client,
        proxy: SignedFetchConfig,
    ) -> Self {
        Self {
            social,
            delivery,
            http,
            proxy,
        }
    }

    async fn fetch_remote(&self, username: &str, host: &str) -> Result<User> {
        let wf_url = format!(
            "https://{host}/.well-known/webfinger?resource=acct:{username}@{host}"
        );
        let wf: Webfinger = send_with_retry(
            || self.http.get(&wf_url).header("Accept", "application/jrd+json, application/json"),
            3,
        )
        .await
        .with_context(|| format!("webfinger {username}@{host}"))?
        .error_for_status()
        .with_context(|| format!("webfinger not ok: {username}@{host}"))?
        .json()
        .await
        .with_context(|| format!("parse webfinger for {username}@{host}"))?;

        let actor_url = wf
            .links
            .iter()
            .find(|l| {
                l.rel == "self"
                    && l.media_type
                        .as_deref()
                        .map(|t| t.contains("activity+json") || t.contains("ld+json"))
                        .unwrap_or(true)
            })
            .and_then(|l| l.href.clone())
            .ok_or_else(|| anyhow!("webfinger has no self link for {username}@{host}"))?;

        let info = self
            .delivery
            .resolve_actor_info(&self.proxy.private_key_pem, &self.proxy.key_id, &actor_url)
            .await?;

        let uri = info.id.unwrap_or(actor_url);
        let user = User {
            id: gen_id(now_ms()),
            username: info
                .preferred_username
                .unwrap_or_else(|| username.to_string()),
            host: Some(host.to_string()),
            name: info.name,
            summary: None,
            kind: UserKind::Remote {
                inbox: info.inbox,
                shared_inbox: info.shared_inbox,
                uri,
                url: info.url,
            },
            public_key_pem: info.public_key_pem,
            is_bot: false,
            is_cat: false,
            is_locked: false,
            is_explorable: false,
            is_silenced: false,
            is_suspended: false,
            no_federation: false,
            searchable_by: None,
            notes_count: 0,
            highlighted_words: Vec::new(),
            profile_fields: Vec::new(),
            created_at_ms: now_ms(),
        };
        self.social.upsert_user(&user)?;
        Ok(user)
    }
}

#[async_trait]
impl RemoteUserResolver for WebfingerUserResolver {
    async fn resolve_user(&self, username: &str, host: &str) -> Result<User> {
        // A known acct short-circuits the network round-trips.
        if let Some(u) = self.social.get_user_by_acct(username, Some(host))? {
            return Ok(u);
        }
        debug!("resolving remote user @{username}@{host}");
        self.fetch_remote(username, host).await
    }
}
