/*
 * SPDX-FileCopyrightText: 2026 Tanzaku Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Resolves a reference (inline object or URI) into a validated wire
//! object. One `Resolver` value covers one inbound-activity handling pass:
//! the by-URI cache and the recursion budget both live on the value and die
//! with it.

use crate::config::Config;
use crate::error::ResolutionError;
use crate::http_retry::send_with_retry;
use crate::http_sig::sign_request_rsa_sha256;
use anyhow::anyhow;
use http::{HeaderMap, Method, Uri};
use serde_json::Value;
use std::collections::HashMap;

pub const RECURSION_LIMIT: u32 = 8;

const ACCEPT_ACTIVITY: &str = "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// The system/proxy actor credentials used for authenticated fetch.
#[derive(Clone)]
pub struct SignedFetchConfig {
    pub private_key_pem: String,
    pub key_id: String,
}

pub struct Resolver {
    cfg: Config,
    client: reqwest::Client,
    signed: Option<SignedFetchConfig>,
    cache: HashMap<String, Value>,
    resolved: u32,
}

impl Resolver {
    pub fn new(cfg: Config, client: reqwest::Client, signed: Option<SignedFetchConfig>) -> Self {
        Self {
            cfg,
            client,
            signed,
            cache: HashMap::new(),
            resolved: 0,
        }
    }

    /// Resolve and validate the declared type against `expected` (empty =
    /// any type).
    pub async fn resolve_typed(
        &mut self,
        input: Value,
        expected: &[&str],
    ) -> Result<Value, ResolutionError> {
        let object = self.resolve(input).await?;
        if !expected.is_empty() {
            let found = object
                .get("type")
                .and_then(|t| t.as_str())
                .unwrap_or("")
                .to_string();
            if !expected.contains(&found.as_str()) {
                let uri = object
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or("<inline>")
                    .to_string();
                return Err(ResolutionError::TypeMismatch { uri, found });
            }
        }
        Ok(object)
    }

    /// A string is fetched by URI; anything else is treated as an inline
    /// object and passed through. Every call consumes recursion budget, so
    /// chains of nested references bottom out instead of fanning out
    /// unbounded fetches.
    pub async fn resolve(&mut self, input: Value) -> Result<Value, ResolutionError> {
        self.resolved += 1;
        if self.resolved > RECURSION_LIMIT {
            return Err(ResolutionError::RecursionLimit);
        }

        match input {
            Value::String(uri) => self.resolve_uri(&uri).await,
            Value::Object(_) => Ok(input),
            other => Err(ResolutionError::InvalidUri(other.to_string())),
        }
    }

    async fn resolve_uri(&mut self, uri: &str) -> Result<Value, ResolutionError> {
        if let Some(hit) = self.cache.get(uri) {
            return Ok(hit.clone());
        }

        let parsed: Uri = uri
            .parse()
            .map_err(|_| ResolutionError::InvalidUri(uri.to_string()))?;
        let host = parsed
            .host()
            .ok_or_else(|| ResolutionError::InvalidUri(uri.to_string()))?
            .to_ascii_lowercase();
        // Blocklist first: no network call for blocked hosts.
        if self.cfg.is_blocked_host(&host) {
            return Err(ResolutionError::HostBlocked(host));
        }

        let body = self
            .fetch(uri, &parsed)
            .await
            .map_err(|e| ResolutionError::Fetch {
                uri: uri.to_string(),
                source: e,
            })?;

        let value: Value =
            serde_json::from_slice(&body).map_err(|e| ResolutionError::Fetch {
                uri: uri.to_string(),
                source: anyhow!("parse object json: {e}"),
            })?;

        self.cache.insert(uri.to_string(), value.clone());
        Ok(value)
    }

    async fn fetch(&self, url: &str, uri: &Uri) -> anyhow::Result<Vec<u8>> {
        // Signed as the proxy actor when configured; plain fetch as the
        // fallback for hosts that reject our signature scheme.
        if let Some(s) = &self.signed {
            let mut headers = HeaderMap::new();
            headers.insert("Accept", ACCEPT_ACTIVITY.parse().expect("static header"));
            if sign_request_rsa_sha256(
                &s.private_key_pem,
                &s.key_id,
                &Method::GET,
                uri,
                &mut headers,
                &[],
                &["(request-target)", "host", "date"],
            )
            .is_ok()
            {
                let mut req = self.client.get(url).header("Accept", ACCEPT_ACTIVITY);
                for (k, v) in headers.iter() {
                    req = req.header(k.as_str(), v.to_str().unwrap_or_default());
                }
                if let Ok(resp) = send_with_retry(|| req.try_clone().expect("no body"), 3).await {
                    if resp.status().is_success() {
                        return Ok(resp.bytes().await?.to_vec());
                    }
                }
            }
        }

        let resp = send_with_retry(
            || self.client.get(url).header("Accept", ACCEPT_ACTIVITY),
            3,
        )
        .await?;
        if !resp.status().is_success() {
            return Err(anyhow!("status {}", resp.status()));
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn resolver(blocked: &[&str]) -> Resolver {
        let cfg = Config {
            public_base_url: "https://tanzaku.example".into(),
            local_host: "tanzaku.example".into(),
            data_dir: std::env::temp_dir(),
            disable_posts: false,
            max_note_text_length: 1000,
            max_date_skew: Duration::from_secs(300),
            blocked_hosts: blocked.iter().map(|s| s.to_string()).collect(),
            create_limit_per_hour: 300,
        };
        Resolver::new(cfg, reqwest::Client::new(), None)
    }

    #[tokio::test]
    async fn inline_objects_pass_through_with_type_check() {
        let mut r = resolver(&[]);
        let obj = json!({"type": "Note", "content": "hi"});
        let got = r.resolve_typed(obj.clone(), &["Note", "Question"]).await.unwrap();
        assert_eq!(got, obj);

        let e = r
            .resolve_typed(json!({"type": "Airplane"}), &["Note"])
            .await
            .unwrap_err();
        assert!(matches!(e, ResolutionError::TypeMismatch { .. }));
    }

    #[tokio::test]
    async fn blocked_host_rejected_without_fetch() {
        let mut r = resolver(&["bad.example"]);
        let e = r
            .resolve(json!("https://bad.example/notes/1"))
            .await
            .unwrap_err();
        assert!(matches!(e, ResolutionError::HostBlocked(h) if h == "bad.example"));
    }

    #[tokio::test]
    async fn recursion_budget_is_bounded() {
        let mut r = resolver(&[]);
        for _ in 0..RECURSION_LIMIT {
            r.resolve(json!({"type": "Note"})).await.unwrap();
        }
        let e = r.resolve(json!({"type": "Note"})).await.unwrap_err();
        assert!(matches!(e, ResolutionError::RecursionLimit));
    }

    #[tokio::test]
    async fn non_object_non_string_is_invalid() {
        let mut r = resolver(&[]);
        let e = r.resolve(json!(42)).await.unwrap_err();
        assert!(matches!(e, ResolutionError::InvalidUri(_)));
    }
}
