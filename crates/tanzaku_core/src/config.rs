/*
 * SPDX-FileCopyrightText: 2026 Tanzaku Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::path::PathBuf;
use std::time::Duration;

/// Server-wide configuration, loaded once at startup.
#[derive(Clone)]
pub struct Config {
    /// Public origin, no trailing slash (e.g. `https://tanzaku.example`).
    pub public_base_url: String,
    /// Host portion of the public origin; `host == None` on a user row means
    /// this host.
    pub local_host: String,
    pub data_dir: PathBuf,
    /// Refuse all note creation (maintenance / read-only mode).
    pub disable_posts: bool,
    pub max_note_text_length: usize,
    /// Inbound request Date header tolerance.
    pub max_date_skew: Duration,
    /// Hosts we never talk to, exact or `*.suffix`.
    pub blocked_hosts: Vec<String>,
    /// Note creations allowed per local user per rolling hour.
    pub create_limit_per_hour: u32,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let public_base_url = std::env::var("TANZAKU_URL")
            .unwrap_or_else(|_| "http://localhost:3000".to_string())
            .trim_end_matches('/')
            .to_string();
        let local_host = public_base_url
            .split("://")
            .nth(1)
            .unwrap_or("localhost")
            .split('/')
            .next()
            .unwrap_or("localhost")
            .to_string();
        let data_dir = match std::env::var("TANZAKU_DATA_DIR") {
            Ok(v) => PathBuf::from(v),
            Err(_) => crate::keys::default_data_dir()?,
        };
        let blocked_hosts = std::env::var("TANZAKU_BLOCKED_HOSTS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Self {
            public_base_url,
            local_host,
            data_dir,
            disable_posts: std::env::var("TANZAKU_DISABLE_POSTS").is_ok(),
            max_note_text_length: 1000,
            max_date_skew: Duration::from_secs(300),
            blocked_hosts,
            create_limit_per_hour: 300,
        })
    }

    pub fn note_url(&self, note_id: &str) -> String {
        format!("{}/notes/{note_id}", self.public_base_url)
    }

    pub fn user_url(&self, user_id: &str) -> String {
        format!("{}/users/{user_id}", self.public_base_url)
    }

    /// Matches exact host or `*.suffix` entries, case-insensitive.
    pub fn is_blocked_host(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.blocked_hosts.iter().any(|b| {
            let b = b.to_ascii_lowercase();
            if let Some(suffix) = b.strip_prefix("*.") {
                host == suffix || host.ends_with(&format!(".{suffix}"))
            } else {
                host == b
            }
        })
    }
}
