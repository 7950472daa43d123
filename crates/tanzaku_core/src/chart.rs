/*
 * SPDX-FileCopyrightText: 2026 Tanzaku Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Fire-and-forget statistics counters. No singleton documents: every
//! update is an atomic increment against the store, safe across processes.

use crate::social_db::{Note, SocialDb, User};
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct Charts {
    social: Arc<SocialDb>,
}

impl Charts {
    pub fn new(social: Arc<SocialDb>) -> Self {
        Self { social }
    }

    /// Server, per-user and per-instance note counters for one created
    /// note. Failures are logged and swallowed.
    pub fn update_note(&self, note: &Note, author: &User) {
        if let Err(e) = self.social.inc_meta_notes_count(author.is_local()) {
            warn!("meta counter update failed: {e:#}");
        }
        if let Err(e) = self.social.inc_user_notes_count(&author.id) {
            warn!("user counter update failed: {e:#}");
        }
        if let Some(host) = &author.host {
            if let Err(e) = self.social.inc_instance_notes_count(host) {
                warn!("instance counter update failed: {e:#}");
            }
        }
        if !note.tags_lower.is_empty() {
            if let Err(e) = self.social.update_hashtags(&note.tags_lower) {
                warn!("hashtag usage update failed: {e:#}");
            }
        }
    }
}
