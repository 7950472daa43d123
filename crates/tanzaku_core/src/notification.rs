/*
 * SPDX-FileCopyrightText: 2026 Tanzaku Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Per-note notification batch. Candidates accumulate through `push` with
//! the suppression rules applied up front; `deliver` runs the mute/silence
//! filtering and flushes what survives. The batch never outlives one
//! pipeline invocation.

use crate::id::{gen_id, now_ms};
use crate::social_db::{Note, NotificationRow, SocialDb, User};
use crate::stream::{publish_main_stream, StreamPublisher};
use crate::visibility::Visibility;
use anyhow::Result;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationReason {
    Reply,
    Renote,
    Quote,
    Mention,
    Highlight,
}

impl NotificationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reply => "reply",
            Self::Renote => "renote",
            Self::Quote => "quote",
            Self::Mention => "mention",
            Self::Highlight => "highlight",
        }
    }
}

pub struct NotificationManager {
    notifier_id: String,
    notifier_silenced: bool,
    note_id: String,
    queue: Vec<(String, NotificationReason)>,
}

impl NotificationManager {
    pub fn new(notifier: &User, note: &Note) -> Self {
        Self {
            notifier_id: notifier.id.clone(),
            notifier_silenced: notifier.is_silenced,
            note_id: note.id.clone(),
            queue: Vec::new(),
        }
    }

    /// Push-time suppression: an existing `reply` for a target swallows
    /// later `mention`/`reply` pushes; a `quote` is swallowed once the
    /// target is already mentioned (a `reply` counts, since replying
    /// mentions its target). Further `mention`s after a `mention` are NOT
    /// suppressed. The author never notifies themselves.
    pub fn push(&mut self, notifiee_id: &str, reason: NotificationReason) {
        if self.notifier_id == notifiee_id {
            return;
        }

        let has_reply = self
            .queue
            .iter()
            .any(|(t, r)| t == notifiee_id && *r == NotificationReason::Reply);
        if has_reply
            && matches!(
                reason,
                NotificationReason::Mention | NotificationReason::Reply
            )
        {
            return;
        }

        let has_mention = self.queue.iter().any(|(t, r)| {
            t == notifiee_id
                && matches!(*r, NotificationReason::Mention | NotificationReason::Reply)
        });
        if has_mention && reason == NotificationReason::Quote {
            return;
        }

        self.queue.push((notifiee_id.to_string(), reason));
    }

    pub fn queued(&self) -> &[(String, NotificationReason)] {
        &self.queue
    }

    /// Deliver-time filtering: a silenced author drops the whole batch; each
    /// survivor is checked against the target's mute list individually.
    pub fn deliver(self, social: &SocialDb, stream: &StreamPublisher) -> Result<usize> {
        if self.notifier_silenced {
            return Ok(0);
        }

        let mut delivered = 0usize;
        for (target, reason) in &self.queue {
            match social.is_muted(target, &self.notifier_id) {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    warn!("mute lookup failed for {target}: {e:#}");
                    continue;
                }
            }

            let now = now_ms();
            social.insert_notification(&NotificationRow {
                id: gen_id(now),
                notifiee_id: target.clone(),
                notifier_id: self.notifier_id.clone(),
                reason: reason.as_str().to_string(),
                note_id: self.note_id.clone(),
                created_at_ms: now,
            })?;
            publish_main_stream(
                stream,
                target,
                "notification",
                Some(self.note_id.clone()),
            );
            delivered += 1;
        }
        Ok(delivered)
    }
}

/// Extended pass: local users watching highlighted words get a `highlight`
/// candidate when a visible note contains one of their first 5 words,
/// case-insensitive. `followers` notes require an actual follow.
pub fn notify_extended(social: &SocialDb, note: &Note, nm: &mut NotificationManager) -> Result<()> {
    let Some(text) = note.text.as_deref() else {
        return Ok(());
    };
    let text_lower = text.to_lowercase();

    for user in social.local_users_with_highlighted_words()? {
        if note.visibility == Visibility::Followers
            && !social.is_following(&user.id, &note.user_id)?
        {
            continue;
        }

        let matched = user
            .highlighted_words
            .iter()
            .filter(|w| !w.is_empty())
            .take(5)
            .any(|w| text_lower.contains(&w.to_lowercase()));
        if matched {
            nm.push(&user.id, NotificationReason::Highlight);
        }
    }
    Ok(())
}
