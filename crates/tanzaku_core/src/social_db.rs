/*
 * SPDX-FileCopyrightText: 2026 Tanzaku Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::id::now_ms;
use crate::visibility::Visibility;
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Consecutive delivery failures before a host is flagged `not_responding`.
pub const FAILURES_TO_MARK_NOT_RESPONDING: i64 = 16;
/// Sustained failure window before a host is considered gone for good.
pub const CLOSED_WINDOW_MS: i64 = 30 * 24 * 3600 * 1000;

#[derive(Clone)]
pub struct SocialDb {
    path: PathBuf,
}

/// Local/remote split as a tagged variant. Capability checks ("has signing
/// key", "can be delivered to") are predicates over the tag, never dispatch.
/// Deliberately not serializable: the local variant holds the signing key.
#[derive(Debug, Clone, PartialEq)]
pub enum UserKind {
    Local {
        private_key_pem: Option<String>,
    },
    Remote {
        inbox: String,
        shared_inbox: Option<String>,
        uri: String,
        url: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub username: String,
    /// None for local users.
    pub host: Option<String>,
    pub name: Option<String>,
    pub summary: Option<String>,
    pub kind: UserKind,
    pub public_key_pem: Option<String>,
    pub is_bot: bool,
    pub is_cat: bool,
    pub is_locked: bool,
    pub is_explorable: bool,
    pub is_silenced: bool,
    pub is_suspended: bool,
    pub no_federation: bool,
    /// `None` = public, `"none"` = indexing opt-out.
    pub searchable_by: Option<String>,
    pub notes_count: i64,
    pub highlighted_words: Vec<String>,
    pub profile_fields: Vec<(String, String)>,
    pub created_at_ms: i64,
}

impl User {
    pub fn is_local(&self) -> bool {
        matches!(self.kind, UserKind::Local { .. })
    }

    pub fn is_remote(&self) -> bool {
        !self.is_local()
    }

    pub fn signing_key_pem(&self) -> Option<&str> {
        match &self.kind {
            UserKind::Local { private_key_pem } => private_key_pem.as_deref(),
            UserKind::Remote { .. } => None,
        }
    }

    /// Inbox for a direct delivery; shared inbox is only preferred when
    /// fanning out to a whole host.
    pub fn inbox(&self) -> Option<&str> {
        match &self.kind {
            UserKind::Local { .. } => None,
            UserKind::Remote { inbox, .. } => Some(inbox),
        }
    }

    pub fn shared_inbox(&self) -> Option<&str> {
        match &self.kind {
            UserKind::Local { .. } => None,
            UserKind::Remote { shared_inbox, .. } => shared_inbox.as_deref(),
        }
    }

    pub fn uri(&self) -> Option<&str> {
        match &self.kind {
            UserKind::Local { .. } => None,
            UserKind::Remote { uri, .. } => Some(uri),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollChoice {
    pub text: String,
    pub votes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Poll {
    pub choices: Vec<PollChoice>,
    pub multiple: bool,
    pub expires_at_ms: Option<i64>,
}

/// Denormalized point-in-time snapshot of a reply/renote target, captured at
/// creation and never refreshed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteRef {
    pub note_id: String,
    pub user_id: String,
    pub user_host: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMention {
    pub uri: String,
    pub url: Option<String>,
    pub username: String,
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: String,
    pub user_id: String,
    pub user_host: Option<String>,
    pub text: Option<String>,
    pub cw: Option<String>,
    pub visibility: Visibility,
    pub local_only: bool,
    pub copy_once: bool,
    pub reply: Option<NoteRef>,
    pub renote: Option<NoteRef>,
    pub file_ids: Vec<String>,
    pub tags: Vec<String>,
    pub tags_lower: Vec<String>,
    pub emojis: Vec<String>,
    pub mentions: Vec<String>,
    pub mentioned_remote_users: Vec<RemoteMention>,
    pub visible_user_ids: Vec<String>,
    pub poll: Option<Poll>,
    /// Canonical object uri for remote-originated notes.
    pub uri: Option<String>,
    pub url: Option<String>,
    pub via_mobile: bool,
    pub geo: Option<serde_json::Value>,
    pub replies_count: i64,
    pub renote_count: i64,
    pub quote_count: i64,
    pub score: i64,
    pub expires_at_ms: Option<i64>,
    pub created_at_ms: i64,
    pub deleted_at_ms: Option<i64>,
}

impl Note {
    /// A renote carrying no text, files, or poll of its own.
    pub fn is_pure_renote(&self) -> bool {
        self.renote.is_some() && self.text.is_none() && self.file_ids.is_empty() && self.poll.is_none()
    }

    pub fn is_quote(&self) -> bool {
        self.renote.is_some() && !self.is_pure_renote()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at_ms.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct Instance {
    pub host: String,
    pub notes_count: i64,
    pub latest_failures: i64,
    pub not_responding: bool,
    pub marked_as_closed: bool,
    pub first_retrieved_at_ms: i64,
    pub latest_delivered_at_ms: Option<i64>,
    pub failing_since_ms: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct FollowerInbox {
    pub host: String,
    pub inbox: Option<String>,
    pub shared_inbox: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NotificationRow {
    pub id: String,
    pub notifiee_id: String,
    pub notifier_id: String,
    pub reason: String,
    pub note_id: String,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct DriveFile {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub url: String,
    pub content_type: String,
    pub is_sensitive: bool,
}

impl SocialDb {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn =
            Connection::open(&path).with_context(|| format!("open db: {}", path.display()))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS users (
              id TEXT PRIMARY KEY,
              username TEXT NOT NULL,
              host TEXT NULL,
              name TEXT NULL,
              summary TEXT NULL,
              inbox TEXT NULL,
              shared_inbox TEXT NULL,
              uri TEXT NULL,
              url TEXT NULL,
              public_key_pem TEXT NULL,
              private_key_pem TEXT NULL,
              is_bot INTEGER NOT NULL DEFAULT 0,
              is_cat INTEGER NOT NULL DEFAULT 0,
              is_locked INTEGER NOT NULL DEFAULT 0,
              is_explorable INTEGER NOT NULL DEFAULT 1,
              is_silenced INTEGER NOT NULL DEFAULT 0,
              is_suspended INTEGER NOT NULL DEFAULT 0,
              no_federation INTEGER NOT NULL DEFAULT 0,
              searchable_by TEXT NULL,
              notes_count INTEGER NOT NULL DEFAULT 0,
              highlighted_words TEXT NOT NULL DEFAULT '[]',
              profile_fields TEXT NOT NULL DEFAULT '[]',
              created_at_ms INTEGER NOT NULL,
              updated_at_ms INTEGER NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_users_acct ON users(username, host);

            CREATE TABLE IF NOT EXISTS notes (
              id TEXT PRIMARY KEY,
              user_id TEXT NOT NULL,
              user_host TEXT NULL,
              text TEXT NULL,
              cw TEXT NULL,
              visibility TEXT NOT NULL,
              local_only INTEGER NOT NULL DEFAULT 0,
              copy_once INTEGER NOT NULL DEFAULT 0,
              reply_id TEXT NULL,
              reply_user_id TEXT NULL,
              reply_user_host TEXT NULL,
              renote_id TEXT NULL,
              renote_user_id TEXT NULL,
              renote_user_host TEXT NULL,
              file_ids TEXT NOT NULL DEFAULT '[]',
              tags TEXT NOT NULL DEFAULT '[]',
              tags_lower TEXT NOT NULL DEFAULT '[]',
              emojis TEXT NOT NULL DEFAULT '[]',
              mentions TEXT NOT NULL DEFAULT '[]',
              mentioned_remote_users TEXT NOT NULL DEFAULT '[]',
              visible_user_ids TEXT NOT NULL DEFAULT '[]',
              poll TEXT NULL,
              uri TEXT NULL,
              url TEXT NULL,
              via_mobile INTEGER NOT NULL DEFAULT 0,
              geo TEXT NULL,
              replies_count INTEGER NOT NULL DEFAULT 0,
              renote_count INTEGER NOT NULL DEFAULT 0,
              quote_count INTEGER NOT NULL DEFAULT 0,
              quote_ids TEXT NOT NULL DEFAULT '[]',
              score INTEGER NOT NULL DEFAULT 0,
              expires_at_ms INTEGER NULL,
              created_at_ms INTEGER NOT NULL,
              deleted_at_ms INTEGER NULL
            );
            CREATE INDEX IF NOT EXISTS idx_notes_user ON notes(user_id, created_at_ms);
            CREATE INDEX IF NOT EXISTS idx_notes_expiry ON notes(expires_at_ms) WHERE expires_at_ms IS NOT NULL;

            CREATE TABLE IF NOT EXISTS followings (
              follower_id TEXT NOT NULL,
              followee_id TEXT NOT NULL,
              follower_host TEXT NULL,
              follower_inbox TEXT NULL,
              follower_shared_inbox TEXT NULL,
              created_at_ms INTEGER NOT NULL,
              PRIMARY KEY (follower_id, followee_id)
            );
            CREATE INDEX IF NOT EXISTS idx_followings_followee ON followings(followee_id);

            CREATE TABLE IF NOT EXISTS mutings (
              muter_id TEXT NOT NULL,
              mutee_id TEXT NOT NULL,
              created_at_ms INTEGER NOT NULL,
              PRIMARY KEY (muter_id, mutee_id)
            );

            CREATE TABLE IF NOT EXISTS instances (
              host TEXT PRIMARY KEY,
              notes_count INTEGER NOT NULL DEFAULT 0,
              latest_failures INTEGER NOT NULL DEFAULT 0,
              not_responding INTEGER NOT NULL DEFAULT 0,
              marked_as_closed INTEGER NOT NULL DEFAULT 0,
              first_retrieved_at_ms INTEGER NOT NULL,
              latest_delivered_at_ms INTEGER NULL,
              failing_since_ms INTEGER NULL
            );

            CREATE TABLE IF NOT EXISTS notifications (
              id TEXT PRIMARY KEY,
              notifiee_id TEXT NOT NULL,
              notifier_id TEXT NOT NULL,
              reason TEXT NOT NULL,
              note_id TEXT NOT NULL,
              is_read INTEGER NOT NULL DEFAULT 0,
              created_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_notifications_notifiee ON notifications(notifiee_id, created_at_ms);

            CREATE TABLE IF NOT EXISTS note_unreads (
              user_id TEXT NOT NULL,
              note_id TEXT NOT NULL,
              is_specified INTEGER NOT NULL DEFAULT 0,
              PRIMARY KEY (user_id, note_id)
            );

            CREATE TABLE IF NOT EXISTS relays (
              inbox TEXT PRIMARY KEY,
              status TEXT NOT NULL DEFAULT 'accepted'
            );

            CREATE TABLE IF NOT EXISTS drive_files (
              id TEXT PRIMARY KEY,
              user_id TEXT NOT NULL,
              name TEXT NOT NULL,
              url TEXT NOT NULL,
              content_type TEXT NOT NULL,
              is_sensitive INTEGER NOT NULL DEFAULT 0,
              attached_note_ids TEXT NOT NULL DEFAULT '[]'
            );

            CREATE TABLE IF NOT EXISTS hashtags (
              tag TEXT PRIMARY KEY,
              usage_count INTEGER NOT NULL DEFAULT 0,
              last_used_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS meta (
              id INTEGER PRIMARY KEY CHECK (id = 1),
              notes_count INTEGER NOT NULL DEFAULT 0,
              original_notes_count INTEGER NOT NULL DEFAULT 0
            );
            INSERT OR IGNORE INTO meta(id) VALUES (1);
            "#,
        )?;
        Ok(Self { path })
    }

    // ---- users ----

    pub fn upsert_user(&self, u: &User) -> Result<()> {
        let conn = Connection::open(&self.path)?;
        let (inbox, shared_inbox, uri, url, private_key_pem) = match &u.kind {
            UserKind::Local { private_key_pem } => {
                (None, None, None, None, private_key_pem.clone())
            }
            UserKind::Remote {
                inbox,
                shared_inbox,
                uri,
                url,
            } => (
                Some(inbox.clone()),
                shared_inbox.clone(),
                Some(uri.clone()),
                url.clone(),
                None,
            ),
        };
        conn.execute(
            r#"
            INSERT INTO users (
              id, username, host, name, summary, inbox, shared_inbox, uri, url,
              public_key_pem, private_key_pem, is_bot, is_cat, is_locked, is_explorable,
              is_silenced, is_suspended, no_federation, searchable_by, notes_count,
              highlighted_words, profile_fields, created_at_ms
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23)
            ON CONFLICT(id) DO UPDATE SET
              name=excluded.name, summary=excluded.summary, inbox=excluded.inbox,
              shared_inbox=excluded.shared_inbox, url=excluded.url,
              public_key_pem=excluded.public_key_pem,
              is_bot=excluded.is_bot, is_cat=excluded.is_cat, is_locked=excluded.is_locked,
              is_explorable=excluded.is_explorable, is_silenced=excluded.is_silenced,
              is_suspended=excluded.is_suspended, no_federation=excluded.no_federation,
              searchable_by=excluded.searchable_by,
              highlighted_words=excluded.highlighted_words,
              profile_fields=excluded.profile_fields,
              updated_at_ms=?24
            "#,
            params![
                u.id,
                u.username,
                u.host,
                u.name,
                u.summary,
                inbox,
                shared_inbox,
                uri,
                url,
                u.public_key_pem,
                private_key_pem,
                u.is_bot,
                u.is_cat,
                u.is_locked,
                u.is_explorable,
                u.is_silenced,
                u.is_suspended,
                u.no_federation,
                u.searchable_by,
                u.notes_count,
                serde_json::to_string(&u.highlighted_words)?,
                serde_json::to_string(&u.profile_fields)?,
                u.created_at_ms,
                now_ms(),
            ],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: &str) -> Result<Option<User>> {
        let conn = Connection::open(&self.path)?;
        let mut stmt = conn.prepare(&format!("{USER_SELECT} WHERE id=?1"))?;
        let u = stmt.query_row(params![id], row_to_user).optional()?;
        Ok(u)
    }

    pub fn get_user_by_acct(&self, username: &str, host: Option<&str>) -> Result<Option<User>> {
        let conn = Connection::open(&self.path)?;
        let u = match host {
            Some(h) => {
                let mut stmt =
                    conn.prepare(&format!("{USER_SELECT} WHERE username=?1 AND host=?2"))?;
                stmt.query_row(params![username, h], row_to_user).optional()?
            }
            None => {
                let mut stmt =
                    conn.prepare(&format!("{USER_SELECT} WHERE username=?1 AND host IS NULL"))?;
                stmt.query_row(params![username], row_to_user).optional()?
            }
        };
        Ok(u)
    }

    pub fn get_user_by_uri(&self, uri: &str) -> Result<Option<User>> {
        let conn = Connection::open(&self.path)?;
        let mut stmt = conn.prepare(&format!("{USER_SELECT} WHERE uri=?1"))?;
        let u = stmt.query_row(params![uri], row_to_user).optional()?;
        Ok(u)
    }

    pub fn inc_user_notes_count(&self, user_id: &str) -> Result<()> {
        let conn = Connection::open(&self.path)?;
        conn.execute(
            "UPDATE users SET notes_count = notes_count + 1, updated_at_ms=?2 WHERE id=?1",
            params![user_id, now_ms()],
        )?;
        Ok(())
    }

    pub fn local_users_with_highlighted_words(&self) -> Result<Vec<User>> {
        let conn = Connection::open(&self.path)?;
        let mut stmt = conn.prepare(&format!(
            "{USER_SELECT} WHERE host IS NULL AND highlighted_words != '[]'"
        ))?;
        let rows = stmt.query_map([], row_to_user)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// 410 from an inbox means the account is gone: stop addressing it.
    pub fn clear_inbox_by_url(&self, inbox_url: &str) -> Result<u64> {
        let conn = Connection::open(&self.path)?;
        let a = conn.execute(
            "UPDATE users SET inbox = NULL WHERE inbox = ?1",
            params![inbox_url],
        )?;
        let b = conn.execute(
            "UPDATE users SET shared_inbox = NULL WHERE shared_inbox = ?1",
            params![inbox_url],
        )?;
        let c = conn.execute(
            "UPDATE followings SET follower_inbox = NULL WHERE follower_inbox = ?1",
            params![inbox_url],
        )?;
        let d = conn.execute(
            "UPDATE followings SET follower_shared_inbox = NULL WHERE follower_shared_inbox = ?1",
            params![inbox_url],
        )?;
        Ok((a + b + c + d) as u64)
    }

    // ---- notes ----

    /// Insert guarded by the primary-key uniqueness constraint. A duplicate
    /// id is an idempotent no-op: `Ok(None)`, not an error.
    pub fn insert_note(&self, n: &Note) -> Result<Option<Note>> {
        let conn = Connection::open(&self.path)?;
        let res = conn.execute(
            r#"
            INSERT INTO notes (
              id, user_id, user_host, text, cw, visibility, local_only, copy_once,
              reply_id, reply_user_id, reply_user_host,
              renote_id, renote_user_id, renote_user_host,
              file_ids, tags, tags_lower, emojis, mentions, mentioned_remote_users,
              visible_user_ids, poll, uri, url, via_mobile, geo,
              expires_at_ms, created_at_ms
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23,?24,?25,?26,?27,?28)
            "#,
            params![
                n.id,
                n.user_id,
                n.user_host,
                n.text,
                n.cw,
                n.visibility.as_str(),
                n.local_only,
                n.copy_once,
                n.reply.as_ref().map(|r| r.note_id.clone()),
                n.reply.as_ref().map(|r| r.user_id.clone()),
                n.reply.as_ref().and_then(|r| r.user_host.clone()),
                n.renote.as_ref().map(|r| r.note_id.clone()),
                n.renote.as_ref().map(|r| r.user_id.clone()),
                n.renote.as_ref().and_then(|r| r.user_host.clone()),
                serde_json::to_string(&n.file_ids)?,
                serde_json::to_string(&n.tags)?,
                serde_json::to_string(&n.tags_lower)?,
                serde_json::to_string(&n.emojis)?,
                serde_json::to_string(&n.mentions)?,
                serde_json::to_string(&n.mentioned_remote_users)?,
                serde_json::to_string(&n.visible_user_ids)?,
                n.poll.as_ref().map(serde_json::to_string).transpose()?,
                n.uri,
                n.url,
                n.via_mobile,
                n.geo.as_ref().map(serde_json::to_string).transpose()?,
                n.expires_at_ms,
                n.created_at_ms,
            ],
        );
        match res {
            Ok(_) => Ok(Some(n.clone())),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_note(&self, id: &str) -> Result<Option<Note>> {
        let conn = Connection::open(&self.path)?;
        let mut stmt = conn.prepare(&format!("{NOTE_SELECT} WHERE id=?1"))?;
        let n = stmt.query_row(params![id], row_to_note).optional()?;
        Ok(n)
    }

    pub fn get_note_by_uri(&self, uri: &str) -> Result<Option<Note>> {
        let conn = Connection::open(&self.path)?;
        let mut stmt = conn.prepare(&format!("{NOTE_SELECT} WHERE uri=?1"))?;
        let n = stmt.query_row(params![uri], row_to_note).optional()?;
        Ok(n)
    }

    pub fn update_note_poll(&self, note_id: &str, poll: &Poll) -> Result<()> {
        let conn = Connection::open(&self.path)?;
        conn.execute(
            "UPDATE notes SET poll=?2 WHERE id=?1",
            params![note_id, serde_json::to_string(poll)?],
        )?;
        Ok(())
    }

    pub fn soft_delete_note(&self, id: &str) -> Result<bool> {
        let conn = Connection::open(&self.path)?;
        let changed = conn.execute(
            "UPDATE notes SET deleted_at_ms=?2 WHERE id=?1 AND deleted_at_ms IS NULL",
            params![id, now_ms()],
        )?;
        Ok(changed > 0)
    }

    /// Notes whose expiry has passed and that are still alive. Deleting a
    /// note first makes its expiry a no-op.
    pub fn list_expired_note_ids(&self, now: i64, limit: u32) -> Result<Vec<String>> {
        let conn = Connection::open(&self.path)?;
        let mut stmt = conn.prepare(
            "SELECT id FROM notes WHERE expires_at_ms IS NOT NULL AND expires_at_ms <= ?1 AND deleted_at_ms IS NULL LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![now, limit], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn inc_replies_count(&self, note_id: &str) -> Result<()> {
        let conn = Connection::open(&self.path)?;
        conn.execute(
            "UPDATE notes SET replies_count = replies_count + 1 WHERE id=?1",
            params![note_id],
        )?;
        Ok(())
    }

    pub fn inc_renote_count(&self, note_id: &str, score_delta: i64) -> Result<()> {
        let conn = Connection::open(&self.path)?;
        conn.execute(
            "UPDATE notes SET renote_count = renote_count + 1, score = score + ?2 WHERE id=?1",
            params![note_id, score_delta],
        )?;
        Ok(())
    }

    pub fn inc_quote_count(&self, note_id: &str) -> Result<()> {
        let conn = Connection::open(&self.path)?;
        conn.execute(
            "UPDATE notes SET quote_count = quote_count + 1 WHERE id=?1",
            params![note_id],
        )?;
        Ok(())
    }

    pub fn append_quote_backref(&self, note_id: &str, quote_id: &str) -> Result<()> {
        let conn = Connection::open(&self.path)?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT quote_ids FROM notes WHERE id=?1",
                params![note_id],
                |r| r.get(0),
            )
            .optional()?;
        let Some(existing) = existing else {
            return Ok(());
        };
        let mut ids: Vec<String> = serde_json::from_str(&existing).unwrap_or_default();
        if !ids.iter().any(|i| i == quote_id) {
            ids.push(quote_id.to_string());
        }
        conn.execute(
            "UPDATE notes SET quote_ids=?2 WHERE id=?1",
            params![note_id, serde_json::to_string(&ids)?],
        )?;
        Ok(())
    }

    // ---- followings / mutes ----

    pub fn add_following(
        &self,
        follower: &User,
        followee_id: &str,
    ) -> Result<()> {
        let conn = Connection::open(&self.path)?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO followings
              (follower_id, followee_id, follower_host, follower_inbox, follower_shared_inbox, created_at_ms)
            VALUES (?1,?2,?3,?4,?5,?6)
            "#,
            params![
                follower.id,
                followee_id,
                follower.host,
                follower.inbox(),
                follower.shared_inbox(),
                now_ms(),
            ],
        )?;
        Ok(())
    }

    pub fn is_following(&self, follower_id: &str, followee_id: &str) -> Result<bool> {
        let conn = Connection::open(&self.path)?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM followings WHERE follower_id=?1 AND followee_id=?2",
                params![follower_id, followee_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Remote follower inboxes for fanout, denormalized at follow time.
    pub fn list_remote_follower_inboxes(&self, followee_id: &str) -> Result<Vec<FollowerInbox>> {
        let conn = Connection::open(&self.path)?;
        let mut stmt = conn.prepare(
            r#"
            SELECT follower_host, follower_inbox, follower_shared_inbox
            FROM followings
            WHERE followee_id=?1 AND follower_host IS NOT NULL
            "#,
        )?;
        let rows = stmt.query_map(params![followee_id], |r| {
            Ok(FollowerInbox {
                host: r.get(0)?,
                inbox: r.get(1)?,
                shared_inbox: r.get(2)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn add_muting(&self, muter_id: &str, mutee_id: &str) -> Result<()> {
        let conn = Connection::open(&self.path)?;
        conn.execute(
            "INSERT OR IGNORE INTO mutings (muter_id, mutee_id, created_at_ms) VALUES (?1,?2,?3)",
            params![muter_id, mutee_id, now_ms()],
        )?;
        Ok(())
    }

    pub fn is_muted(&self, muter_id: &str, mutee_id: &str) -> Result<bool> {
        let conn = Connection::open(&self.path)?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM mutings WHERE muter_id=?1 AND mutee_id=?2",
                params![muter_id, mutee_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    // ---- notifications ----

    pub fn insert_notification(&self, n: &NotificationRow) -> Result<()> {
        let conn = Connection::open(&self.path)?;
        conn.execute(
            r#"
            INSERT INTO notifications (id, notifiee_id, notifier_id, reason, note_id, created_at_ms)
            VALUES (?1,?2,?3,?4,?5,?6)
            "#,
            params![
                n.id,
                n.notifiee_id,
                n.notifier_id,
                n.reason,
                n.note_id,
                n.created_at_ms
            ],
        )?;
        Ok(())
    }

    pub fn list_notifications_for(&self, notifiee_id: &str) -> Result<Vec<NotificationRow>> {
        let conn = Connection::open(&self.path)?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, notifiee_id, notifier_id, reason, note_id, created_at_ms
            FROM notifications WHERE notifiee_id=?1 ORDER BY created_at_ms ASC
            "#,
        )?;
        let rows = stmt.query_map(params![notifiee_id], |r| {
            Ok(NotificationRow {
                id: r.get(0)?,
                notifiee_id: r.get(1)?,
                notifier_id: r.get(2)?,
                reason: r.get(3)?,
                note_id: r.get(4)?,
                created_at_ms: r.get(5)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn insert_note_unread(&self, user_id: &str, note_id: &str, is_specified: bool) -> Result<()> {
        let conn = Connection::open(&self.path)?;
        conn.execute(
            "INSERT OR IGNORE INTO note_unreads (user_id, note_id, is_specified) VALUES (?1,?2,?3)",
            params![user_id, note_id, is_specified],
        )?;
        Ok(())
    }

    // ---- instances ----

    /// Created lazily on first contact with a host.
    pub fn register_or_fetch_instance(&self, host: &str) -> Result<Instance> {
        let conn = Connection::open(&self.path)?;
        conn.execute(
            "INSERT OR IGNORE INTO instances (host, first_retrieved_at_ms) VALUES (?1, ?2)",
            params![host, now_ms()],
        )?;
        let inst = conn.query_row(
            r#"
            SELECT host, notes_count, latest_failures, not_responding, marked_as_closed,
                   first_retrieved_at_ms, latest_delivered_at_ms, failing_since_ms
            FROM instances WHERE host=?1
            "#,
            params![host],
            row_to_instance,
        )?;
        Ok(inst)
    }

    pub fn get_instance(&self, host: &str) -> Result<Option<Instance>> {
        let conn = Connection::open(&self.path)?;
        let inst = conn
            .query_row(
                r#"
                SELECT host, notes_count, latest_failures, not_responding, marked_as_closed,
                       first_retrieved_at_ms, latest_delivered_at_ms, failing_since_ms
                FROM instances WHERE host=?1
                "#,
                params![host],
                row_to_instance,
            )
            .optional()?;
        Ok(inst)
    }

    pub fn inc_instance_notes_count(&self, host: &str) -> Result<()> {
        self.register_or_fetch_instance(host)?;
        let conn = Connection::open(&self.path)?;
        conn.execute(
            "UPDATE instances SET notes_count = notes_count + 1 WHERE host=?1",
            params![host],
        )?;
        Ok(())
    }

    /// Single conditional statement; safe under concurrent delivery workers.
    pub fn instance_delivery_succeeded(&self, host: &str) -> Result<()> {
        self.register_or_fetch_instance(host)?;
        let conn = Connection::open(&self.path)?;
        conn.execute(
            r#"
            UPDATE instances SET
              latest_failures = 0,
              not_responding = 0,
              failing_since_ms = NULL,
              latest_delivered_at_ms = ?2
            WHERE host=?1
            "#,
            params![host, now_ms()],
        )?;
        Ok(())
    }

    pub fn instance_delivery_failed(&self, host: &str) -> Result<()> {
        self.register_or_fetch_instance(host)?;
        let now = now_ms();
        let conn = Connection::open(&self.path)?;
        conn.execute(
            r#"
            UPDATE instances SET
              latest_failures = latest_failures + 1,
              failing_since_ms = COALESCE(failing_since_ms, ?2),
              not_responding = CASE WHEN latest_failures + 1 >= ?3 THEN 1 ELSE not_responding END,
              marked_as_closed = CASE
                WHEN ?2 - COALESCE(failing_since_ms, ?2) >= ?4 THEN 1
                ELSE marked_as_closed
              END
            WHERE host=?1
            "#,
            params![host, now, FAILURES_TO_MARK_NOT_RESPONDING, CLOSED_WINDOW_MS],
        )?;
        Ok(())
    }

    // ---- relays ----

    pub fn add_relay(&self, inbox: &str) -> Result<()> {
        let conn = Connection::open(&self.path)?;
        conn.execute(
            "INSERT OR IGNORE INTO relays (inbox) VALUES (?1)",
            params![inbox],
        )?;
        Ok(())
    }

    pub fn list_relay_inboxes(&self) -> Result<Vec<String>> {
        let conn = Connection::open(&self.path)?;
        let mut stmt = conn.prepare("SELECT inbox FROM relays WHERE status='accepted'")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    // ---- drive ----

    pub fn insert_drive_file(&self, f: &DriveFile) -> Result<()> {
        let conn = Connection::open(&self.path)?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO drive_files (id, user_id, name, url, content_type, is_sensitive)
            VALUES (?1,?2,?3,?4,?5,?6)
            "#,
            params![f.id, f.user_id, f.name, f.url, f.content_type, f.is_sensitive],
        )?;
        Ok(())
    }

    /// Resolve attachment ids to records, restricted to the owner. Unknown
    /// ids are silently dropped.
    pub fn get_drive_files(&self, ids: &[String], owner_id: &str) -> Result<Vec<DriveFile>> {
        let conn = Connection::open(&self.path)?;
        let mut out = Vec::new();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, name, url, content_type, is_sensitive FROM drive_files WHERE id=?1 AND user_id=?2",
        )?;
        for id in ids {
            let f = stmt
                .query_row(params![id, owner_id], |r| {
                    Ok(DriveFile {
                        id: r.get(0)?,
                        user_id: r.get(1)?,
                        name: r.get(2)?,
                        url: r.get(3)?,
                        content_type: r.get(4)?,
                        is_sensitive: r.get(5)?,
                    })
                })
                .optional()?;
            if let Some(f) = f {
                out.push(f);
            }
        }
        Ok(out)
    }

    pub fn attach_note_to_file(&self, file_id: &str, note_id: &str) -> Result<()> {
        let conn = Connection::open(&self.path)?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT attached_note_ids FROM drive_files WHERE id=?1",
                params![file_id],
                |r| r.get(0),
            )
            .optional()?;
        let Some(existing) = existing else {
            return Ok(());
        };
        let mut ids: Vec<String> = serde_json::from_str(&existing).unwrap_or_default();
        if !ids.iter().any(|i| i == note_id) {
            ids.push(note_id.to_string());
        }
        conn.execute(
            "UPDATE drive_files SET attached_note_ids=?2 WHERE id=?1",
            params![file_id, serde_json::to_string(&ids)?],
        )?;
        Ok(())
    }

    // ---- hashtags / meta ----

    pub fn update_hashtags(&self, tags_lower: &[String]) -> Result<()> {
        let conn = Connection::open(&self.path)?;
        for tag in tags_lower {
            conn.execute(
                r#"
                INSERT INTO hashtags (tag, usage_count, last_used_ms) VALUES (?1, 1, ?2)
                ON CONFLICT(tag) DO UPDATE SET usage_count = usage_count + 1, last_used_ms=excluded.last_used_ms
                "#,
                params![tag, now_ms()],
            )?;
        }
        Ok(())
    }

    pub fn inc_meta_notes_count(&self, original: bool) -> Result<()> {
        let conn = Connection::open(&self.path)?;
        if original {
            conn.execute(
                "UPDATE meta SET notes_count = notes_count + 1, original_notes_count = original_notes_count + 1 WHERE id=1",
                [],
            )?;
        } else {
            conn.execute("UPDATE meta SET notes_count = notes_count + 1 WHERE id=1", [])?;
        }
        Ok(())
    }

    pub fn meta_notes_count(&self) -> Result<(i64, i64)> {
        let conn = Connection::open(&self.path)?;
        let v = conn.query_row(
            "SELECT notes_count, original_notes_count FROM meta WHERE id=1",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        Ok(v)
    }
}

const USER_SELECT: &str = r#"
SELECT id, username, host, name, summary, inbox, shared_inbox, uri, url,
       public_key_pem, private_key_pem, is_bot, is_cat, is_locked, is_explorable,
       is_silenced, is_suspended, no_federation, searchable_by, notes_count,
       highlighted_words, profile_fields, created_at_ms
FROM users
"#;

fn row_to_user(r: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let host: Option<String> = r.get(2)?;
    let inbox: Option<String> = r.get(5)?;
    let shared_inbox: Option<String> = r.get(6)?;
    let uri: Option<String> = r.get(7)?;
    let url: Option<String> = r.get(8)?;
    let private_key_pem: Option<String> = r.get(10)?;
    let kind = match host {
        Some(_) => UserKind::Remote {
            inbox: inbox.unwrap_or_default(),
            shared_inbox,
            uri: uri.unwrap_or_default(),
            url,
        },
        None => UserKind::Local { private_key_pem },
    };
    let highlighted_words: String = r.get(20)?;
    let profile_fields: String = r.get(21)?;
    Ok(User {
        id: r.get(0)?,
        username: r.get(1)?,
        host: r.get(2)?,
        name: r.get(3)?,
        summary: r.get(4)?,
        kind,
        public_key_pem: r.get(9)?,
        is_bot: r.get(11)?,
        is_cat: r.get(12)?,
        is_locked: r.get(13)?,
        is_explorable: r.get(14)?,
        is_silenced: r.get(15)?,
        is_suspended: r.get(16)?,
        no_federation: r.get(17)?,
        searchable_by: r.get(18)?,
        notes_count: r.get(19)?,
        highlighted_words: serde_json::from_str(&highlighted_words).unwrap_or_default(),
        profile_fields: serde_json::from_str(&profile_fields).unwrap_or_default(),
        created_at_ms: r.get(22)?,
    })
}

const NOTE_SELECT: &str = r#"
SELECT id, user_id, user_host, text, cw, visibility, local_only, copy_once,
       reply_id, reply_user_id, reply_user_host,
       renote_id, renote_user_id, renote_user_host,
       file_ids, tags, tags_lower, emojis, mentions, mentioned_remote_users,
       visible_user_ids, poll, uri, url, via_mobile, geo,
       replies_count, renote_count, quote_count, score,
       expires_at_ms, created_at_ms, deleted_at_ms
FROM notes
"#;

fn row_to_note(r: &rusqlite::Row<'_>) -> rusqlite::Result<Note> {
    fn json_vec<T: serde::de::DeserializeOwned>(s: String) -> Vec<T> {
        serde_json::from_str(&s).unwrap_or_default()
    }
    let visibility: String = r.get(5)?;
    let reply_id: Option<String> = r.get(8)?;
    let renote_id: Option<String> = r.get(11)?;
    let poll: Option<String> = r.get(21)?;
    let geo: Option<String> = r.get(25)?;
    Ok(Note {
        id: r.get(0)?,
        user_id: r.get(1)?,
        user_host: r.get(2)?,
        text: r.get(3)?,
        cw: r.get(4)?,
        visibility: Visibility::parse(&visibility).unwrap_or(Visibility::Public),
        local_only: r.get(6)?,
        copy_once: r.get(7)?,
        reply: reply_id.map(|note_id| {
            Ok::<_, rusqlite::Error>(NoteRef {
                note_id,
                user_id: r.get::<_, Option<String>>(9)?.unwrap_or_default(),
                user_host: r.get(10)?,
            })
        }).transpose()?,
        renote: renote_id.map(|note_id| {
            Ok::<_, rusqlite::Error>(NoteRef {
                note_id,
                user_id: r.get::<_, Option<String>>(12)?.unwrap_or_default(),
                user_host: r.get(13)?,
            })
        }).transpose()?,
        file_ids: json_vec(r.get(14)?),
        tags: json_vec(r.get(15)?),
        tags_lower: json_vec(r.get(16)?),
        emojis: json_vec(r.get(17)?),
        mentions: json_vec(r.get(18)?),
        mentioned_remote_users: json_vec(r.get(19)?),
        visible_user_ids: json_vec(r.get(20)?),
        poll: poll.and_then(|s| serde_json::from_str(&s).ok()),
        uri: r.get(22)?,
        url: r.get(23)?,
        via_mobile: r.get(24)?,
        geo: geo.and_then(|s| serde_json::from_str(&s).ok()),
        replies_count: r.get(26)?,
        renote_count: r.get(27)?,
        quote_count: r.get(28)?,
        score: r.get(29)?,
        expires_at_ms: r.get(30)?,
        created_at_ms: r.get(31)?,
        deleted_at_ms: r.get(32)?,
    })
}

fn row_to_instance(r: &rusqlite::Row<'_>) -> rusqlite::Result<Instance> {
    Ok(Instance {
        host: r.get(0)?,
        notes_count: r.get(1)?,
        latest_failures: r.get(2)?,
        not_responding: r.get(3)?,
        marked_as_closed: r.get(4)?,
        first_retrieved_at_ms: r.get(5)?,
        latest_delivered_at_ms: r.get(6)?,
        failing_since_ms: r.get(7)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rand::RngCore;

    pub fn temp_db() -> SocialDb {
        let mut b = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut b);
        let path = std::env::temp_dir().join(format!("tanzaku-test-{}.db", hex::encode(b)));
        SocialDb::open(path).unwrap()
    }

    pub fn local_user(id: &str, username: &str) -> User {
        User {
            id: id.to_string(),
            username: username.to_string(),
            host: None,
            name: None,
            summary: None,
            kind: UserKind::Local {
                private_key_pem: None,
            },
            public_key_pem: None,
            is_bot: false,
            is_cat: false,
            is_locked: false,
            is_explorable: true,
            is_silenced: false,
            is_suspended: false,
            no_federation: false,
            searchable_by: None,
            notes_count: 0,
            highlighted_words: Vec::new(),
            profile_fields: Vec::new(),
            created_at_ms: now_ms(),
        }
    }

    pub fn remote_user(id: &str, username: &str, host: &str, shared: bool) -> User {
        let mut u = local_user(id, username);
        u.host = Some(host.to_string());
        u.kind = UserKind::Remote {
            inbox: format!("https://{host}/users/{username}/inbox"),
            shared_inbox: shared.then(|| format!("https://{host}/inbox")),
            uri: format!("https://{host}/users/{username}"),
            url: None,
        };
        u
    }

    pub fn bare_note(id: &str, user_id: &str, text: Option<&str>) -> Note {
        Note {
            id: id.to_string(),
            user_id: user_id.to_string(),
            user_host: None,
            text: text.map(str::to_string),
            cw: None,
            visibility: Visibility::Public,
            local_only: false,
            copy_once: false,
            reply: None,
            renote: None,
            file_ids: Vec::new(),
            tags: Vec::new(),
            tags_lower: Vec::new(),
            emojis: Vec::new(),
            mentions: Vec::new(),
            mentioned_remote_users: Vec::new(),
            visible_user_ids: Vec::new(),
            poll: None,
            uri: None,
            url: None,
            via_mobile: false,
            geo: None,
            replies_count: 0,
            renote_count: 0,
            quote_count: 0,
            score: 0,
            expires_at_ms: None,
            created_at_ms: now_ms(),
            deleted_at_ms: None,
        }
    }

    #[test]
    fn duplicate_insert_is_idempotent_noop() {
        let db = temp_db();
        let n = bare_note("n1", "u1", Some("hello"));
        assert!(db.insert_note(&n).unwrap().is_some());
        assert!(db.insert_note(&n).unwrap().is_none());
        assert!(db.get_note("n1").unwrap().is_some());
    }

    #[test]
    fn counters_increment_atomically() {
        let db = temp_db();
        let n = bare_note("n1", "u1", Some("hello"));
        db.insert_note(&n).unwrap();
        db.inc_renote_count("n1", 1).unwrap();
        db.inc_renote_count("n1", 0).unwrap();
        db.inc_quote_count("n1").unwrap();
        let got = db.get_note("n1").unwrap().unwrap();
        assert_eq!(got.renote_count, 2);
        assert_eq!(got.score, 1);
        assert_eq!(got.quote_count, 1);
    }

    #[test]
    fn instance_failure_thresholds() {
        let db = temp_db();
        for _ in 0..FAILURES_TO_MARK_NOT_RESPONDING {
            db.instance_delivery_failed("down.example").unwrap();
        }
        let inst = db.get_instance("down.example").unwrap().unwrap();
        assert!(inst.not_responding);
        assert!(!inst.marked_as_closed);
        assert_eq!(inst.latest_failures, FAILURES_TO_MARK_NOT_RESPONDING);

        db.instance_delivery_succeeded("down.example").unwrap();
        let inst = db.get_instance("down.example").unwrap().unwrap();
        assert!(!inst.not_responding);
        assert_eq!(inst.latest_failures, 0);
        assert!(inst.latest_delivered_at_ms.is_some());
    }

    #[test]
    fn clear_inbox_on_gone() {
        let db = temp_db();
        let u = remote_user("r1", "bob", "remote.example", false);
        db.upsert_user(&u).unwrap();
        db.add_following(&u, "local1").unwrap();
        let cleared = db
            .clear_inbox_by_url("https://remote.example/users/bob/inbox")
            .unwrap();
        assert!(cleared >= 2);
        let inboxes = db.list_remote_follower_inboxes("local1").unwrap();
        assert_eq!(inboxes.len(), 1);
        assert!(inboxes[0].inbox.is_none());
    }

    #[test]
    fn soft_delete_then_expiry_is_noop() {
        let db = temp_db();
        let mut n = bare_note("n1", "u1", Some("bye"));
        n.expires_at_ms = Some(now_ms() - 1000);
        db.insert_note(&n).unwrap();
        assert_eq!(db.list_expired_note_ids(now_ms(), 10).unwrap(), vec!["n1"]);
        assert!(db.soft_delete_note("n1").unwrap());
        assert!(db.list_expired_note_ids(now_ms(), 10).unwrap().is_empty());
        assert!(!db.soft_delete_note("n1").unwrap());
    }
}
