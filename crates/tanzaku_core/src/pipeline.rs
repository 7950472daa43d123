/*
 * SPDX-FileCopyrightText: 2026 Tanzaku Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Note creation. The synchronous phase validates, derives visibility,
//! extracts references and performs exactly one insert; everything after
//! that (counters, notifications, federation, indexing) is detached
//! background work whose failures are logged and never surface to the
//! caller.

use crate::chart::Charts;
use crate::config::Config;
use crate::deliver_manager::DeliverManager;
use crate::delivery_queue::DeliveryQueue;
use crate::error::ApiError;
use crate::id::{gen_id, now_ms};
use crate::mfm::{self, Token};
use crate::notification::{notify_extended, NotificationManager, NotificationReason};
use crate::relay::deliver_to_relays;
use crate::renderer::{attach_ld_signature, render_note_or_renote_activity, NoteRecipients};
use crate::social_db::{DriveFile, Note, NoteRef, Poll, RemoteMention, SocialDb, User};
use crate::stream::{publish_main_stream, publish_notes_stream, StreamPublisher};
use crate::visibility::{self, ParentSnapshot, Visibility, VisibilityRequest};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Hard limit on body/CW/poll size, in chars.
const HARD_CONTENT_LIMIT: usize = 16384;

/// Resolves a remote `{username, host}` mention to a concrete user.
/// Failures are per-mention and swallowed by the pipeline.
#[async_trait]
pub trait RemoteUserResolver: Send + Sync {
    async fn resolve_user(&self, username: &str, host: &str) -> Result<User>;
}

/// Fire-and-forget full-text indexing collaborator.
#[async_trait]
pub trait SearchIndexer: Send + Sync {
    async fn index_note(&self, note: &Note) -> Result<()>;
}

/// Default no-network resolver: every remote mention is dropped.
pub struct NullUserResolver;

#[async_trait]
impl RemoteUserResolver for NullUserResolver {
    async fn resolve_user(&self, username: &str, host: &str) -> Result<User> {
        anyhow::bail!("remote user resolution disabled: @{username}@{host}")
    }
}

pub struct NullIndexer;

#[async_trait]
impl SearchIndexer for NullIndexer {
    async fn index_note(&self, _note: &Note) -> Result<()> {
        Ok(())
    }
}

/// Service-level creation options, already past API-shape validation.
#[derive(Default, Clone)]
pub struct NoteCreateOptions {
    pub created_at_ms: Option<i64>,
    pub expires_at_ms: Option<i64>,
    pub text: Option<String>,
    pub cw: Option<String>,
    pub visibility: Option<Visibility>,
    pub visible_user_ids: Vec<String>,
    pub files: Vec<DriveFile>,
    pub reply_id: Option<String>,
    pub renote_id: Option<String>,
    pub poll: Option<Poll>,
    pub local_only: bool,
    pub copy_once: bool,
    pub via_mobile: bool,
    pub geo: Option<serde_json::Value>,
    /// Canonical uri/url for remote-originated notes.
    pub uri: Option<String>,
    pub url: Option<String>,
    /// Suppress reply/renote direct delivery and follower fanout.
    pub silent: bool,
    /// Pre-extracted references for inbound federation; `None` means
    /// extract from the body here.
    pub ap_mentions: Option<Vec<User>>,
    pub ap_hashtags: Option<Vec<String>>,
    pub ap_emojis: Option<Vec<String>>,
}

#[derive(Debug)]
pub struct CreateOutcome {
    /// `None` on an idempotent duplicate-id collision.
    pub note: Option<Note>,
    /// The detached side-effect task, observable for tests and shutdown.
    pub side_effects: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct RateState {
    window_start_ms: i64,
    count: u32,
}

#[derive(Clone)]
pub struct NotePipeline {
    pub cfg: Config,
    pub social: Arc<SocialDb>,
    pub queue: Arc<DeliveryQueue>,
    pub stream: StreamPublisher,
    pub charts: Charts,
    pub user_resolver: Arc<dyn RemoteUserResolver>,
    pub indexer: Arc<dyn SearchIndexer>,
    rate: Arc<Mutex<HashMap<String, RateState>>>,
}

impl NotePipeline {
    pub fn new(
        cfg: Config,
        social: Arc<SocialDb>,
        queue: Arc<DeliveryQueue>,
        stream: StreamPublisher,
        user_resolver: Arc<dyn RemoteUserResolver>,
        indexer: Arc<dyn SearchIndexer>,
    ) -> Self {
        let charts = Charts::new(social.clone());
        Self {
            cfg,
            social,
            queue,
            stream,
            charts,
            user_resolver,
            indexer,
            rate: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn create(
        &self,
        author: &User,
        opts: NoteCreateOptions,
    ) -> Result<CreateOutcome, ApiError> {
        if self.cfg.disable_posts {
            return Err(ApiError::PostingDisabled);
        }
        if author.is_local() {
            self.check_rate_limit(&author.id)?;
        }

        let created_at = opts.created_at_ms.unwrap_or_else(now_ms);
        let text = opts
            .text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);

        if let Some(t) = &text {
            if t.chars().count() > HARD_CONTENT_LIMIT {
                return Err(ApiError::LimitExceeded("text"));
            }
        }
        if let Some(c) = &opts.cw {
            if c.chars().count() > HARD_CONTENT_LIMIT {
                return Err(ApiError::LimitExceeded("cw"));
            }
        }
        if let Some(p) = &opts.poll {
            let encoded = serde_json::to_string(p).map_err(anyhow::Error::from)?;
            if encoded.len() > HARD_CONTENT_LIMIT {
                return Err(ApiError::LimitExceeded("poll"));
            }
        }

        let reply = match &opts.reply_id {
            Some(id) => Some(
                self.social
                    .get_note(id)?
                    .ok_or(ApiError::NoSuchReplyTarget)?,
            ),
            None => None,
        };
        let renote = match &opts.renote_id {
            Some(id) => Some(
                self.social
                    .get_note(id)?
                    .ok_or(ApiError::NoSuchRenoteTarget)?,
            ),
            None => None,
        };

        let has_content =
            text.is_some() || !opts.files.is_empty() || opts.poll.is_some();
        if !has_content && renote.is_none() {
            return Err(ApiError::ContentRequired);
        }

        let resolved = visibility::resolve(
            VisibilityRequest {
                visibility: opts.visibility,
                local_only: opts.local_only,
                copy_once: opts.copy_once,
                has_content,
            },
            reply.as_ref().map(snapshot),
            renote.as_ref().map(snapshot),
        )?;

        // Token streams for body, CW and poll choices are extracted over
        // one combined list.
        let mut tokens: Vec<Token> = Vec::new();
        if opts.ap_hashtags.is_none() || opts.ap_emojis.is_none() || opts.ap_mentions.is_none() {
            if let Some(t) = &text {
                tokens.extend(mfm::parse_basic(t));
            }
            if let Some(c) = &opts.cw {
                tokens.extend(mfm::parse_basic(c));
            }
            if let Some(p) = &opts.poll {
                for choice in &p.choices {
                    tokens.extend(mfm::parse_basic(&choice.text));
                }
            }
        }

        let mut tags = opts
            .ap_hashtags
            .clone()
            .unwrap_or_else(|| mfm::extract_hashtags(&tokens));
        tags.retain(|t| t.chars().count() <= mfm::MAX_TAG_LENGTH);
        tags.truncate(mfm::MAX_TAGS);
        let emojis = opts
            .ap_emojis
            .clone()
            .unwrap_or_else(|| mfm::extract_emojis(&tokens));

        let mut mentioned = match &opts.ap_mentions {
            Some(v) => v.clone(),
            None => self.resolve_mentioned_users(author, &tokens).await,
        };

        // The reply author always hears about the reply, even unmentioned.
        if let Some(reply) = &reply {
            if author.id != reply.user_id && !mentioned.iter().any(|u| u.id == reply.user_id) {
                if let Some(u) = self.social.get_user(&reply.user_id)? {
                    mentioned.push(u);
                }
            }
        }

        let mut visible_users: Vec<User> = Vec::new();
        if resolved.visibility == Visibility::Specified {
            for id in &opts.visible_user_ids {
                if let Some(u) = self.social.get_user(id)? {
                    if !visible_users.iter().any(|x| x.id == u.id) {
                        visible_users.push(u);
                    }
                }
            }
            // Union both ways: every mentioned user can see the note, every
            // explicit recipient sees themselves addressed.
            for u in &visible_users {
                if !mentioned.iter().any(|x| x.id == u.id) {
                    mentioned.push(u.clone());
                }
            }
            for u in &mentioned {
                if !visible_users.iter().any(|x| x.id == u.id) {
                    visible_users.push(u.clone());
                }
            }
        }

        // Short-lived notes via the exp tag; local authors only.
        let mut expires_at_ms = opts.expires_at_ms;
        if expires_at_ms.is_none() && author.is_local() {
            for tag in &tags {
                if let Some(delay) = mfm::parse_expire_tag(tag) {
                    expires_at_ms = Some(created_at + delay);
                    break;
                }
            }
        }

        let note = Note {
            id: gen_id(created_at),
            user_id: author.id.clone(),
            user_host: author.host.clone(),
            text,
            cw: opts.cw.clone(),
            visibility: resolved.visibility,
            local_only: resolved.local_only,
            copy_once: resolved.copy_once,
            reply: reply.as_ref().map(|r| NoteRef {
                note_id: r.id.clone(),
                user_id: r.user_id.clone(),
                user_host: r.user_host.clone(),
            }),
            renote: renote.as_ref().map(|r| NoteRef {
                note_id: r.id.clone(),
                user_id: r.user_id.clone(),
                user_host: r.user_host.clone(),
            }),
            file_ids: opts.files.iter().map(|f| f.id.clone()).collect(),
            tags_lower: tags.iter().map(|t| mfm::normalize_tag(t)).collect(),
            tags,
            emojis,
            mentions: mentioned.iter().map(|u| u.id.clone()).collect(),
            mentioned_remote_users: mentioned
                .iter()
                .filter(|u| u.is_remote())
                .map(|u| RemoteMention {
                    uri: u.uri().unwrap_or_default().to_string(),
                    url: None,
                    username: u.username.clone(),
                    host: u.host.clone().unwrap_or_default(),
                })
                .collect(),
            visible_user_ids: visible_users.iter().map(|u| u.id.clone()).collect(),
            poll: opts.poll.clone(),
            uri: opts.uri.clone(),
            url: opts.url.clone(),
            via_mobile: opts.via_mobile,
            geo: opts.geo.clone(),
            replies_count: 0,
            renote_count: 0,
            quote_count: 0,
            score: 0,
            expires_at_ms,
            created_at_ms: created_at,
            deleted_at_ms: None,
        };

        let inserted = self.social.insert_note(&note)?;
        let Some(note) = inserted else {
            // Uniqueness collision: someone else created it first.
            return Ok(CreateOutcome {
                note: None,
                side_effects: None,
            });
        };

        let this = self.clone();
        let author = author.clone();
        let silent = opts.silent;
        let files = opts.files.clone();
        let spawned_note = note.clone();
        let handle = tokio::spawn(async move {
            this.post_process(
                author,
                spawned_note,
                reply,
                renote,
                mentioned,
                visible_users,
                files,
                silent,
            )
            .await;
        });

        Ok(CreateOutcome {
            note: Some(note),
            side_effects: Some(handle),
        })
    }

    /// Everything downstream of the insert. Each step is contained: a
    /// failure is logged and the rest still runs.
    #[allow(clippy::too_many_arguments)]
    async fn post_process(
        &self,
        author: User,
        note: Note,
        reply: Option<Note>,
        renote: Option<Note>,
        mentioned: Vec<User>,
        visible_users: Vec<User>,
        files: Vec<DriveFile>,
        silent: bool,
    ) {
        self.charts.update_note(&note, &author);

        for file_id in &note.file_ids {
            if let Err(e) = self.social.attach_note_to_file(file_id, &note.id) {
                warn!("drive back-reference failed: {e:#}");
            }
        }

        // Unread markers.
        let unread_targets: Vec<(&User, bool)> = if note.visibility == Visibility::Specified {
            visible_users.iter().map(|u| (u, true)).collect()
        } else {
            mentioned.iter().map(|u| (u, false)).collect()
        };
        for (u, is_specified) in unread_targets {
            if !u.is_local() || u.id == author.id {
                continue;
            }
            if let Err(e) = self.social.insert_note_unread(&u.id, &note.id, is_specified) {
                warn!("unread marker failed: {e:#}");
            }
        }

        if let Some(reply) = &reply {
            if let Err(e) = self.social.inc_replies_count(&reply.id) {
                warn!("reply counter failed: {e:#}");
            }
        }
        if let Some(renote) = &renote {
            let score = if author.is_bot { 0 } else { 1 };
            if let Err(e) = self.social.inc_renote_count(&renote.id, score) {
                warn!("renote counter failed: {e:#}");
            }
            if note.is_quote() {
                if let Err(e) = self.social.inc_quote_count(&renote.id) {
                    warn!("quote counter failed: {e:#}");
                }
                if let Err(e) = self.social.append_quote_backref(&renote.id, &note.id) {
                    warn!("quote back-reference failed: {e:#}");
                }
            }
        }

        if note.created_at_ms > now_ms() - 10 * 60 * 1000 {
            publish_notes_stream(&self.stream, &note.id);
        }

        self.fan_out_notifications(&author, &note, &reply, &renote, &mentioned);

        if author.is_local() {
            if let Err(e) = self
                .deliver_federation(
                    &author,
                    &note,
                    &reply,
                    &renote,
                    &mentioned,
                    &visible_users,
                    &files,
                    silent,
                )
                .await
            {
                warn!("federation delivery failed: {e:#}");
            }
        }

        if note.visibility == Visibility::Public
            && author.searchable_by.as_deref().map_or(true, |s| s == "public")
        {
            if let Err(e) = self.indexer.index_note(&note).await {
                warn!("search indexing failed: {e:#}");
            }
        }

        if author.is_local() {
            self.schedule_poll_finished(&author, &note);
        }
    }

    fn fan_out_notifications(
        &self,
        author: &User,
        note: &Note,
        reply: &Option<Note>,
        renote: &Option<Note>,
        mentioned: &[User],
    ) {
        let mut nm = NotificationManager::new(author, note);

        if matches!(
            note.visibility,
            Visibility::Public | Visibility::Home | Visibility::Followers
        ) {
            if let Err(e) = notify_extended(&self.social, note, &mut nm) {
                warn!("highlight scan failed: {e:#}");
            }
        }

        if let Some(reply) = reply {
            if reply.user_host.is_none() {
                nm.push(&reply.user_id, NotificationReason::Reply);
                publish_main_stream(&self.stream, &reply.user_id, "reply", Some(note.id.clone()));
            }
        }

        for u in mentioned.iter().filter(|u| u.is_local()) {
            nm.push(&u.id, NotificationReason::Mention);
            publish_main_stream(&self.stream, &u.id, "mention", Some(note.id.clone()));
        }

        if let Some(renote) = renote {
            let reason = if note.text.is_some() {
                NotificationReason::Quote
            } else {
                NotificationReason::Renote
            };
            if renote.user_host.is_none() {
                nm.push(&renote.user_id, reason);
                if renote.user_id != author.id {
                    publish_main_stream(
                        &self.stream,
                        &renote.user_id,
                        "renote",
                        Some(note.id.clone()),
                    );
                }
            }
        }

        match nm.deliver(&self.social, &self.stream) {
            Ok(n) => debug!("delivered {n} notifications for note {}", note.id),
            Err(e) => warn!("notification delivery failed: {e:#}"),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn deliver_federation(
        &self,
        author: &User,
        note: &Note,
        reply: &Option<Note>,
        renote: &Option<Note>,
        mentioned: &[User],
        visible_users: &[User],
        files: &[DriveFile],
        silent: bool,
    ) -> Result<()> {
        // A silenced author's public note federates as home; the stored
        // note keeps its visibility.
        let render_src = if author.is_silenced && note.visibility == Visibility::Public {
            let mut clamped = note.clone();
            clamped.visibility = Visibility::Home;
            clamped
        } else {
            note.clone()
        };

        let rcpt = NoteRecipients {
            mentioned_uris: mentioned
                .iter()
                .filter_map(|u| u.uri().map(str::to_string))
                .collect(),
            visible_uris: visible_users
                .iter()
                .map(|u| match u.uri() {
                    Some(uri) => uri.to_string(),
                    None => self.cfg.user_url(&u.id),
                })
                .collect(),
        };

        let Some(mut activity) = render_note_or_renote_activity(
            &self.cfg,
            &render_src,
            author,
            reply.as_ref(),
            renote.as_ref(),
            &rcpt,
            files,
        ) else {
            return Ok(());
        };

        if author.signing_key_pem().is_none() {
            debug!("author {} has no signing key, skipping federation", author.id);
            return Ok(());
        }
        // Fatal only to this delivery, never to the created note.
        attach_ld_signature(&self.cfg, &mut activity, author)?;

        let mut dm = DeliverManager::new(&self.social, author, activity.clone());

        for u in mentioned.iter().filter(|u| u.is_remote()) {
            dm.add_direct_recipe(u);
        }

        if !silent {
            if let Some(reply) = reply {
                if reply.user_host.is_some() {
                    if let Some(u) = self.social.get_user(&reply.user_id)? {
                        dm.add_direct_recipe(&u);
                    }
                }
            }
            if let Some(renote) = renote {
                if renote.user_host.is_some() {
                    if let Some(u) = self.social.get_user(&renote.user_id)? {
                        dm.add_direct_recipe(&u);
                    }
                }
            }

            if matches!(
                note.visibility,
                Visibility::Public | Visibility::Home | Visibility::Followers
            ) {
                dm.add_followers_recipe();
            }

            if note.visibility == Visibility::Public && !note.copy_once {
                deliver_to_relays(&self.social, &self.queue, author, &activity).await?;
            }

            // copyOnce: one narrow remote broadcast instead of the durable
            // follower fanout semantics.
            if note.visibility == Visibility::Specified && note.copy_once {
                dm.add_followers_recipe();
            }
        }

        let jobs = dm.execute(&self.queue).await?;
        debug!("enqueued {jobs} delivery jobs for note {}", note.id);
        Ok(())
    }

    async fn resolve_mentioned_users(&self, author: &User, tokens: &[Token]) -> Vec<User> {
        let mut out: Vec<User> = Vec::new();
        for (username, host) in mfm::extract_mentions(tokens) {
            let host = host.or_else(|| author.host.clone());
            let resolved = match host.as_deref() {
                None => self.social.get_user_by_acct(&username, None).ok().flatten(),
                Some(h) if h.eq_ignore_ascii_case(&self.cfg.local_host) => {
                    self.social.get_user_by_acct(&username, None).ok().flatten()
                }
                Some(h) => match self.user_resolver.resolve_user(&username, h).await {
                    Ok(u) => Some(u),
                    Err(e) => {
                        debug!("mention resolution failed for @{username}@{h}: {e:#}");
                        None
                    }
                },
            };
            if let Some(u) = resolved {
                if !out.iter().any(|x| x.id == u.id) {
                    out.push(u);
                }
            }
        }
        out
    }

    fn check_rate_limit(&self, user_id: &str) -> Result<(), ApiError> {
        let mut map = self.rate.lock().expect("rate limiter lock");
        let now = now_ms();
        let st = map.entry(user_id.to_string()).or_default();
        if now.saturating_sub(st.window_start_ms) > 3_600_000 {
            st.window_start_ms = now;
            st.count = 0;
        }
        st.count += 1;
        if st.count > self.cfg.create_limit_per_hour {
            return Err(ApiError::RateLimitExceeded);
        }
        Ok(())
    }

    fn schedule_poll_finished(&self, author: &User, note: &Note) {
        let Some(expires_at) = note.poll.as_ref().and_then(|p| p.expires_at_ms) else {
            return;
        };
        let social = self.social.clone();
        let stream = self.stream.clone();
        let author_id = author.id.clone();
        let note_id = note.id.clone();
        tokio::spawn(async move {
            let wait = expires_at.saturating_sub(now_ms()).max(0) as u64;
            tokio::time::sleep(Duration::from_millis(wait)).await;
            // A deleted note means the poll check is moot.
            match social.get_note(&note_id) {
                Ok(Some(n)) if !n.is_deleted() => {
                    publish_main_stream(&stream, &author_id, "pollFinished", Some(note_id));
                }
                _ => {}
            }
        });
    }
}

fn snapshot(n: &Note) -> ParentSnapshot {
    ParentSnapshot {
        visibility: n.visibility,
        local_only: n.local_only,
        deleted: n.is_deleted(),
        pure_renote: n.is_pure_renote(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::social_db::tests::{local_user, remote_user, temp_db};
    use crate::social_db::UserKind;
    use crate::stream::new_publisher;
    use rand::RngCore;

    struct StaticResolver(User);

    #[async_trait]
    impl RemoteUserResolver for StaticResolver {
        async fn resolve_user(&self, username: &str, host: &str) -> Result<User> {
            if self.0.username == username && self.0.host.as_deref() == Some(host) {
                Ok(self.0.clone())
            } else {
                anyhow::bail!("unknown user @{username}@{host}")
            }
        }
    }

    fn test_cfg() -> Config {
        Config {
            public_base_url: "https://tanzaku.example".into(),
            local_host: "tanzaku.example".into(),
            data_dir: std::env::temp_dir(),
            disable_posts: false,
            max_note_text_length: 1000,
            max_date_skew: Duration::from_secs(300),
            blocked_hosts: Vec::new(),
            create_limit_per_hour: 300,
        }
    }

    fn temp_queue() -> DeliveryQueue {
        let mut b = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut b);
        let path = std::env::temp_dir().join(format!("tanzaku-pq-{}.db", hex::encode(b)));
        DeliveryQueue::open(path).unwrap()
    }

    fn pipeline_with(resolver: Arc<dyn RemoteUserResolver>) -> NotePipeline {
        NotePipeline::new(
            test_cfg(),
            Arc::new(temp_db()),
            Arc::new(temp_queue()),
            new_publisher(),
            resolver,
            Arc::new(NullIndexer),
        )
    }

    fn signing_user(id: &str, username: &str) -> User {
        use rsa::pkcs8::{EncodePrivateKey, LineEnding};
        let key = rsa::RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048).unwrap();
        let pem = key.to_pkcs8_pem(LineEnding::LF).unwrap().to_string();
        let mut u = local_user(id, username);
        u.kind = UserKind::Local {
            private_key_pem: Some(pem),
        };
        u
    }

    async fn create_and_settle(
        p: &NotePipeline,
        author: &User,
        opts: NoteCreateOptions,
    ) -> Result<Option<Note>, ApiError> {
        let out = p.create(author, opts).await?;
        if let Some(h) = out.side_effects {
            h.await.expect("side effects");
        }
        Ok(out.note)
    }

    #[tokio::test]
    async fn public_note_without_remote_recipients() {
        let p = pipeline_with(Arc::new(NullUserResolver));
        let alice = local_user("u1", "alice");
        p.social.upsert_user(&alice).unwrap();

        let note = create_and_settle(
            &p,
            &alice,
            NoteCreateOptions {
                text: Some("hello #world".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(note.visibility, Visibility::Public);
        assert_eq!(note.tags, vec!["world".to_string()]);
        assert!(note.mentions.is_empty());

        let stats = p.queue.stats().await.unwrap();
        assert_eq!(stats.pending + stats.delivered + stats.failed, 0);
        assert!(p.social.list_notifications_for("u1").unwrap().is_empty());

        // Counters moved.
        let (total, original) = p.social.meta_notes_count().unwrap();
        assert_eq!((total, original), (1, 1));
        let author = p.social.get_user("u1").unwrap().unwrap();
        assert_eq!(author.notes_count, 1);
    }

    #[tokio::test]
    async fn reply_to_local_only_note_inherits_local_only() {
        let p = pipeline_with(Arc::new(NullUserResolver));
        let bob = local_user("u2", "bob");
        let alice = signing_user("u1", "alice");
        p.social.upsert_user(&bob).unwrap();
        p.social.upsert_user(&alice).unwrap();
        // A remote follower would receive the note if it federated.
        let follower = remote_user("r1", "eve", "remote.example", true);
        p.social.upsert_user(&follower).unwrap();
        p.social.add_following(&follower, "u1").unwrap();

        let parent = create_and_settle(
            &p,
            &bob,
            NoteCreateOptions {
                text: Some("local thoughts".into()),
                local_only: true,
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .unwrap();
        assert!(parent.local_only);

        let reply = create_and_settle(
            &p,
            &alice,
            NoteCreateOptions {
                text: Some("agreed".into()),
                visibility: Some(Visibility::Public),
                reply_id: Some(parent.id.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .unwrap();

        // Visibility is not narrowed by this rule, but locality is sticky.
        assert_eq!(reply.visibility, Visibility::Public);
        assert!(reply.local_only);

        let stats = p.queue.stats().await.unwrap();
        assert_eq!(stats.pending + stats.delivered + stats.failed, 0);

        // The reply author notified bob.
        let rows = p.social.list_notifications_for("u2").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].reason, "reply");
    }

    #[tokio::test]
    async fn remote_mention_enqueues_direct_delivery() {
        let bob = remote_user("r1", "bob", "remote.example", false);
        let p = pipeline_with(Arc::new(StaticResolver(bob.clone())));
        let alice = signing_user("u1", "alice");
        p.social.upsert_user(&alice).unwrap();

        let note = create_and_settle(
            &p,
            &alice,
            NoteCreateOptions {
                text: Some("hi @bob@remote.example".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(note.mentions, vec!["r1".to_string()]);
        assert_eq!(note.mentioned_remote_users.len(), 1);
        assert_eq!(note.mentioned_remote_users[0].host, "remote.example");

        let rows = p.queue.job_rows().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].3, "https://remote.example/users/bob/inbox");
    }

    #[tokio::test]
    async fn failed_mention_resolution_drops_mention_not_note() {
        let p = pipeline_with(Arc::new(NullUserResolver));
        let alice = local_user("u1", "alice");
        p.social.upsert_user(&alice).unwrap();

        let note = create_and_settle(
            &p,
            &alice,
            NoteCreateOptions {
                text: Some("hi @ghost@nowhere.example".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .unwrap();
        assert!(note.mentions.is_empty());
    }

    #[tokio::test]
    async fn pure_renote_chain_rejected() {
        let p = pipeline_with(Arc::new(NullUserResolver));
        let alice = local_user("u1", "alice");
        p.social.upsert_user(&alice).unwrap();

        let original = create_and_settle(
            &p,
            &alice,
            NoteCreateOptions {
                text: Some("original".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .unwrap();

        let pure = create_and_settle(
            &p,
            &alice,
            NoteCreateOptions {
                renote_id: Some(original.id.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .unwrap();
        assert!(pure.is_pure_renote());
        // Pure renotes clamp to home.
        assert_eq!(pure.visibility, Visibility::Home);

        let err = p
            .create(
                &alice,
                NoteCreateOptions {
                    renote_id: Some(pure.id.clone()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CANNOT_RENOTE_TO_A_PURE_RENOTE");

        let err = p
            .create(
                &alice,
                NoteCreateOptions {
                    text: Some("nice".into()),
                    reply_id: Some(pure.id.clone()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CANNOT_REPLY_TO_A_PURE_RENOTE");

        // The renoted note's counter moved exactly once.
        let original = p.social.get_note(&original.id).unwrap().unwrap();
        assert_eq!(original.renote_count, 1);
    }

    #[tokio::test]
    async fn expire_tag_bounds_lifetime() {
        let p = pipeline_with(Arc::new(NullUserResolver));
        let alice = local_user("u1", "alice");
        p.social.upsert_user(&alice).unwrap();

        let note = create_and_settle(
            &p,
            &alice,
            NoteCreateOptions {
                text: Some("gone soon #exp10m".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(note.expires_at_ms, Some(note.created_at_ms + 600_000));

        // Remote authors cannot set expiry through the tag.
        let remote = remote_user("r1", "bob", "remote.example", false);
        p.social.upsert_user(&remote).unwrap();
        let note = create_and_settle(
            &p,
            &remote,
            NoteCreateOptions {
                text: Some("gone soon #exp10m".into()),
                uri: Some("https://remote.example/notes/1".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .unwrap();
        assert!(note.expires_at_ms.is_none());
    }

    #[tokio::test]
    async fn specified_visibility_unions_recipients() {
        let p = pipeline_with(Arc::new(NullUserResolver));
        let alice = local_user("u1", "alice");
        let carol = local_user("u2", "carol");
        let dave = local_user("u3", "dave");
        for u in [&alice, &carol, &dave] {
            p.social.upsert_user(u).unwrap();
        }

        let note = create_and_settle(
            &p,
            &alice,
            NoteCreateOptions {
                text: Some("psst @dave".into()),
                visibility: Some(Visibility::Specified),
                visible_user_ids: vec!["u2".into()],
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .unwrap();

        let mut visible = note.visible_user_ids.clone();
        visible.sort();
        assert_eq!(visible, vec!["u2".to_string(), "u3".to_string()]);
        let mut mentions = note.mentions.clone();
        mentions.sort();
        assert_eq!(mentions, vec!["u2".to_string(), "u3".to_string()]);
    }

    #[tokio::test]
    async fn rate_limit_applies_to_local_authors() {
        let mut p = pipeline_with(Arc::new(NullUserResolver));
        p.cfg.create_limit_per_hour = 2;
        let alice = local_user("u1", "alice");
        p.social.upsert_user(&alice).unwrap();

        for i in 0..2 {
            create_and_settle(
                &p,
                &alice,
                NoteCreateOptions {
                    text: Some(format!("note {i}")),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        }
        let err = p
            .create(
                &alice,
                NoteCreateOptions {
                    text: Some("one too many".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "RATE_LIMIT_EXCEEDED");
    }

    #[tokio::test]
    async fn public_note_broadcasts_to_relays() {
        let p = pipeline_with(Arc::new(NullUserResolver));
        let alice = signing_user("u1", "alice");
        p.social.upsert_user(&alice).unwrap();
        p.social.add_relay("https://relay.example/inbox").unwrap();

        create_and_settle(
            &p,
            &alice,
            NoteCreateOptions {
                text: Some("to the world".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let rows = p.queue.job_rows().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].3, "https://relay.example/inbox");

        // copyOnce keeps the note off the relays.
        create_and_settle(
            &p,
            &alice,
            NoteCreateOptions {
                text: Some("once only".into()),
                copy_once: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(p.queue.job_rows().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn attached_files_get_back_references() {
        let p = pipeline_with(Arc::new(NullUserResolver));
        let alice = local_user("u1", "alice");
        p.social.upsert_user(&alice).unwrap();
        let file = crate::social_db::DriveFile {
            id: "f1".into(),
            user_id: "u1".into(),
            name: "cat.png".into(),
            url: "https://tanzaku.example/files/f1".into(),
            content_type: "image/png".into(),
            is_sensitive: false,
        };
        p.social.insert_drive_file(&file).unwrap();

        let note = create_and_settle(
            &p,
            &alice,
            NoteCreateOptions {
                files: p.social.get_drive_files(&["f1".into()], "u1").unwrap(),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(note.file_ids, vec!["f1".to_string()]);
    }

    #[tokio::test]
    async fn content_required() {
        let p = pipeline_with(Arc::new(NullUserResolver));
        let alice = local_user("u1", "alice");
        let err = p
            .create(&alice, NoteCreateOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONTENT_REQUIRED");
    }
}

/// Soft-deletes notes whose expiry has passed. Author deletion first makes
/// the expiry a no-op, which is the cancellation contract for scheduled
/// expiries.
pub fn start_expiry_worker(
    social: Arc<SocialDb>,
    stream: StreamPublisher,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let tick = Duration::from_secs(5);
        loop {
            if *shutdown.borrow() {
                break;
            }
            match social.list_expired_note_ids(now_ms(), 100) {
                Ok(ids) => {
                    for id in ids {
                        match social.soft_delete_note(&id) {
                            Ok(true) => {
                                publish_notes_stream(&stream, &id);
                            }
                            Ok(false) => {}
                            Err(e) => warn!("expiry delete failed for {id}: {e:#}"),
                        }
                    }
                }
                Err(e) => warn!("expiry scan failed: {e:#}"),
            }
            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                _ = shutdown.changed() => {}
            }
        }
    });
}
