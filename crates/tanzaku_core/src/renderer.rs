/*
 * SPDX-FileCopyrightText: 2026 Tanzaku Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Outbound wire-format rendering: note objects, Create/Announce envelopes,
//! actor documents, and the fixed namespace context.

use crate::config::Config;
use crate::ld_signature::sign_rsa_signature_2017;
use crate::social_db::{DriveFile, Note, User};
use crate::visibility::Visibility;
use anyhow::{anyhow, Result};
use rand::{rngs::OsRng, RngCore};
use serde_json::{json, Value};

pub const AS_PUBLIC: &str = "https://www.w3.org/ns/activitystreams#Public";

/// The versioned context block every outgoing object is wrapped with:
/// standard vocabulary, security vocabulary, and the documented extension
/// terms, so extension-aware peers see the extras and plain consumers
/// still parse the core shape.
pub fn ap_context() -> Value {
    json!([
        "https://www.w3.org/ns/activitystreams",
        "https://w3id.org/security/v1",
        {
            "manuallyApprovesFollowers": "as:manuallyApprovesFollowers",
            "sensitive": "as:sensitive",
            "Hashtag": "as:Hashtag",
            "toot": "http://joinmastodon.org/ns#",
            "Emoji": "toot:Emoji",
            "featured": "toot:featured",
            "discoverable": "toot:discoverable",
            "schema": "http://schema.org#",
            "PropertyValue": "schema:PropertyValue",
            "value": "schema:value",
            "misskey": "https://misskey-hub.net/ns#",
            "_misskey_content": "misskey:_misskey_content",
            "_misskey_quote": "misskey:_misskey_quote",
            "_misskey_reaction": "misskey:_misskey_reaction",
            "_misskey_votes": "misskey:_misskey_votes",
            "isCat": "misskey:isCat",
            "vcard": "http://www.w3.org/2006/vcard/ns#",
            "fedibird": "http://fedibird.com/ns#",
            "quoteUri": "fedibird:quoteUri",
            "searchableBy": { "@id": "fedibird:searchableBy", "@type": "@id" },
        }
    ])
}

/// Wraps a rendered object with the context, assigning a fresh local id when
/// the object carries none.
pub fn render_activity(cfg: &Config, x: Option<Value>) -> Option<Value> {
    let mut x = x?;
    if let Some(map) = x.as_object_mut() {
        if !map.contains_key("id") {
            map.insert(
                "id".into(),
                Value::String(format!("{}/{}", cfg.public_base_url, random_id())),
            );
        }
        let mut out = serde_json::Map::new();
        out.insert("@context".into(), ap_context());
        for (k, v) in map.iter() {
            out.insert(k.clone(), v.clone());
        }
        return Some(Value::Object(out));
    }
    Some(x)
}

/// Signs the activity with the author's key. Only local users carry one.
pub fn attach_ld_signature(cfg: &Config, activity: &mut Value, author: &User) -> Result<()> {
    let pem = author
        .signing_key_pem()
        .ok_or_else(|| anyhow!("user {} has no signing key", author.id))?;
    let key_id = format!("{}#main-key", cfg.user_url(&author.id));
    sign_rsa_signature_2017(activity, pem, &key_id)
}

/// Recipient URIs the renderer needs beyond what the note row carries.
#[derive(Debug, Clone, Default)]
pub struct NoteRecipients {
    /// URIs of every mentioned user (remote uri, or local user URL).
    pub mentioned_uris: Vec<String>,
    /// URIs of the explicit visible-user set (specified visibility only).
    pub visible_uris: Vec<String>,
}

fn addressing(cfg: &Config, note: &Note, rcpt: &NoteRecipients) -> (Vec<String>, Vec<String>) {
    let followers = format!("{}/followers", cfg.user_url(&note.user_id));
    match note.visibility {
        Visibility::Public => {
            let mut cc = vec![followers];
            cc.extend(rcpt.mentioned_uris.iter().cloned());
            (vec![AS_PUBLIC.to_string()], cc)
        }
        Visibility::Home => {
            let mut cc = vec![AS_PUBLIC.to_string()];
            cc.extend(rcpt.mentioned_uris.iter().cloned());
            (vec![followers], cc)
        }
        Visibility::Followers => (vec![followers], rcpt.mentioned_uris.clone()),
        Visibility::Specified => (rcpt.visible_uris.clone(), Vec::new()),
    }
}

pub fn render_note(
    cfg: &Config,
    note: &Note,
    rcpt: &NoteRecipients,
    files: &[DriveFile],
    in_reply_to: Option<&str>,
    quote_uri: Option<&str>,
) -> Value {
    let (to, cc) = addressing(cfg, note, rcpt);
    let attributed_to = cfg.user_url(&note.user_id);

    let mut tag: Vec<Value> = Vec::new();
    for t in &note.tags {
        tag.push(json!({
            "type": "Hashtag",
            "href": format!("{}/tags/{}", cfg.public_base_url, t),
            "name": format!("#{t}"),
        }));
    }
    for name in &note.emojis {
        tag.push(json!({
            "type": "Emoji",
            "name": format!(":{name}:"),
        }));
    }
    for m in &note.mentioned_remote_users {
        tag.push(json!({
            "type": "Mention",
            "href": m.uri,
            "name": format!("@{}@{}", m.username, m.host),
        }));
    }

    let attachment: Vec<Value> = files
        .iter()
        .map(|f| {
            json!({
                "type": "Document",
                "mediaType": f.content_type,
                "url": f.url,
                "name": f.name,
                "sensitive": f.is_sensitive,
            })
        })
        .collect();

    let mut obj = json!({
        "id": cfg.note_url(&note.id),
        "type": "Note",
        "attributedTo": attributed_to,
        "summary": note.cw,
        "content": note.text,
        "_misskey_content": note.text,
        "published": ms_to_rfc3339(note.created_at_ms),
        "to": to,
        "cc": cc,
        "sensitive": note.cw.is_some() || files.iter().any(|f| f.is_sensitive),
        "attachment": attachment,
        "tag": tag,
    });
    let map = obj.as_object_mut().expect("note object");

    if let Some(target) = in_reply_to {
        map.insert("inReplyTo".into(), Value::String(target.to_string()));
    }

    if let Some(q) = quote_uri {
        map.insert("_misskey_quote".into(), Value::String(q.to_string()));
        map.insert("quoteUri".into(), Value::String(q.to_string()));
    }

    if let Some(poll) = &note.poll {
        let choices: Vec<Value> = poll
            .choices
            .iter()
            .map(|c| {
                json!({
                    "type": "Note",
                    "name": c.text,
                    "replies": { "type": "Collection", "totalItems": c.votes },
                })
            })
            .collect();
        map.insert("type".into(), Value::String("Question".into()));
        map.insert(
            if poll.multiple { "anyOf" } else { "oneOf" }.into(),
            Value::Array(choices),
        );
        map.insert(
            "_misskey_votes".into(),
            Value::Array(
                poll.choices
                    .iter()
                    .map(|c| Value::Number(c.votes.into()))
                    .collect(),
            ),
        );
        if let Some(end) = poll.expires_at_ms.and_then(ms_to_rfc3339) {
            map.insert("endTime".into(), Value::String(end));
        }
    }

    obj
}

pub fn render_create(cfg: &Config, note: &Note, object: Value) -> Value {
    let to = object.get("to").cloned().unwrap_or(Value::Array(vec![]));
    let cc = object.get("cc").cloned().unwrap_or(Value::Array(vec![]));
    json!({
        "id": format!("{}/activity", cfg.note_url(&note.id)),
        "actor": cfg.user_url(&note.user_id),
        "type": "Create",
        "published": ms_to_rfc3339(note.created_at_ms),
        "to": to,
        "cc": cc,
        "object": object,
    })
}

pub fn render_announce(cfg: &Config, note: &Note, target_uri: &str, rcpt: &NoteRecipients) -> Value {
    let (to, cc) = addressing(cfg, note, rcpt);
    json!({
        "id": format!("{}/activity", cfg.note_url(&note.id)),
        "actor": cfg.user_url(&note.user_id),
        "type": "Announce",
        "published": ms_to_rfc3339(note.created_at_ms),
        "to": to,
        "cc": cc,
        "object": target_uri,
    })
}

/// Renders the outbound activity for a persisted note, or `None` when the
/// note must not federate. A pure renote becomes an Announce of the target's
/// canonical uri; anything else a Create wrapping the full object.
pub fn render_note_or_renote_activity(
    cfg: &Config,
    note: &Note,
    author: &User,
    reply_target: Option<&Note>,
    renote_target: Option<&Note>,
    rcpt: &NoteRecipients,
    files: &[DriveFile],
) -> Option<Value> {
    if note.local_only || author.no_federation {
        return None;
    }

    let content = if note.is_pure_renote() {
        let target = renote_target?;
        let target_uri = target
            .uri
            .clone()
            .unwrap_or_else(|| cfg.note_url(&target.id));
        render_announce(cfg, note, &target_uri, rcpt)
    } else {
        let in_reply_to = reply_target
            .map(|t| t.uri.clone().unwrap_or_else(|| cfg.note_url(&t.id)));
        let quote_uri = renote_target.map(|t| {
            t.uri.clone().unwrap_or_else(|| cfg.note_url(&t.id))
        });
        let object = render_note(cfg, note, rcpt, files, in_reply_to.as_deref(), quote_uri.as_deref());
        render_create(cfg, note, object)
    };

    render_activity(cfg, Some(content))
}

/// Actor document. Dot-named accounts are system `Application`s, bots are
/// `Service`, everyone else `Person`.
pub fn render_person(cfg: &Config, user: &User) -> Value {
    let id = cfg.user_url(&user.id);
    let actor_type = if user.username.contains('.') {
        "Application"
    } else if user.is_bot {
        "Service"
    } else {
        "Person"
    };

    let mut attachment: Vec<Value> = Vec::new();
    for (name, value) in &user.profile_fields {
        attachment.push(json!({
            "type": "PropertyValue",
            "name": name,
            "value": value,
        }));
    }

    let searchable_by: Vec<String> = match user.searchable_by.as_deref() {
        Some("none") => Vec::new(),
        _ => vec![AS_PUBLIC.to_string()],
    };

    let mut person = json!({
        "type": actor_type,
        "id": id,
        "inbox": format!("{id}/inbox"),
        "outbox": format!("{id}/outbox"),
        "followers": format!("{id}/followers"),
        "following": format!("{id}/following"),
        "featured": format!("{id}/collections/featured"),
        "sharedInbox": format!("{}/inbox", cfg.public_base_url),
        "endpoints": { "sharedInbox": format!("{}/inbox", cfg.public_base_url) },
        "url": format!("{}/@{}", cfg.public_base_url, user.username),
        "preferredUsername": user.username,
        "name": user.name,
        "summary": user.summary,
        "tag": [],
        "manuallyApprovesFollowers": user.is_locked,
        "discoverable": user.is_explorable,
        "searchableBy": searchable_by,
        "isCat": user.is_cat,
        "publicKey": {
            "id": format!("{id}#main-key"),
            "owner": id,
            "publicKeyPem": user.public_key_pem,
        },
    });
    if !attachment.is_empty() {
        person
            .as_object_mut()
            .expect("person object")
            .insert("attachment".into(), Value::Array(attachment));
    }
    person
}

pub fn ms_to_rfc3339(ms: i64) -> Option<String> {
    let t = time::OffsetDateTime::from_unix_timestamp_nanos((ms as i128) * 1_000_000).ok()?;
    t.format(&time::format_description::well_known::Rfc3339).ok()
}

fn random_id() -> String {
    let mut b = [0u8; 16];
    OsRng.fill_bytes(&mut b);
    hex::encode(b)
}
