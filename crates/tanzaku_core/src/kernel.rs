/*
 * SPDX-FileCopyrightText: 2026 Tanzaku Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Inbound activity handling that needs object resolution. Only `Update`
//! carries real logic; everything else is acknowledged upstream.

use crate::resolver::Resolver;
use crate::social_db::{Poll, PollChoice, SocialDb, User, UserKind};
use anyhow::Result;
use serde_json::Value;
use tracing::debug;

const ACTOR_TYPES: &[&str] = &["Person", "Service", "Application"];

/// Handles an `Update` from a remote actor. The result string is a short
/// log-friendly verdict, mirroring how the rest of inbound handling
/// reports.
pub async fn handle_update(
    social: &SocialDb,
    resolver: &mut Resolver,
    actor: &User,
    activity: &Value,
) -> Result<String> {
    // An actor may only update its own objects.
    if let Some(claimed) = activity.get("actor").and_then(|v| v.as_str()) {
        if actor.uri() != Some(claimed) {
            return Ok("skip: invalid actor".to_string());
        }
    }
    debug!("Update from {}", actor.id);

    let Some(object) = activity.get("object").cloned() else {
        return Ok("skip: missing object".to_string());
    };
    let object = resolver.resolve(object).await?;
    let ty = object.get("type").and_then(|v| v.as_str()).unwrap_or("");

    if ACTOR_TYPES.contains(&ty) {
        update_person(social, actor, &object)?;
        Ok("ok: Person updated".to_string())
    } else if ty == "Question" {
        update_question(social, &object)?;
        Ok("ok: Question updated".to_string())
    } else {
        Ok(format!("skip: Unknown type: {ty}"))
    }
}

/// Refresh the stored remote person from its actor document.
fn update_person(social: &SocialDb, actor: &User, object: &Value) -> Result<()> {
    let mut updated = actor.clone();
    if let Some(name) = object.get("name").and_then(|v| v.as_str()) {
        updated.name = Some(name.to_string());
    }
    if let Some(summary) = object.get("summary").and_then(|v| v.as_str()) {
        updated.summary = Some(summary.to_string());
    }
    if let Some(pem) = object
        .get("publicKey")
        .and_then(|k| k.get("publicKeyPem"))
        .and_then(|v| v.as_str())
    {
        updated.public_key_pem = Some(pem.to_string());
    }
    if let UserKind::Remote {
        inbox,
        shared_inbox,
        ..
    } = &mut updated.kind
    {
        if let Some(v) = object.get("inbox").and_then(|v| v.as_str()) {
            *inbox = v.to_string();
        }
        *shared_inbox = object
            .get("endpoints")
            .and_then(|e| e.get("sharedInbox"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| shared_inbox.clone());
    }
    social.upsert_user(&updated)?;
    Ok(())
}

/// Re-validate a Question: refresh vote counters on the matching note's
/// poll from `oneOf`/`anyOf` reply totals.
fn update_question(social: &SocialDb, object: &Value) -> Result<()> {
    let Some(uri) = object.get("id").and_then(|v| v.as_str()) else {
        return Ok(());
    };
    let Some(note) = social.get_note_by_uri(uri)? else {
        return Ok(());
    };
    let Some(poll) = &note.poll else {
        return Ok(());
    };

    let choices_json = object
        .get("oneOf")
        .or_else(|| object.get("anyOf"))
        .and_then(|v| v.as_array());
    let Some(choices_json) = choices_json else {
        return Ok(());
    };

    let mut choices: Vec<PollChoice> = Vec::new();
    for c in &poll.choices {
        let votes = choices_json
            .iter()
            .find(|x| x.get("name").and_then(|n| n.as_str()) == Some(c.text.as_str()))
            .and_then(|x| x.get("replies"))
            .and_then(|r| r.get("totalItems"))
            .and_then(|t| t.as_i64())
            .unwrap_or(c.votes);
        choices.push(PollChoice {
            text: c.text.clone(),
            votes,
        });
    }

    social.update_note_poll(
        &note.id,
        &Poll {
            choices,
            multiple: poll.multiple,
            expires_at_ms: poll.expires_at_ms,
        },
    )?;
    Ok(())
}
