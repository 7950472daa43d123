/*
 * SPDX-FileCopyrightText: 2026 Tanzaku Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::delivery_queue::DeliveryQueue;
use crate::social_db::{SocialDb, User};
use anyhow::Result;
use serde_json::Value;

/// Broadcast a public activity to every registered relay hub. The caller
/// gates this on visibility and copyOnce; here we only fan out.
pub async fn deliver_to_relays(
    social: &SocialDb,
    queue: &DeliveryQueue,
    user: &User,
    activity: &Value,
) -> Result<u64> {
    let inboxes = social.list_relay_inboxes()?;
    if inboxes.is_empty() {
        return Ok(0);
    }
    let n = inboxes.len() as u64;
    queue
        .enqueue_activity(serde_json::to_vec(activity)?, inboxes, user.id.clone())
        .await?;
    Ok(n)
}
