/*
 * SPDX-FileCopyrightText: 2026 Tanzaku Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::Serialize;
use tokio::sync::broadcast;

/// Live-stream publisher: note/notification events pushed to connected
/// sessions. Lossy by design (slow consumers lag and skip).
#[derive(Clone, Debug, Serialize)]
pub struct StreamEvent {
    pub kind: String,
    pub ts_ms: i64,
    /// Set for events scoped to one user's main stream.
    pub user_id: Option<String>,
    pub note_id: Option<String>,
}

impl StreamEvent {
    pub fn new(kind: &str, user_id: Option<String>, note_id: Option<String>) -> Self {
        Self {
            kind: kind.to_string(),
            ts_ms: crate::id::now_ms(),
            user_id,
            note_id,
        }
    }
}

pub type StreamPublisher = broadcast::Sender<StreamEvent>;

pub fn new_publisher() -> StreamPublisher {
    broadcast::channel(1024).0
}

/// Fire-and-forget: nobody listening is fine.
pub fn publish(tx: &StreamPublisher, ev: StreamEvent) {
    let _ = tx.send(ev);
}

pub fn publish_notes_stream(tx: &StreamPublisher, note_id: &str) {
    publish(tx, StreamEvent::new("note", None, Some(note_id.to_string())));
}

pub fn publish_main_stream(tx: &StreamPublisher, user_id: &str, kind: &str, note_id: Option<String>) {
    publish(
        tx,
        StreamEvent::new(kind, Some(user_id.to_string()), note_id),
    );
}
