/*
 * SPDX-FileCopyrightText: 2026 Tanzaku Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};

/// Client-facing note creation request, as accepted by `POST /api/notes/create`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteCreateRequest {
    pub text: Option<String>,
    pub cw: Option<String>,
    /// `public` | `home` | `followers` | `specified` | legacy `private`.
    pub visibility: Option<String>,
    #[serde(default)]
    pub visible_user_ids: Vec<String>,
    #[serde(default)]
    pub file_ids: Vec<String>,
    pub reply_id: Option<String>,
    pub renote_id: Option<String>,
    pub poll: Option<PollRequest>,
    #[serde(default)]
    pub local_only: bool,
    #[serde(default)]
    pub copy_once: bool,
    #[serde(default)]
    pub via_mobile: bool,
    pub geo: Option<GeoPoint>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollRequest {
    /// 2..=20 unique choices, each 1..=128 chars.
    pub choices: Vec<String>,
    #[serde(default)]
    pub multiple: bool,
    /// Absolute expiry, unix ms.
    pub expires_at: Option<i64>,
    /// Relative expiry, ms from now. Ignored when `expires_at` is set.
    pub expired_after: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoPoint {
    /// `[longitude, latitude]`.
    pub coordinates: [f64; 2],
    pub altitude: Option<f64>,
    pub accuracy: Option<f64>,
}

/// Error body shape shared by every API endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorInner,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorInner {
    pub code: String,
    pub message: String,
}

impl ApiErrorBody {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ApiErrorInner {
                code: code.into(),
                message: message.into(),
            },
        }
    }
}
