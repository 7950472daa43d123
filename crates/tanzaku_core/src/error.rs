/*
 * SPDX-FileCopyrightText: 2026 Tanzaku Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use thiserror::Error;

/// Synchronous errors returned to the note-creation caller. Every variant
/// carries a stable machine-readable code; the HTTP layer maps these to
/// status codes without inspecting messages.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("No such renote target.")]
    NoSuchRenoteTarget,

    #[error("You can not Renote a pure Renote.")]
    CannotRenotePureRenote,

    #[error("No such reply target.")]
    NoSuchReplyTarget,

    #[error("You can not reply to a pure Renote.")]
    CannotReplyToPureRenote,

    #[error("Reply target has been deleted.")]
    ReplyTargetDeleted,

    #[error("Renote target has been deleted.")]
    RenoteTargetDeleted,

    #[error("Renote target is not public or home.")]
    RenoteTargetNotPublic,

    #[error("Content required. You need to set text, fileIds, renoteId or poll.")]
    ContentRequired,

    #[error("Poll is already expired.")]
    AlreadyExpiredPoll,

    #[error("copyOnce can not be combined with specified visibility.")]
    CopyOnceSpecified,

    #[error("{0} limit exceeded.")]
    LimitExceeded(&'static str),

    #[error("Invalid value for param `{0}`.")]
    InvalidParam(&'static str),

    #[error("Posting is disabled on this server.")]
    PostingDisabled,

    #[error("Rate limit exceeded.")]
    RateLimitExceeded,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoSuchRenoteTarget => "NO_SUCH_RENOTE_TARGET",
            Self::CannotRenotePureRenote => "CANNOT_RENOTE_TO_A_PURE_RENOTE",
            Self::NoSuchReplyTarget => "NO_SUCH_REPLY_TARGET",
            Self::CannotReplyToPureRenote => "CANNOT_REPLY_TO_A_PURE_RENOTE",
            Self::ReplyTargetDeleted => "NO_SUCH_REPLY_TARGET",
            Self::RenoteTargetDeleted => "NO_SUCH_RENOTE_TARGET",
            Self::RenoteTargetNotPublic => "CANNOT_RENOTE_NON_PUBLIC",
            Self::ContentRequired => "CONTENT_REQUIRED",
            Self::AlreadyExpiredPoll => "CANNOT_CREATE_ALREADY_EXPIRED_POLL",
            Self::CopyOnceSpecified => "DENY_REMOTE_FOLLOWER_ONLY",
            Self::LimitExceeded(_) => "LIMIT_EXCEEDED",
            Self::InvalidParam(_) => "INVALID_PARAM",
            Self::PostingDisabled => "POSTING_DISABLED",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status the API layer answers with.
    pub fn status(&self) -> u16 {
        match self {
            Self::NoSuchRenoteTarget | Self::NoSuchReplyTarget => 404,
            Self::RateLimitExceeded => 429,
            Self::PostingDisabled => 451,
            Self::Internal(_) => 500,
            _ => 400,
        }
    }
}

/// Remote object resolution failures (spec taxonomy: ResolutionError).
/// Request-scoped: returned to whatever inbound handler triggered the
/// resolution, never to the note-creation caller.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("instance is blocked: {0}")]
    HostBlocked(String),

    #[error("invalid object uri: {0}")]
    InvalidUri(String),

    #[error("fetch failed for {uri}: {source}")]
    Fetch {
        uri: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("unexpected object type `{found}` for {uri}")]
    TypeMismatch { uri: String, found: String },

    #[error("resolution recursion limit exceeded")]
    RecursionLimit,
}
