/*
 * SPDX-FileCopyrightText: 2026 Tanzaku Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Final visibility/locality derivation for a new note. Pure: all parent
//! context comes in as point-in-time snapshots, nothing is fetched here.

use crate::error::ApiError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Home,
    Followers,
    Specified,
}

impl Visibility {
    /// Accepts the legacy `private` alias for `specified`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "public" => Some(Self::Public),
            "home" => Some(Self::Home),
            "followers" => Some(Self::Followers),
            "specified" | "private" => Some(Self::Specified),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Home => "home",
            Self::Followers => "followers",
            Self::Specified => "specified",
        }
    }
}

/// What the resolver needs to know about a reply/renote target.
#[derive(Debug, Clone, Copy)]
pub struct ParentSnapshot {
    pub visibility: Visibility,
    pub local_only: bool,
    pub deleted: bool,
    pub pure_renote: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct VisibilityRequest {
    pub visibility: Option<Visibility>,
    pub local_only: bool,
    pub copy_once: bool,
    /// Does the new note carry text, files, or a poll of its own?
    pub has_content: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedVisibility {
    pub visibility: Visibility,
    pub local_only: bool,
    pub copy_once: bool,
}

pub fn resolve(
    req: VisibilityRequest,
    reply: Option<ParentSnapshot>,
    renote: Option<ParentSnapshot>,
) -> Result<ResolvedVisibility, ApiError> {
    if let Some(r) = renote {
        if r.pure_renote {
            return Err(ApiError::CannotRenotePureRenote);
        }
        if r.deleted {
            return Err(ApiError::RenoteTargetDeleted);
        }
        if r.visibility != Visibility::Public && r.visibility != Visibility::Home {
            return Err(ApiError::RenoteTargetNotPublic);
        }
    }
    if let Some(r) = reply {
        if r.pure_renote {
            return Err(ApiError::CannotReplyToPureRenote);
        }
        if r.deleted {
            return Err(ApiError::ReplyTargetDeleted);
        }
    }

    let mut visibility = req.visibility.unwrap_or(if renote.is_some() {
        Visibility::Home
    } else {
        Visibility::Public
    });

    if req.copy_once && visibility == Visibility::Specified {
        return Err(ApiError::CopyOnceSpecified);
    }

    // Renote of a home note stays home.
    if let Some(r) = renote {
        if visibility == Visibility::Public && r.visibility == Visibility::Home {
            visibility = Visibility::Home;
        }
    }

    // A pure renote never broadcasts wider than home.
    let pure_renote = renote.is_some() && !req.has_content;
    if pure_renote && visibility == Visibility::Public {
        visibility = Visibility::Home;
    }

    let local_only = req.local_only
        || renote.map(|r| r.local_only).unwrap_or(false)
        || reply.map(|r| r.local_only).unwrap_or(false);

    let copy_once = req.copy_once && !local_only;

    Ok(ResolvedVisibility {
        visibility,
        local_only,
        copy_once,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parent(visibility: Visibility) -> ParentSnapshot {
        ParentSnapshot {
            visibility,
            local_only: false,
            deleted: false,
            pure_renote: false,
        }
    }

    fn req(visibility: Option<Visibility>) -> VisibilityRequest {
        VisibilityRequest {
            visibility,
            local_only: false,
            copy_once: false,
            has_content: true,
        }
    }

    #[test]
    fn defaults_public_or_home() {
        let r = resolve(req(None), None, None).unwrap();
        assert_eq!(r.visibility, Visibility::Public);

        let r = resolve(req(None), None, Some(parent(Visibility::Public))).unwrap();
        assert_eq!(r.visibility, Visibility::Home);
    }

    #[test]
    fn renote_of_home_clamps_public_to_home() {
        let r = resolve(
            req(Some(Visibility::Public)),
            None,
            Some(parent(Visibility::Home)),
        )
        .unwrap();
        assert_eq!(r.visibility, Visibility::Home);
    }

    #[test]
    fn pure_renote_clamps_public_to_home() {
        let mut rq = req(Some(Visibility::Public));
        rq.has_content = false;
        let r = resolve(rq, None, Some(parent(Visibility::Public))).unwrap();
        assert_eq!(r.visibility, Visibility::Home);
    }

    #[test]
    fn quote_of_public_keeps_public() {
        let r = resolve(
            req(Some(Visibility::Public)),
            None,
            Some(parent(Visibility::Public)),
        )
        .unwrap();
        assert_eq!(r.visibility, Visibility::Public);
    }

    #[test]
    fn local_only_inherited_from_parents() {
        let mut p = parent(Visibility::Public);
        p.local_only = true;

        // Reply to a localOnly note: visibility stays as requested, but the
        // note can never federate.
        let r = resolve(req(Some(Visibility::Public)), Some(p), None).unwrap();
        assert_eq!(r.visibility, Visibility::Public);
        assert!(r.local_only);

        let r = resolve(req(Some(Visibility::Home)), None, Some(p)).unwrap();
        assert!(r.local_only);
    }

    #[test]
    fn copy_once_cleared_by_local_only_never_errors() {
        let mut rq = req(Some(Visibility::Public));
        rq.copy_once = true;
        rq.local_only = true;
        let r = resolve(rq, None, None).unwrap();
        assert!(!r.copy_once);
        assert!(r.local_only);
    }

    #[test]
    fn copy_once_specified_rejected() {
        let mut rq = req(Some(Visibility::Specified));
        rq.copy_once = true;
        let e = resolve(rq, None, None).unwrap_err();
        assert_eq!(e.code(), "DENY_REMOTE_FOLLOWER_ONLY");
    }

    #[test]
    fn renote_rejections() {
        let mut deleted = parent(Visibility::Public);
        deleted.deleted = true;
        assert_eq!(
            resolve(req(None), None, Some(deleted)).unwrap_err().code(),
            "NO_SUCH_RENOTE_TARGET"
        );

        assert_eq!(
            resolve(req(None), None, Some(parent(Visibility::Followers)))
                .unwrap_err()
                .code(),
            "CANNOT_RENOTE_NON_PUBLIC"
        );

        let mut pure = parent(Visibility::Public);
        pure.pure_renote = true;
        // Chained renote is rejected no matter the requested visibility.
        for v in [
            None,
            Some(Visibility::Public),
            Some(Visibility::Home),
            Some(Visibility::Followers),
            Some(Visibility::Specified),
        ] {
            assert_eq!(
                resolve(req(v), None, Some(pure)).unwrap_err().code(),
                "CANNOT_RENOTE_TO_A_PURE_RENOTE"
            );
        }
        assert_eq!(
            resolve(req(None), Some(pure), None).unwrap_err().code(),
            "CANNOT_REPLY_TO_A_PURE_RENOTE"
        );
    }

    #[test]
    fn legacy_private_is_specified() {
        assert_eq!(Visibility::parse("private"), Some(Visibility::Specified));
    }

    #[test]
    fn full_decision_table_is_pure() {
        // Same inputs, same outputs, across the whole grid.
        let grid_vis = [
            None,
            Some(Visibility::Public),
            Some(Visibility::Home),
            Some(Visibility::Followers),
        ];
        for requested in grid_vis {
            for renote_vis in [Visibility::Public, Visibility::Home] {
                for has_content in [true, false] {
                    for parent_local in [true, false] {
                        let mut p = parent(renote_vis);
                        p.local_only = parent_local;
                        let mut rq = req(requested);
                        rq.has_content = has_content;
                        let a = resolve(rq, None, Some(p)).unwrap();
                        let b = resolve(rq, None, Some(p)).unwrap();
                        assert_eq!(a, b);
                        assert_eq!(a.local_only, parent_local);
                        if !has_content {
                            assert_ne!(a.visibility, Visibility::Public);
                        }
                    }
                }
            }
        }
    }
}
