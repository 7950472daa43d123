/*
 * SPDX-FileCopyrightText: 2026 Tanzaku Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! The thin HTTP surface: note creation, actor/note dereference for
//! federation, the shared inbox, and the live-event stream. Session/token
//! authentication sits in front of this server; requests arrive with the
//! resolved local user id in `x-tanzaku-user`.

use crate::error::ApiError;
use crate::http_sig::{
    build_signing_string, parse_signature_header, verify_date, verify_digest_if_present,
    verify_signature_rsa_sha256, KeyResolver,
};
use crate::id::now_ms;
use crate::kernel;
use crate::pipeline::{NoteCreateOptions, NotePipeline};
use crate::renderer::{render_activity, render_note, render_person, NoteRecipients};
use crate::resolver::{Resolver, SignedFetchConfig};
use crate::social_db::{Poll, PollChoice, User};
use crate::stream::StreamEvent;
use crate::visibility::Visibility;
use axum::body::Body;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures_util::stream::unfold;
use http::{Request, Response, StatusCode};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tanzaku_protocol::{NoteCreateRequest, PollRequest};
use tokio::sync::broadcast;
use tracing::{info, warn};

const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;
const MAX_CW_LENGTH: usize = 100;

#[derive(Clone)]
pub struct ApiState {
    pub pipeline: NotePipeline,
    pub key_resolver: Arc<KeyResolver>,
    pub proxy: Option<SignedFetchConfig>,
    pub http: reqwest::Client,
}

pub async fn handle_request(state: &ApiState, req: Request<Body>) -> Response<Body> {
    let path = req.uri().path().to_string();
    match (req.method().as_str(), path.as_str()) {
        ("POST", "/api/notes/create") => notes_create(state, req).await,
        ("POST", "/inbox") => inbox_post(state, req).await,
        ("GET", "/api/stream") => stream_get(state, req).await,
        ("GET", "/inbox") => simple(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
        ("GET", p) if p.starts_with("/users/") => {
            actor_get(state, p.trim_start_matches("/users/")).await
        }
        ("GET", p) if p.starts_with("/notes/") => {
            note_get(state, p.trim_start_matches("/notes/")).await
        }
        _ => simple(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn notes_create(state: &ApiState, req: Request<Body>) -> Response<Body> {
    let (parts, body) = req.into_parts();
    let body_bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(_) => return simple(StatusCode::BAD_REQUEST, "invalid body"),
    };

    let Some(user_id) = parts
        .headers
        .get("x-tanzaku-user")
        .and_then(|v| v.to_str().ok())
    else {
        return simple(StatusCode::UNAUTHORIZED, "missing user");
    };
    let user = match state.pipeline.social.get_user(user_id) {
        Ok(Some(u)) => u,
        Ok(None) => return simple(StatusCode::UNAUTHORIZED, "unknown user"),
        Err(e) => return simple(StatusCode::BAD_GATEWAY, &format!("db error: {e}")),
    };
    if user.is_suspended {
        return simple(StatusCode::FORBIDDEN, "suspended");
    }

    let request: NoteCreateRequest = match serde_json::from_slice(&body_bytes) {
        Ok(v) => v,
        Err(_) => return simple(StatusCode::BAD_REQUEST, "invalid json"),
    };

    let is_first_note = user.notes_count == 0;
    let opts = match build_options(state, &user, request) {
        Ok(o) => o,
        Err(e) => return api_error(&e),
    };

    match state.pipeline.create(&user, opts).await {
        Ok(outcome) => {
            let mut body = json!({ "createdNote": outcome.note });
            if is_first_note && outcome.note.is_some() {
                body["isFirstNote"] = json!(true);
            }
            json_response(StatusCode::OK, &body)
        }
        Err(e) => api_error(&e),
    }
}

/// API-shape validation; everything that survives goes to the pipeline as
/// service-level options.
fn build_options(
    state: &ApiState,
    user: &User,
    req: NoteCreateRequest,
) -> Result<NoteCreateOptions, ApiError> {
    let cfg = &state.pipeline.cfg;

    let text = req
        .text
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());
    if let Some(t) = &text {
        if t.chars().count() > cfg.max_note_text_length {
            return Err(ApiError::InvalidParam("text"));
        }
    }
    if let Some(c) = &req.cw {
        if c.chars().count() > MAX_CW_LENGTH {
            return Err(ApiError::InvalidParam("cw"));
        }
    }

    let visibility = match req.visibility.as_deref() {
        None => None,
        Some(s) => Some(Visibility::parse(s).ok_or(ApiError::InvalidParam("visibility"))?),
    };

    let poll = req.poll.map(|p| build_poll(p)).transpose()?;

    let files = state
        .pipeline
        .social
        .get_drive_files(&req.file_ids, &user.id)?;

    Ok(NoteCreateOptions {
        text,
        cw: req.cw,
        visibility,
        visible_user_ids: req.visible_user_ids,
        files,
        reply_id: req.reply_id,
        renote_id: req.renote_id,
        poll,
        local_only: req.local_only,
        copy_once: req.copy_once,
        via_mobile: req.via_mobile,
        geo: req.geo.map(|g| serde_json::to_value(g).unwrap_or(Value::Null)),
        ..Default::default()
    })
}

fn build_poll(p: PollRequest) -> Result<Poll, ApiError> {
    let choices: Vec<String> = p
        .choices
        .iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    if choices.len() < 2 || choices.len() > 20 {
        return Err(ApiError::InvalidParam("poll"));
    }
    if choices.iter().any(|c| c.chars().count() > 128) {
        return Err(ApiError::InvalidParam("poll"));
    }
    let mut seen = choices.clone();
    seen.sort();
    seen.dedup();
    if seen.len() != choices.len() {
        return Err(ApiError::InvalidParam("poll"));
    }

    let expires_at_ms = match (p.expires_at, p.expired_after) {
        (Some(at), _) => {
            if at < now_ms() {
                return Err(ApiError::AlreadyExpiredPoll);
            }
            Some(at)
        }
        (None, Some(after)) if after > 0 => Some(now_ms() + after),
        _ => None,
    };

    Ok(Poll {
        choices: choices
            .into_iter()
            .map(|text| PollChoice { text, votes: 0 })
            .collect(),
        multiple: p.multiple,
        expires_at_ms,
    })
}

async fn actor_get(state: &ApiState, id: &str) -> Response<Body> {
    let user = match state.pipeline.social.get_user(id) {
        Ok(Some(u)) if u.is_local() => u,
        Ok(_) => return simple(StatusCode::NOT_FOUND, "no such user"),
        Err(e) => return simple(StatusCode::BAD_GATEWAY, &format!("db error: {e}")),
    };
    let person = render_person(&state.pipeline.cfg, &user);
    match render_activity(&state.pipeline.cfg, Some(person)) {
        Some(doc) => ap_json(&doc),
        None => simple(StatusCode::NOT_FOUND, "no such user"),
    }
}

async fn note_get(state: &ApiState, id: &str) -> Response<Body> {
    let cfg = &state.pipeline.cfg;
    let note = match state.pipeline.social.get_note(id) {
        Ok(Some(n)) => n,
        Ok(None) => return simple(StatusCode::NOT_FOUND, "no such note"),
        Err(e) => return simple(StatusCode::BAD_GATEWAY, &format!("db error: {e}")),
    };
    // Only local, live, broadly visible notes dereference publicly.
    if note.user_host.is_some()
        || note.is_deleted()
        || note.local_only
        || !matches!(note.visibility, Visibility::Public | Visibility::Home)
    {
        return simple(StatusCode::NOT_FOUND, "no such note");
    }

    let rcpt = NoteRecipients {
        mentioned_uris: note
            .mentioned_remote_users
            .iter()
            .map(|m| m.uri.clone())
            .collect(),
        visible_uris: Vec::new(),
    };
    let in_reply_to = note
        .reply
        .as_ref()
        .and_then(|r| parent_object_uri(state, &r.note_id));
    let quote_uri = note
        .renote
        .as_ref()
        .filter(|_| note.is_quote())
        .and_then(|r| parent_object_uri(state, &r.note_id));

    let files = state
        .pipeline
        .social
        .get_drive_files(&note.file_ids, &note.user_id)
        .unwrap_or_default();
    let object = render_note(cfg, &note, &rcpt, &files, in_reply_to.as_deref(), quote_uri.as_deref());
    match render_activity(cfg, Some(object)) {
        Some(doc) => ap_json(&doc),
        None => simple(StatusCode::NOT_FOUND, "no such note"),
    }
}

fn parent_object_uri(state: &ApiState, note_id: &str) -> Option<String> {
    let parent = state.pipeline.social.get_note(note_id).ok().flatten()?;
    Some(
        parent
            .uri
            .unwrap_or_else(|| state.pipeline.cfg.note_url(&parent.id)),
    )
}

async fn inbox_post(state: &ApiState, req: Request<Body>) -> Response<Body> {
    let (parts, body) = req.into_parts();
    let body_bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(_) => return simple(StatusCode::BAD_REQUEST, "invalid body"),
    };

    if let Err(e) = verify_digest_if_present(&parts.headers, &body_bytes) {
        return simple(StatusCode::UNAUTHORIZED, &format!("digest: {e}"));
    }
    if let Err(e) = verify_date(&parts.headers, state.pipeline.cfg.max_date_skew) {
        return simple(StatusCode::UNAUTHORIZED, &format!("date: {e}"));
    }
    let Some(sig_header) = parts
        .headers
        .get("Signature")
        .and_then(|v| v.to_str().ok())
    else {
        return simple(StatusCode::UNAUTHORIZED, "missing signature");
    };
    let params = match parse_signature_header(sig_header) {
        Ok(p) => p,
        Err(e) => return simple(StatusCode::UNAUTHORIZED, &format!("signature: {e}")),
    };
    let pem = match state
        .key_resolver
        .resolve_public_key_pem(&params.key_id)
        .await
    {
        Ok(p) => p,
        Err(e) => return simple(StatusCode::UNAUTHORIZED, &format!("key: {e}")),
    };
    let signing_string =
        match build_signing_string(&parts.method, &parts.uri, &parts.headers, &params.headers) {
            Ok(s) => s,
            Err(e) => return simple(StatusCode::UNAUTHORIZED, &format!("signature: {e}")),
        };
    if let Err(e) = verify_signature_rsa_sha256(&pem, &signing_string, &params.signature) {
        return simple(StatusCode::UNAUTHORIZED, &format!("signature: {e}"));
    }

    let activity: Value = match serde_json::from_slice(&body_bytes) {
        Ok(v) => v,
        Err(_) => return simple(StatusCode::BAD_REQUEST, "invalid json"),
    };

    if activity.get("type").and_then(|v| v.as_str()) == Some("Update") {
        let actor = activity
            .get("actor")
            .and_then(|v| v.as_str())
            .and_then(|uri| state.pipeline.social.get_user_by_uri(uri).ok().flatten());
        if let Some(actor) = actor.filter(|a| a.is_remote()) {
            let mut resolver = Resolver::new(
                state.pipeline.cfg.clone(),
                state.http.clone(),
                state.proxy.clone(),
            );
            match kernel::handle_update(&state.pipeline.social, &mut resolver, &actor, &activity)
                .await
            {
                Ok(verdict) => info!("inbox update: {verdict}"),
                Err(e) => {
                    warn!("inbox update resolution failed: {e:#}");
                    return simple(StatusCode::BAD_GATEWAY, "resolution failed");
                }
            }
        }
    }

    simple(StatusCode::ACCEPTED, "accepted")
}

async fn stream_get(state: &ApiState, req: Request<Body>) -> Response<Body> {
    let filter_kind = req
        .uri()
        .query()
        .unwrap_or("")
        .split('&')
        .find(|p| p.starts_with("kind="))
        .and_then(|p| p.split_once('='))
        .map(|(_, v)| v.to_string())
        .unwrap_or_default();

    let rx = state.pipeline.stream.subscribe();
    let stream = unfold(rx, move |mut rx| {
        let filter_kind = filter_kind.clone();
        async move {
            loop {
                match rx.recv().await {
                    Ok(ev) => {
                        if !filter_kind.is_empty() && ev.kind != filter_kind {
                            continue;
                        }
                        let data = serde_json::to_string::<StreamEvent>(&ev)
                            .unwrap_or_else(|_| "{}".to_string());
                        let evt = Event::default().event("tanzaku").data(data);
                        return Some((Ok::<Event, Infallible>(evt), rx));
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => return None,
                }
            }
        }
    });

    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("keepalive"),
        )
        .into_response()
}

fn simple(status: StatusCode, msg: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(Body::from(msg.to_string()))
        .expect("static response")
}

fn json_response(status: StatusCode, v: &Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(v).unwrap_or_default()))
        .expect("static response")
}

fn ap_json(v: &Value) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/activity+json; charset=utf-8")
        .body(Body::from(serde_json::to_vec(v).unwrap_or_default()))
        .expect("static response")
}

fn api_error(e: &ApiError) -> Response<Body> {
    let status = StatusCode::from_u16(e.status()).unwrap_or(StatusCode::BAD_REQUEST);
    let body = tanzaku_protocol::ApiErrorBody::new(e.code(), e.to_string());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap_or_default()))
        .expect("static response")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::delivery_queue::DeliveryQueue;
    use crate::pipeline::{NullIndexer, NullUserResolver};
    use crate::social_db::tests::{local_user, temp_db};
    use crate::stream::new_publisher;
    use http::Method;
    use rand::RngCore;

    fn test_state() -> ApiState {
        let cfg = Config {
            public_base_url: "https://tanzaku.example".into(),
            local_host: "tanzaku.example".into(),
            data_dir: std::env::temp_dir(),
            disable_posts: false,
            max_note_text_length: 1000,
            max_date_skew: Duration::from_secs(300),
            blocked_hosts: Vec::new(),
            create_limit_per_hour: 300,
        };
        let mut b = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut b);
        let queue_path = std::env::temp_dir().join(format!("tanzaku-api-{}.db", hex::encode(b)));
        let http = reqwest::Client::new();
        let pipeline = NotePipeline::new(
            cfg,
            Arc::new(temp_db()),
            Arc::new(DeliveryQueue::open(queue_path).unwrap()),
            new_publisher(),
            Arc::new(NullUserResolver),
            Arc::new(NullIndexer),
        );
        ApiState {
            pipeline,
            key_resolver: Arc::new(KeyResolver::new(http.clone())),
            proxy: None,
            http,
        }
    }

    fn post_create(user: Option<&str>, body: Value) -> Request<Body> {
        let mut b = Request::builder()
            .method(Method::POST)
            .uri("/api/notes/create")
            .header("content-type", "application/json");
        if let Some(u) = user {
            b = b.header("x-tanzaku-user", u);
        }
        b.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_json(resp: Response<Body>) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), MAX_BODY_BYTES)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn create_requires_user() {
        let state = test_state();
        let resp = handle_request(&state, post_create(None, json!({"text": "hi"}))).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn create_packs_note() {
        let state = test_state();
        state
            .pipeline
            .social
            .upsert_user(&local_user("u1", "alice"))
            .unwrap();

        let resp = handle_request(
            &state,
            post_create(Some("u1"), json!({"text": "hello #world"})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["createdNote"]["visibility"], "public");
        assert_eq!(body["createdNote"]["tags"], json!(["world"]));
        assert_eq!(body["isFirstNote"], json!(true));
    }

    #[tokio::test]
    async fn create_rejects_copy_once_specified() {
        let state = test_state();
        state
            .pipeline
            .social
            .upsert_user(&local_user("u1", "alice"))
            .unwrap();

        let resp = handle_request(
            &state,
            post_create(
                Some("u1"),
                json!({"text": "hi", "visibility": "specified", "copyOnce": true}),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert_eq!(body["error"]["code"], "DENY_REMOTE_FOLLOWER_ONLY");
    }

    #[tokio::test]
    async fn create_rejects_expired_poll() {
        let state = test_state();
        state
            .pipeline
            .social
            .upsert_user(&local_user("u1", "alice"))
            .unwrap();

        let resp = handle_request(
            &state,
            post_create(
                Some("u1"),
                json!({"poll": {"choices": ["a", "b"], "expiresAt": 1000}}),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert_eq!(body["error"]["code"], "CANNOT_CREATE_ALREADY_EXPIRED_POLL");
    }

    #[tokio::test]
    async fn legacy_private_maps_to_specified() {
        let state = test_state();
        state
            .pipeline
            .social
            .upsert_user(&local_user("u1", "alice"))
            .unwrap();

        let resp = handle_request(
            &state,
            post_create(Some("u1"), json!({"text": "secret", "visibility": "private"})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["createdNote"]["visibility"], "specified");
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let state = test_state();
        let req = Request::builder()
            .method(Method::GET)
            .uri("/api/unknown")
            .body(Body::empty())
            .unwrap();
        let resp = handle_request(&state, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn actor_and_note_dereference() {
        let state = test_state();
        let mut alice = local_user("u1", "alice");
        alice.public_key_pem = Some("PEM".into());
        state.pipeline.social.upsert_user(&alice).unwrap();

        let resp = handle_request(
            &state,
            Request::builder()
                .method(Method::GET)
                .uri("/users/u1")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let doc = body_json(resp).await;
        assert_eq!(doc["type"], "Person");
        assert!(doc["@context"].is_array());

        // Create a note, then dereference it.
        let resp = handle_request(&state, post_create(Some("u1"), json!({"text": "hi"}))).await;
        let created = body_json(resp).await;
        let note_id = created["createdNote"]["id"].as_str().unwrap().to_string();

        let resp = handle_request(
            &state,
            Request::builder()
                .method(Method::GET)
                .uri(format!("/notes/{note_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let doc = body_json(resp).await;
        assert_eq!(doc["type"], "Note");
        assert_eq!(
            doc["id"],
            json!(format!("https://tanzaku.example/notes/{note_id}"))
        );
    }

    #[tokio::test]
    async fn inbox_requires_signature() {
        let state = test_state();
        let req = Request::builder()
            .method(Method::POST)
            .uri("/inbox")
            .header("Date", httpdate::fmt_http_date(std::time::SystemTime::now()))
            .body(Body::from("{}"))
            .unwrap();
        let resp = handle_request(&state, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
