/*
 * SPDX-FileCopyrightText: 2026 Tanzaku Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use axum::{routing::any, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tanzaku_core::api::{handle_request, ApiState};
use tanzaku_core::config::Config;
use tanzaku_core::delivery::Delivery;
use tanzaku_core::delivery_queue::{DeliveryQueue, QueueSettings};
use tanzaku_core::http_sig::KeyResolver;
use tanzaku_core::keys::load_or_generate_identity;
use tanzaku_core::pipeline::{start_expiry_worker, NotePipeline, NullIndexer};
use tanzaku_core::resolve_user::WebfingerUserResolver;
use tanzaku_core::resolver::SignedFetchConfig;
use tanzaku_core::social_db::SocialDb;
use tanzaku_core::stream::new_publisher;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .try_init()
        .ok();

    let cfg = Config::from_env()?;
    std::fs::create_dir_all(&cfg.data_dir)
        .with_context(|| format!("create data dir: {}", cfg.data_dir.display()))?;

    // The proxy actor identity signs authenticated fetches.
    let proxy_identity = load_or_generate_identity(&cfg.data_dir, "instance_actor")?;
    let proxy = SignedFetchConfig {
        private_key_pem: proxy_identity.private_key_pem.clone(),
        key_id: format!("{}/users/instance.actor#main-key", cfg.public_base_url),
    };

    let db_path = cfg.data_dir.join("tanzaku.db");
    let social = Arc::new(SocialDb::open(&db_path)?);
    let queue = Arc::new(DeliveryQueue::open(&db_path)?);
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("build http client")?;
    let stream = new_publisher();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let delivery = Delivery::new(http.clone());
    queue.start_worker(
        shutdown_rx.clone(),
        cfg.clone(),
        Arc::new(delivery.clone()),
        social.clone(),
        QueueSettings::default(),
    );
    start_expiry_worker(social.clone(), stream.clone(), shutdown_rx.clone());

    let user_resolver = WebfingerUserResolver::new(
        social.clone(),
        delivery,
        http.clone(),
        proxy.clone(),
    );
    let pipeline = NotePipeline::new(
        cfg.clone(),
        social,
        queue,
        stream,
        Arc::new(user_resolver),
        Arc::new(NullIndexer),
    );
    let state = ApiState {
        pipeline,
        key_resolver: Arc::new(KeyResolver::new(http.clone())),
        proxy: Some(proxy),
        http,
    };

    let router = Router::new()
        .fallback(any(move |req| {
            let st = state.clone();
            async move { handle_request(&st, req).await }
        }))
        .layer(TraceLayer::new_for_http());

    let bind = std::env::var("TANZAKU_BIND").unwrap_or_else(|_| "127.0.0.1:3000".to_string());
    let addr: SocketAddr = bind.parse().context("parse bind")?;
    let listener = tokio::net::TcpListener::bind(addr).await.context("bind")?;
    info!("tanzaku listening on http://{addr}");

    let mut server_shutdown_rx = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        let shutdown = async move {
            let _ = server_shutdown_rx.changed().await;
        };
        axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await
    });

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    server.await.context("join server")?.context("server")?;
    Ok(())
}
