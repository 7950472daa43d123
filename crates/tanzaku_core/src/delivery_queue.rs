/*
 * SPDX-FileCopyrightText: 2026 Tanzaku Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Durable per-inbox delivery jobs. queued -> sending -> delivered, or
//! queued -> sending -> (retry wait) -> ... -> failed once the attempt cap
//! is reached. A 410 short-circuits to failed and drops the inbox from
//! future addressing. Reachability bookkeeping happens here, on every
//! attempt, against the instance registry.

use crate::config::Config;
use crate::delivery::{host_of, DeliverError, Delivery};
use crate::id::now_ms;
use crate::social_db::SocialDb;
use anyhow::{Context, Result};
use rand::{rngs::OsRng, RngCore};
use rusqlite::{params, Connection};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tracing::{info, warn};

pub const STATUS_QUEUED: i64 = 0;
pub const STATUS_SENDING: i64 = 1;
pub const STATUS_DELIVERED: i64 = 2;
pub const STATUS_FAILED: i64 = 3;

/// Lease on a `sending` job; a crashed worker's jobs become due again after
/// this long.
const SENDING_LEASE_MS: i64 = 10 * 60 * 1000;

#[derive(Clone)]
pub struct DeliveryQueue {
    db_path: PathBuf,
    notify: Arc<Notify>,
}

#[derive(Clone, Copy)]
pub struct QueueSettings {
    pub max_attempts: u32,
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_backoff_secs: 5,
            max_backoff_secs: 3600,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub attempt: u32,
    pub inbox: String,
    pub activity_json: Vec<u8>,
    pub signer_user_id: String,
}

#[derive(Debug, Clone)]
pub struct QueueStats {
    pub pending: u64,
    pub delivered: u64,
    pub failed: u64,
}

impl DeliveryQueue {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        init_db(&db_path)?;
        Ok(Self {
            db_path,
            notify: Arc::new(Notify::new()),
        })
    }

    /// One job per inbox. Unreachable hosts are enqueued like any other;
    /// reachability is the worker's concern, not the enqueuer's.
    pub async fn enqueue_activity(
        &self,
        activity_json: Vec<u8>,
        inboxes: Vec<String>,
        signer_user_id: String,
    ) -> Result<u64> {
        let created_at = now_ms();
        let count = tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<u64> {
                let mut conn = Connection::open(db_path)?;
                let tx = conn.transaction()?;
                for inbox in inboxes {
                    let job_id = new_job_id();
                    tx.execute(
                        r#"
                        INSERT INTO delivery_jobs (
                          id, created_at_ms, next_attempt_at_ms, attempt, status, inbox, activity_json, signer_user_id, last_error
                        ) VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6, ?7, NULL)
                        "#,
                        params![job_id, created_at, created_at, STATUS_QUEUED, inbox, activity_json, signer_user_id],
                    )?;
                }
                tx.commit()?;
                let pending: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM delivery_jobs WHERE status = ?1",
                    params![STATUS_QUEUED],
                    |r| r.get(0),
                )?;
                Ok(pending)
            }
        })
        .await??;

        self.notify.notify_one();
        Ok(count)
    }

    pub fn start_worker(
        &self,
        shutdown: watch::Receiver<bool>,
        cfg: Config,
        delivery: Arc<Delivery>,
        social: Arc<SocialDb>,
        settings: QueueSettings,
    ) {
        let queue = self.clone();
        tokio::spawn(async move {
            if let Err(e) = queue
                .run_loop(shutdown, cfg, delivery, social, settings)
                .await
            {
                warn!("delivery worker stopped: {e:#}");
            }
        });
    }

    async fn run_loop(
        &self,
        mut shutdown: watch::Receiver<bool>,
        cfg: Config,
        delivery: Arc<Delivery>,
        social: Arc<SocialDb>,
        settings: QueueSettings,
    ) -> Result<()> {
        info!("delivery queue db: {}", self.db_path.display());

        let tick = Duration::from_secs(2);
        loop {
            if *shutdown.borrow() {
                break;
            }

            let jobs = self.fetch_due_jobs(64).await?;
            if jobs.is_empty() {
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = tokio::time::sleep(tick) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            // One in-flight delivery per destination host, hosts in
            // parallel. Within a host the due-order is preserved.
            let mut by_host: HashMap<String, Vec<Job>> = HashMap::new();
            for job in jobs {
                let host = host_of(&job.inbox).unwrap_or_else(|| "?".to_string());
                by_host.entry(host).or_default().push(job);
            }

            let mut set = JoinSet::new();
            for (_host, host_jobs) in by_host {
                let queue = self.clone();
                let cfg = cfg.clone();
                let delivery = delivery.clone();
                let social = social.clone();
                let shutdown = shutdown.clone();
                set.spawn(async move {
                    for job in host_jobs {
                        if *shutdown.borrow() {
                            break;
                        }
                        if let Err(e) = queue
                            .process_one(&cfg, &delivery, &social, &settings, job)
                            .await
                        {
                            warn!("delivery job error: {e:#}");
                        }
                    }
                });
            }
            while set.join_next().await.is_some() {}
        }
        Ok(())
    }

    async fn fetch_due_jobs(&self, limit: u32) -> Result<Vec<Job>> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<Vec<Job>> {
                let conn = Connection::open(db_path)?;
                let now = now_ms();
                let mut stmt = conn.prepare(
                    r#"
                    SELECT id, attempt, inbox, activity_json, signer_user_id
                    FROM delivery_jobs
                    WHERE status IN (?1, ?2) AND next_attempt_at_ms <= ?3
                    ORDER BY next_attempt_at_ms ASC
                    LIMIT ?4
                    "#,
                )?;
                let mut rows = stmt.query(params![STATUS_QUEUED, STATUS_SENDING, now, limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(Job {
                        id: row.get(0)?,
                        attempt: row.get(1)?,
                        inbox: row.get(2)?,
                        activity_json: row.get(3)?,
                        signer_user_id: row.get(4)?,
                    });
                }
                Ok(out)
            }
        })
        .await?
    }

    async fn process_one(
        &self,
        cfg: &Config,
        delivery: &Delivery,
        social: &SocialDb,
        settings: &QueueSettings,
        job: Job,
    ) -> Result<()> {
        let signer = tokio::task::spawn_blocking({
            let social = social.clone();
            let id = job.signer_user_id.clone();
            move || social.get_user(&id)
        })
        .await??;
        let Some(signer) = signer else {
            self.mark_failed(&job.id, "signer no longer exists").await?;
            return Ok(());
        };
        let Some(pem) = signer.signing_key_pem().map(str::to_string) else {
            self.mark_failed(&job.id, "signer has no key").await?;
            return Ok(());
        };
        let key_id = format!("{}#main-key", cfg.user_url(&signer.id));

        self.mark_sending(&job.id).await?;
        let outcome = delivery
            .deliver_json(&pem, &key_id, &job.inbox, &job.activity_json)
            .await;
        self.apply_outcome(social, settings, &job, outcome).await
    }

    /// The whole state machine lives here so it can be driven in tests
    /// without a network.
    pub async fn apply_outcome(
        &self,
        social: &SocialDb,
        settings: &QueueSettings,
        job: &Job,
        outcome: Result<(), DeliverError>,
    ) -> Result<()> {
        let host = host_of(&job.inbox);
        match outcome {
            Ok(()) => {
                self.mark_delivered(&job.id).await?;
                if let Some(host) = host {
                    let _ = tokio::task::spawn_blocking({
                        let social = social.clone();
                        move || social.instance_delivery_succeeded(&host)
                    })
                    .await?;
                }
            }
            Err(DeliverError::Gone) => {
                // Terminal right away; the account no longer exists there.
                self.mark_failed(&job.id, "410 gone").await?;
                let _ = tokio::task::spawn_blocking({
                    let social = social.clone();
                    let inbox = job.inbox.clone();
                    move || -> Result<()> {
                        social.clear_inbox_by_url(&inbox)?;
                        if let Some(host) = host {
                            social.instance_delivery_failed(&host)?;
                        }
                        Ok(())
                    }
                })
                .await?;
            }
            Err(e) => {
                let attempt_no = job.attempt.saturating_add(1);
                if attempt_no >= settings.max_attempts {
                    self.mark_failed(&job.id, &format!("{e:#}")).await?;
                } else {
                    let delay = next_backoff(
                        attempt_no,
                        settings.base_backoff_secs,
                        settings.max_backoff_secs,
                    );
                    self.reschedule(&job.id, attempt_no, delay, &format!("{e:#}"))
                        .await?;
                }
                let _ = tokio::task::spawn_blocking({
                    let social = social.clone();
                    move || {
                        if let Some(host) = host {
                            social.instance_delivery_failed(&host)?;
                        }
                        Ok::<_, anyhow::Error>(())
                    }
                })
                .await?;
            }
        }
        Ok(())
    }

    async fn mark_sending(&self, id: &str) -> Result<()> {
        self.update_status(id, STATUS_SENDING, Some(now_ms() + SENDING_LEASE_MS), None)
            .await
    }

    async fn mark_delivered(&self, id: &str) -> Result<()> {
        self.update_status(id, STATUS_DELIVERED, None, None).await
    }

    async fn mark_failed(&self, id: &str, err: &str) -> Result<()> {
        self.update_status(id, STATUS_FAILED, None, Some(err.to_string()))
            .await
    }

    async fn update_status(
        &self,
        id: &str,
        status: i64,
        next_attempt_at_ms: Option<i64>,
        err: Option<String>,
    ) -> Result<()> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            let id = id.to_string();
            move || -> Result<()> {
                let conn = Connection::open(db_path)?;
                match next_attempt_at_ms {
                    Some(next) => conn.execute(
                        "UPDATE delivery_jobs SET status = ?2, next_attempt_at_ms = ?3, last_error = ?4 WHERE id = ?1",
                        params![id, status, next, err],
                    )?,
                    None => conn.execute(
                        "UPDATE delivery_jobs SET status = ?2, last_error = ?3 WHERE id = ?1",
                        params![id, status, err],
                    )?,
                };
                Ok(())
            }
        })
        .await??;
        Ok(())
    }

    async fn reschedule(&self, id: &str, attempt: u32, delay: Duration, err: &str) -> Result<()> {
        let next = now_ms().saturating_add(delay.as_millis() as i64);
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            let id = id.to_string();
            let err = err.to_string();
            move || -> Result<()> {
                let conn = Connection::open(db_path)?;
                conn.execute(
                    "UPDATE delivery_jobs SET status = ?2, attempt = ?3, next_attempt_at_ms = ?4, last_error = ?5 WHERE id = ?1",
                    params![id, STATUS_QUEUED, attempt, next, err],
                )?;
                Ok(())
            }
        })
        .await??;
        Ok(())
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<QueueStats> {
                let conn = Connection::open(db_path)?;
                let count = |status: i64| -> Result<u64> {
                    Ok(conn.query_row(
                        "SELECT COUNT(*) FROM delivery_jobs WHERE status = ?1",
                        params![status],
                        |r| r.get(0),
                    )?)
                };
                Ok(QueueStats {
                    pending: count(STATUS_QUEUED)? + count(STATUS_SENDING)?,
                    delivered: count(STATUS_DELIVERED)?,
                    failed: count(STATUS_FAILED)?,
                })
            }
        })
        .await?
    }

    pub async fn job_rows(&self) -> Result<Vec<(String, i64, u32, String)>> {
        tokio::task::spawn_blocking({
            let db_path = self.db_path.clone();
            move || -> Result<Vec<(String, i64, u32, String)>> {
                let conn = Connection::open(db_path)?;
                let mut stmt = conn.prepare(
                    "SELECT id, status, attempt, inbox FROM delivery_jobs ORDER BY created_at_ms ASC",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?));
                }
                Ok(out)
            }
        })
        .await?
    }
}

fn init_db(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let conn = Connection::open(path).with_context(|| format!("open db: {}", path.display()))?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS delivery_jobs (
          id TEXT PRIMARY KEY,
          created_at_ms INTEGER NOT NULL,
          next_attempt_at_ms INTEGER NOT NULL,
          attempt INTEGER NOT NULL,
          status INTEGER NOT NULL,
          inbox TEXT NOT NULL,
          activity_json BLOB NOT NULL,
          signer_user_id TEXT NOT NULL,
          last_error TEXT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_delivery_due ON delivery_jobs(status, next_attempt_at_ms);
        "#,
    )?;
    Ok(())
}

fn new_job_id() -> String {
    // 16 random bytes -> 32 hex chars
    let mut b = [0u8; 16];
    OsRng.fill_bytes(&mut b);
    hex::encode(b)
}

fn next_backoff(attempt: u32, base_secs: u64, max_secs: u64) -> Duration {
    let pow = attempt.saturating_sub(1).min(20);
    let mut secs = base_secs.saturating_mul(1u64 << pow);
    if secs > max_secs {
        secs = max_secs;
    }
    // jitter 0..1000ms
    let mut b = [0u8; 2];
    OsRng.fill_bytes(&mut b);
    let jitter_ms = u16::from_le_bytes(b) as u64 % 1000;
    Duration::from_secs(secs) + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::social_db::tests::{remote_user, temp_db};

    fn temp_queue() -> DeliveryQueue {
        let mut b = [0u8; 8];
        OsRng.fill_bytes(&mut b);
        let path = std::env::temp_dir().join(format!("tanzaku-queue-{}.db", hex::encode(b)));
        DeliveryQueue::open(path).unwrap()
    }

    async fn one_job(queue: &DeliveryQueue, inbox: &str) -> Job {
        queue
            .enqueue_activity(b"{}".to_vec(), vec![inbox.to_string()], "u1".to_string())
            .await
            .unwrap();
        let jobs = queue.fetch_due_jobs(10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        jobs[0].clone()
    }

    #[tokio::test]
    async fn success_marks_delivered_and_resets_instance() {
        let queue = temp_queue();
        let social = temp_db();
        let job = one_job(&queue, "https://remote.example/inbox").await;
        social.instance_delivery_failed("remote.example").unwrap();

        queue
            .apply_outcome(&social, &QueueSettings::default(), &job, Ok(()))
            .await
            .unwrap();

        let rows = queue.job_rows().await.unwrap();
        assert_eq!(rows[0].1, STATUS_DELIVERED);
        let inst = social.get_instance("remote.example").unwrap().unwrap();
        assert_eq!(inst.latest_failures, 0);
        assert!(!inst.not_responding);
    }

    #[tokio::test]
    async fn gone_is_terminal_and_unaddresses_inbox() {
        let queue = temp_queue();
        let social = temp_db();
        let bob = remote_user("r1", "bob", "remote.example", false);
        social.upsert_user(&bob).unwrap();
        social.add_following(&bob, "local1").unwrap();

        let job = one_job(&queue, "https://remote.example/users/bob/inbox").await;
        queue
            .apply_outcome(
                &social,
                &QueueSettings::default(),
                &job,
                Err(DeliverError::Gone),
            )
            .await
            .unwrap();

        // Straight to failed, no retry-wait in between.
        let rows = queue.job_rows().await.unwrap();
        assert_eq!(rows[0].1, STATUS_FAILED);
        assert_eq!(rows[0].2, 0);
        // No further due work.
        assert!(queue.fetch_due_jobs(10).await.unwrap().is_empty());
        // The inbox disappears from future addressing.
        let inboxes = social.list_remote_follower_inboxes("local1").unwrap();
        assert!(inboxes[0].inbox.is_none());
    }

    #[tokio::test]
    async fn transient_failures_back_off_then_fail() {
        let queue = temp_queue();
        let social = temp_db();
        let settings = QueueSettings {
            max_attempts: 3,
            base_backoff_secs: 1,
            max_backoff_secs: 2,
        };
        let mut job = one_job(&queue, "https://flaky.example/inbox").await;

        for attempt in 1..settings.max_attempts {
            queue
                .apply_outcome(
                    &social,
                    &settings,
                    &job,
                    Err(DeliverError::Status {
                        status: 503,
                        body: String::new(),
                    }),
                )
                .await
                .unwrap();
            let rows = queue.job_rows().await.unwrap();
            assert_eq!(rows[0].1, STATUS_QUEUED);
            assert_eq!(rows[0].2, attempt);
            job.attempt = attempt;
        }

        queue
            .apply_outcome(
                &social,
                &settings,
                &job,
                Err(DeliverError::Status {
                    status: 503,
                    body: String::new(),
                }),
            )
            .await
            .unwrap();
        let rows = queue.job_rows().await.unwrap();
        assert_eq!(rows[0].1, STATUS_FAILED);

        let inst = social.get_instance("flaky.example").unwrap().unwrap();
        assert_eq!(inst.latest_failures, settings.max_attempts as i64);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let a = next_backoff(1, 5, 3600);
        let b = next_backoff(4, 5, 3600);
        let c = next_backoff(20, 5, 3600);
        assert!(a >= Duration::from_secs(5));
        assert!(b >= Duration::from_secs(40));
        assert!(c >= Duration::from_secs(3600));
        assert!(c < Duration::from_secs(3602));
    }
}
