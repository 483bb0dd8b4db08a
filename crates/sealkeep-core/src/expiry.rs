//! Secret expiry warnings.
//!
//! Owners hear about secrets expiring within the warning window; approvers
//! hear about secrets that have already expired. Each `(kind, secret)`
//! notice goes out at most once per [`NOTICE_INTERVAL_MS`], tracked in
//! `notice_log`. A notice that fails to deliver is not logged, so the next
//! run retries it.

use std::sync::Arc;

use rusqlite::params;
use sealkeep_store::Database;
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::error::CoreResult;
use crate::notify::{self, Delivery, Notification, NotificationKind, Notifier, Recipient};

/// Minimum spacing between two notices of the same kind for one secret.
pub const NOTICE_INTERVAL_MS: i64 = 24 * 3_600_000;

const DAY_MS: i64 = 24 * 3_600_000;

/// Outcome of one [`ExpiryWatch::run_at`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExpiryReport {
    pub expiring: usize,
    pub expired: usize,
    /// Notices skipped because one was sent recently.
    pub suppressed: usize,
    pub failed: usize,
}

struct Candidate {
    id: String,
    name: String,
    owner_id: String,
    expires_at: i64,
}

#[derive(Clone)]
pub struct ExpiryWatch {
    db: Database,
    notifier: Arc<dyn Notifier>,
    window_ms: i64,
}

impl ExpiryWatch {
    pub fn new(db: Database, notifier: Arc<dyn Notifier>, warning_days: u32) -> Self {
        Self {
            db,
            notifier,
            window_ms: i64::from(warning_days) * DAY_MS,
        }
    }

    pub async fn run(&self) -> CoreResult<ExpiryReport> {
        self.run_at(crate::now_ms()).await
    }

    #[instrument(skip(self))]
    pub async fn run_at(&self, now: i64) -> CoreResult<ExpiryReport> {
        let horizon = now + self.window_ms;
        let candidates = self
            .db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, owner_id, expires_at FROM secrets \
                     WHERE deleted_at IS NULL AND expires_at > 0 AND expires_at <= ?1 \
                     ORDER BY expires_at",
                )?;
                let rows = stmt
                    .query_map([horizon], |row| {
                        Ok(Candidate {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            owner_id: row.get(2)?,
                            expires_at: row.get(3)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut report = ExpiryReport::default();
        for secret in candidates {
            let (kind, recipient) = if secret.expires_at <= now {
                (NotificationKind::SecretExpired, Recipient::Approvers)
            } else {
                (NotificationKind::SecretExpiring, Recipient::User(secret.owner_id.clone()))
            };

            if self.sent_recently(kind, &secret.id, now).await? {
                report.suppressed += 1;
                continue;
            }

            let notification = Notification::new(kind, recipient, &secret.id)
                .with("secret_name", &secret.name)
                .with("expires_at", secret.expires_at.to_string());
            match notify::deliver(self.notifier.as_ref(), &notification).await {
                Delivery::Sent => {
                    self.log_notice(kind, &secret.id, now).await?;
                    match kind {
                        NotificationKind::SecretExpired => report.expired += 1,
                        _ => report.expiring += 1,
                    }
                }
                Delivery::Failed(_) => report.failed += 1,
            }
        }

        if report.expiring + report.expired > 0 {
            info!(
                expiring = report.expiring,
                expired = report.expired,
                "secret expiry notices sent"
            );
        } else {
            debug!(suppressed = report.suppressed, "no secret expiry notices due");
        }
        Ok(report)
    }

    async fn sent_recently(&self, kind: NotificationKind, secret_id: &str, now: i64) -> CoreResult<bool> {
        let secret_id = secret_id.to_string();
        let cutoff = now - NOTICE_INTERVAL_MS;
        let recent = self
            .db
            .execute(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM notice_log \
                     WHERE kind = ?1 AND subject_id = ?2 AND sent_at > ?3",
                    params![kind.as_str(), secret_id, cutoff],
                    |row| row.get(0),
                )?;
                Ok(count > 0)
            })
            .await?;
        Ok(recent)
    }

    async fn log_notice(&self, kind: NotificationKind, secret_id: &str, now: i64) -> CoreResult<()> {
        let secret_id = secret_id.to_string();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO notice_log (kind, subject_id, sent_at) VALUES (?1, ?2, ?3) \
                     ON CONFLICT(kind, subject_id) DO UPDATE SET sent_at = excluded.sent_at",
                    params![kind.as_str(), secret_id, now],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::notify::DeliveryError;

    #[derive(Default)]
    struct Capture {
        sent: Mutex<Vec<Notification>>,
        refuse: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl Notifier for Capture {
        async fn notify(&self, notification: &Notification) -> Result<(), DeliveryError> {
            if self.refuse.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(DeliveryError {
                    reason: "down".into(),
                });
            }
            self.sent.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    const NOW: i64 = 1_750_000_000_000;

    async fn seeded() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        db.execute(|conn| {
            for (id, expires_at, deleted_at) in [
                ("soon", NOW + 2 * DAY_MS, None),
                ("later", NOW + 30 * DAY_MS, None),
                ("past", NOW - DAY_MS, None),
                ("never", 0, None),
                ("gone", NOW + DAY_MS, Some(NOW)),
            ] {
                conn.execute(
                    "INSERT INTO secrets (id, name, kind, sealed_payload, expires_at, version, \
                     owner_id, updated_by, created_at, updated_at, deleted_at) \
                     VALUES (?1, ?1, 'token', 'x', ?2, 1, 'olga', 'olga', 0, 0, ?3)",
                    params![id, expires_at, deleted_at],
                )?;
            }
            Ok(())
        })
        .await
        .unwrap();
        db
    }

    #[tokio::test]
    async fn warns_owner_and_approvers() {
        let capture = Arc::new(Capture::default());
        let watch = ExpiryWatch::new(seeded().await, capture.clone(), 7);

        let report = watch.run_at(NOW).await.unwrap();
        assert_eq!(report.expiring, 1);
        assert_eq!(report.expired, 1);

        let sent = capture.sent.lock().unwrap();
        let soon = sent.iter().find(|n| n.related_id == "soon").unwrap();
        assert_eq!(soon.kind, NotificationKind::SecretExpiring);
        assert_eq!(soon.recipient, Recipient::User("olga".into()));
        let past = sent.iter().find(|n| n.related_id == "past").unwrap();
        assert_eq!(past.kind, NotificationKind::SecretExpired);
        assert_eq!(past.recipient, Recipient::Approvers);
    }

    #[tokio::test]
    async fn notices_repeat_at_most_daily() {
        let capture = Arc::new(Capture::default());
        let watch = ExpiryWatch::new(seeded().await, capture.clone(), 7);

        watch.run_at(NOW).await.unwrap();
        let again = watch.run_at(NOW + 3_600_000).await.unwrap();
        assert_eq!(again.suppressed, 2);
        assert_eq!(again.expiring + again.expired, 0);

        let next_day = watch.run_at(NOW + DAY_MS + 1).await.unwrap();
        assert_eq!(next_day.expiring + next_day.expired, 2);
        assert_eq!(capture.sent.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn failed_notices_are_retried() {
        let capture = Arc::new(Capture::default());
        capture.refuse.store(true, std::sync::atomic::Ordering::SeqCst);
        let watch = ExpiryWatch::new(seeded().await, capture.clone(), 7);

        assert_eq!(watch.run_at(NOW).await.unwrap().failed, 2);

        capture.refuse.store(false, std::sync::atomic::Ordering::SeqCst);
        let retry = watch.run_at(NOW + 60_000).await.unwrap();
        assert_eq!(retry.expiring + retry.expired, 2);
    }
}
