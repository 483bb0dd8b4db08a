//! Audit trail of secret and grant operations.
//!
//! Recording is fire-and-forget: [`AuditSink::record`] is synchronous and
//! must never fail the operation being audited. [`SqliteAuditLog`] hands
//! each event to a background task that writes the `audit_log` table.

use std::fmt;

use rusqlite::params;
use sealkeep_store::Database;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::CoreResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    SecretCreated,
    SecretRead,
    SecretUpdated,
    SecretDeleted,
    SecretRestored,
    GrantRequested,
    GrantApproved,
    GrantRejected,
    GrantRevoked,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SecretCreated => "secret.create",
            Self::SecretRead => "secret.read",
            Self::SecretUpdated => "secret.update",
            Self::SecretDeleted => "secret.delete",
            Self::SecretRestored => "secret.restore",
            Self::GrantRequested => "access_request.create",
            Self::GrantApproved => "access_request.approve",
            Self::GrantRejected => "access_request.reject",
            Self::GrantRevoked => "access_request.revoke",
        }
    }

    /// Resource family the action applies to.
    pub fn resource(&self) -> &'static str {
        match self {
            Self::SecretCreated
            | Self::SecretRead
            | Self::SecretUpdated
            | Self::SecretDeleted
            | Self::SecretRestored => "secret",
            _ => "access_request",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEvent {
    pub actor_id: String,
    pub action: AuditAction,
    pub resource_id: String,
    pub timestamp: i64,
}

impl AuditEvent {
    pub fn now(actor_id: impl Into<String>, action: AuditAction, resource_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            action,
            resource_id: resource_id.into(),
            timestamp: crate::now_ms(),
        }
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// A stored audit row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditRecord {
    pub id: i64,
    pub actor_id: String,
    pub action: String,
    pub resource: String,
    pub resource_id: String,
    pub timestamp: i64,
}

/// Filters for [`SqliteAuditLog::query`]; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub actor_id: Option<String>,
    pub action: Option<AuditAction>,
    pub resource_id: Option<String>,
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub limit: Option<u32>,
}

#[derive(Clone)]
pub struct SqliteAuditLog {
    db: Database,
}

impl SqliteAuditLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Write one event and wait for it.
    pub async fn append(&self, event: AuditEvent) -> CoreResult<()> {
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO audit_log (actor_id, action, resource, resource_id, timestamp) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        event.actor_id,
                        event.action.as_str(),
                        event.action.resource(),
                        event.resource_id,
                        event.timestamp
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Newest-first rows matching `query` (default limit 100).
    pub async fn query(&self, query: AuditQuery) -> CoreResult<Vec<AuditRecord>> {
        let records = self
            .db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, actor_id, action, resource, resource_id, timestamp FROM audit_log \
                     WHERE (?1 IS NULL OR actor_id = ?1) \
                       AND (?2 IS NULL OR action = ?2) \
                       AND (?3 IS NULL OR resource_id = ?3) \
                       AND (?4 IS NULL OR timestamp >= ?4) \
                       AND (?5 IS NULL OR timestamp < ?5) \
                     ORDER BY timestamp DESC, id DESC LIMIT ?6",
                )?;
                let rows = stmt
                    .query_map(
                        params![
                            query.actor_id,
                            query.action.map(|a| a.as_str()),
                            query.resource_id,
                            query.since,
                            query.until,
                            query.limit.unwrap_or(100)
                        ],
                        |row| {
                            Ok(AuditRecord {
                                id: row.get(0)?,
                                actor_id: row.get(1)?,
                                action: row.get(2)?,
                                resource: row.get(3)?,
                                resource_id: row.get(4)?,
                                timestamp: row.get(5)?,
                            })
                        },
                    )?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(records)
    }
}

impl AuditSink for SqliteAuditLog {
    fn record(&self, event: AuditEvent) {
        debug!(actor = %event.actor_id, action = %event.action, resource_id = %event.resource_id, "audit");
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(action = %event.action, "no runtime, audit event dropped");
            return;
        };
        let log = self.clone();
        handle.spawn(async move {
            if let Err(err) = log.append(event).await {
                warn!(%err, "failed to persist audit event");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn log() -> SqliteAuditLog {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        SqliteAuditLog::new(db)
    }

    #[tokio::test]
    async fn query_filters_and_orders() {
        let log = log().await;
        for (actor, action, id, ts) in [
            ("alice", AuditAction::SecretCreated, "s1", 10),
            ("bob", AuditAction::SecretRead, "s1", 20),
            ("alice", AuditAction::GrantApproved, "g1", 30),
        ] {
            log.append(AuditEvent {
                actor_id: actor.into(),
                action,
                resource_id: id.into(),
                timestamp: ts,
            })
            .await
            .unwrap();
        }

        let alice = log
            .query(AuditQuery {
                actor_id: Some("alice".into()),
                ..AuditQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(alice.len(), 2);
        assert_eq!(alice[0].action, "access_request.approve");
        assert_eq!(alice[0].resource, "access_request");

        let window = log
            .query(AuditQuery {
                since: Some(15),
                until: Some(30),
                ..AuditQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].actor_id, "bob");
    }

    #[tokio::test]
    async fn record_persists_in_background() {
        let log = log().await;
        log.record(AuditEvent::now("carol", AuditAction::SecretDeleted, "s9"));

        for _ in 0..50 {
            if !log.query(AuditQuery::default()).await.unwrap().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("audit event was never written");
    }
}
