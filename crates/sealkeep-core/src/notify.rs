//! Notification delivery.
//!
//! Workflow operations emit [`Notification`]s through the [`Notifier`]
//! trait. Delivery is best-effort: a failure never rolls back the state
//! change that caused it, and is reported to the caller through
//! [`Notified::delivery`] instead.
//!
//! [`InboxNotifier`] renders each notification into a persisted inbox row;
//! [`LogNotifier`] only logs it.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use rusqlite::params;
use sealkeep_store::Database;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::CoreResult;

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    AccessRequestCreated,
    AccessRequestApproved,
    AccessRequestRejected,
    AccessRequestExpired,
    SecretExpiring,
    SecretExpired,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AccessRequestCreated => "access_request_created",
            Self::AccessRequestApproved => "access_request_approved",
            Self::AccessRequestRejected => "access_request_rejected",
            Self::AccessRequestExpired => "access_request_expired",
            Self::SecretExpiring => "secret_expiring",
            Self::SecretExpired => "secret_expired",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who a notification is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    User(String),
    /// Shared queue for access requests, used when no user holds an
    /// approving role.
    Approvers,
}

impl Recipient {
    const APPROVERS: &'static str = "@approvers";

    fn to_column(&self) -> String {
        match self {
            Self::User(id) => id.clone(),
            Self::Approvers => Self::APPROVERS.to_string(),
        }
    }

    fn from_column(value: String) -> Self {
        if value == Self::APPROVERS {
            Self::Approvers
        } else {
            Self::User(value)
        }
    }
}

/// A notification about a grant or secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub recipient: Recipient,
    /// Grant or secret id the notification is about.
    pub related_id: String,
    /// Template values such as `secret_name` or `reason`.
    pub data: BTreeMap<String, String>,
}

impl Notification {
    pub fn new(kind: NotificationKind, recipient: Recipient, related_id: impl Into<String>) -> Self {
        Self {
            kind,
            recipient,
            related_id: related_id.into(),
            data: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    fn field(&self, key: &str) -> &str {
        self.data.get(key).map(String::as_str).unwrap_or("-")
    }

    /// Human-readable `(title, body)`.
    pub fn render(&self) -> (String, String) {
        let secret = self.field("secret_name");
        match self.kind {
            NotificationKind::AccessRequestCreated => (
                "New access request".into(),
                format!(
                    "{} requested access to {secret}: {}",
                    self.field("applicant_id"),
                    self.field("reason")
                ),
            ),
            NotificationKind::AccessRequestApproved => (
                "Access request approved".into(),
                format!(
                    "Your access to {secret} is valid until {}",
                    self.field("valid_until")
                ),
            ),
            NotificationKind::AccessRequestRejected => (
                "Access request rejected".into(),
                format!("Your request for {secret} was rejected: {}", self.field("note")),
            ),
            NotificationKind::AccessRequestExpired => (
                "Access expired".into(),
                format!("Your access to {secret} has expired"),
            ),
            NotificationKind::SecretExpiring => (
                "Secret expiring soon".into(),
                format!("{secret} expires at {}", self.field("expires_at")),
            ),
            NotificationKind::SecretExpired => (
                "Secret expired".into(),
                format!("{secret} expired at {}", self.field("expires_at")),
            ),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("notification delivery failed: {reason}")]
pub struct DeliveryError {
    pub reason: String,
}

/// Outcome of the notification attached to an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum Delivery {
    Sent,
    Failed(String),
}

/// Result of an operation that also sends a notification.
#[derive(Debug, Clone)]
pub struct Notified<T> {
    pub value: T,
    pub delivery: Delivery,
}

impl<T> Notified<T> {
    pub fn delivered(&self) -> bool {
        self.delivery == Delivery::Sent
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), DeliveryError>;
}

/// Send `notification`, turning a failure into a logged [`Delivery`].
pub(crate) async fn deliver(notifier: &dyn Notifier, notification: &Notification) -> Delivery {
    match notifier.notify(notification).await {
        Ok(()) => Delivery::Sent,
        Err(err) => {
            warn!(
                kind = %notification.kind,
                related_id = %notification.related_id,
                %err,
                "notification not delivered"
            );
            Delivery::Failed(err.reason)
        }
    }
}

/// Send each of `notifications`. Failures are collected rather than
/// stopping the rest.
pub(crate) async fn deliver_all(notifier: &dyn Notifier, notifications: &[Notification]) -> Delivery {
    let mut failures = Vec::new();
    for notification in notifications {
        if let Delivery::Failed(reason) = deliver(notifier, notification).await {
            failures.push(reason);
        }
    }
    if failures.is_empty() {
        Delivery::Sent
    } else {
        Delivery::Failed(failures.join("; "))
    }
}

/// Notifier that only writes to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), DeliveryError> {
        let (title, body) = notification.render();
        info!(
            kind = %notification.kind,
            recipient = ?notification.recipient,
            related_id = %notification.related_id,
            %title,
            %body,
            "notification"
        );
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  InboxNotifier
// ═══════════════════════════════════════════════════════════════════════

/// A persisted inbox row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboxEntry {
    pub id: String,
    pub recipient: Recipient,
    pub kind: String,
    pub related_id: String,
    pub title: String,
    pub body: String,
    pub is_read: bool,
    pub created_at: i64,
    pub read_at: Option<i64>,
}

/// Notifier backed by the `notifications` table.
#[derive(Clone)]
pub struct InboxNotifier {
    db: Database,
}

impl InboxNotifier {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Newest-first entries for `recipient`.
    pub async fn inbox(&self, recipient: &Recipient, unread_only: bool) -> CoreResult<Vec<InboxEntry>> {
        let recipient = recipient.to_column();
        let entries = self
            .db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, recipient, kind, related_id, title, body, is_read, created_at, read_at \
                     FROM notifications \
                     WHERE recipient = ?1 AND (?2 = 0 OR is_read = 0) \
                     ORDER BY created_at DESC, id DESC",
                )?;
                let rows = stmt
                    .query_map(params![recipient, unread_only], |row| {
                        Ok(InboxEntry {
                            id: row.get(0)?,
                            recipient: Recipient::from_column(row.get(1)?),
                            kind: row.get(2)?,
                            related_id: row.get(3)?,
                            title: row.get(4)?,
                            body: row.get(5)?,
                            is_read: row.get(6)?,
                            created_at: row.get(7)?,
                            read_at: row.get(8)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(entries)
    }

    /// Mark an entry read. Returns whether an unread entry was updated.
    pub async fn mark_read(&self, id: &str) -> CoreResult<bool> {
        let id = id.to_string();
        let now = crate::now_ms();
        let changed = self
            .db
            .execute(move |conn| {
                Ok(conn.execute(
                    "UPDATE notifications SET is_read = 1, read_at = ?2 WHERE id = ?1 AND is_read = 0",
                    params![id, now],
                )?)
            })
            .await?;
        Ok(changed > 0)
    }

    /// Delete read entries created before `cutoff_ms`.
    #[instrument(skip(self))]
    pub async fn purge_read_before(&self, cutoff_ms: i64) -> CoreResult<usize> {
        let removed = self
            .db
            .execute(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM notifications WHERE is_read = 1 AND created_at < ?1",
                    [cutoff_ms],
                )?)
            })
            .await?;
        if removed > 0 {
            info!(removed, "purged read notifications");
        }
        Ok(removed)
    }
}

#[async_trait]
impl Notifier for InboxNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), DeliveryError> {
        let (title, body) = notification.render();
        let id = Uuid::now_v7().to_string();
        let recipient = notification.recipient.to_column();
        let kind = notification.kind.as_str();
        let related_id = notification.related_id.clone();
        let now = crate::now_ms();

        debug!(kind, recipient = %recipient, related_id = %related_id, "notification");
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO notifications (id, recipient, kind, related_id, title, body, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![id, recipient, kind, related_id, title, body, now],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| DeliveryError {
                reason: e.to_string(),
            })
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
