//! Access grant workflow.
//!
//! ```text
//!            approve            revoke
//! pending ───────────▶ approved ────────▶ revoked
//!    │                    │
//!    │ reject             │ expiry sweep
//!    ▼                    ▼
//! rejected             expired
//! ```
//!
//! `rejected`, `revoked` and `expired` are terminal. At most one grant per
//! (secret, applicant) may be `pending` or `approved` at a time; an
//! approved grant whose window has elapsed keeps blocking new requests
//! until the sweep marks it expired.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension, Row, params};
use sealkeep_store::{Database, StoreError};
use serde::Serialize;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::error::{CoreError, CoreResult};
use crate::notify::{self, Notification, NotificationKind, Notified, Notifier, Recipient};
use crate::policy::{PolicyEngine, Requester};
use crate::secrets;

const HOUR_MS: i64 = 3_600_000;

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    Revoked,
}

impl GrantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "expired" => Some(Self::Expired),
            "revoked" => Some(Self::Revoked),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Expired | Self::Revoked)
    }
}

impl fmt::Display for GrantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessGrant {
    pub id: String,
    pub secret_id: String,
    pub applicant_id: String,
    pub reason: String,
    pub status: GrantStatus,
    pub approver_id: Option<String>,
    pub decided_at: Option<i64>,
    /// Inclusive start of the validity window, set on approval.
    pub valid_from: Option<i64>,
    /// Exclusive end of the validity window, set on approval.
    pub valid_until: Option<i64>,
    /// Approval note, rejection reason or revocation reason.
    pub note: Option<String>,
    pub access_count: i64,
    pub last_accessed_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl AccessGrant {
    /// Whether the grant allows reading its secret at `now` (Unix ms).
    pub fn can_access_at(&self, now: i64) -> bool {
        match (self.status, self.valid_from, self.valid_until) {
            (GrantStatus::Approved, Some(from), Some(until)) => from <= now && now < until,
            _ => false,
        }
    }

    pub fn can_access(&self) -> bool {
        self.can_access_at(crate::now_ms())
    }
}

#[derive(Debug, Clone, Default)]
pub struct GrantFilter {
    pub status: Option<GrantStatus>,
    pub applicant_id: Option<String>,
    pub secret_id: Option<String>,
    pub limit: Option<u32>,
    pub offset: u32,
}

// ═══════════════════════════════════════════════════════════════════════
//  Row helpers
// ═══════════════════════════════════════════════════════════════════════

const GRANT_COLUMNS: &str = "id, secret_id, applicant_id, reason, status, approver_id, decided_at, \
     valid_from, valid_until, note, access_count, last_accessed_at, created_at, updated_at";

struct GrantRow {
    id: String,
    secret_id: String,
    applicant_id: String,
    reason: String,
    status: String,
    approver_id: Option<String>,
    decided_at: Option<i64>,
    valid_from: Option<i64>,
    valid_until: Option<i64>,
    note: Option<String>,
    access_count: i64,
    last_accessed_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl GrantRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            secret_id: row.get(1)?,
            applicant_id: row.get(2)?,
            reason: row.get(3)?,
            status: row.get(4)?,
            approver_id: row.get(5)?,
            decided_at: row.get(6)?,
            valid_from: row.get(7)?,
            valid_until: row.get(8)?,
            note: row.get(9)?,
            access_count: row.get(10)?,
            last_accessed_at: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    fn into_grant(self) -> CoreResult<AccessGrant> {
        let status = GrantStatus::parse(&self.status).ok_or_else(|| {
            CoreError::Store(StoreError::Corrupt {
                column: "status",
                value: self.status.clone(),
            })
        })?;
        Ok(AccessGrant {
            id: self.id,
            secret_id: self.secret_id,
            applicant_id: self.applicant_id,
            reason: self.reason,
            status,
            approver_id: self.approver_id,
            decided_at: self.decided_at,
            valid_from: self.valid_from,
            valid_until: self.valid_until,
            note: self.note,
            access_count: self.access_count,
            last_accessed_at: self.last_accessed_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn load_grant(conn: &Connection, id: &str) -> CoreResult<AccessGrant> {
    conn.query_row(
        &format!("SELECT {GRANT_COLUMNS} FROM access_grants WHERE id = ?1"),
        [id],
        GrantRow::from_row,
    )
    .optional()?
    .ok_or_else(|| CoreError::not_found("access grant", id))?
    .into_grant()
}

fn secret_name(conn: &Connection, secret_id: &str) -> CoreResult<String> {
    Ok(conn
        .query_row("SELECT name FROM secrets WHERE id = ?1", [secret_id], |row| {
            row.get::<_, String>(0)
        })
        .optional()?
        .unwrap_or_default())
}

fn require_status(grant: &AccessGrant, expected: GrantStatus, action: &'static str) -> CoreResult<()> {
    if grant.status != expected {
        return Err(CoreError::InvalidState {
            entity: "access grant",
            id: grant.id.clone(),
            status: grant.status.to_string(),
            action,
        });
    }
    Ok(())
}

fn format_ms(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| ms.to_string())
}

// ═══════════════════════════════════════════════════════════════════════
//  GrantWorkflow
// ═══════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct GrantWorkflow {
    db: Database,
    policy: PolicyEngine,
    notifier: Arc<dyn Notifier>,
    audit: Arc<dyn AuditSink>,
}

impl GrantWorkflow {
    pub fn new(
        db: Database,
        policy: PolicyEngine,
        notifier: Arc<dyn Notifier>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            db,
            policy,
            notifier,
            audit,
        }
    }

    /// Ask for access to a live secret. Approvers are notified.
    ///
    /// Fails with `Conflict` while the requester already has a pending or
    /// approved grant on the same secret.
    #[instrument(skip(self, requester, reason), fields(applicant = %requester.id))]
    pub async fn request(
        &self,
        requester: &Requester,
        secret_id: &str,
        reason: &str,
    ) -> CoreResult<Notified<AccessGrant>> {
        if reason.trim().is_empty() {
            return Err(CoreError::InvalidArgument("request reason must not be empty".into()));
        }

        let now = crate::now_ms();
        let grant = AccessGrant {
            id: Uuid::now_v7().to_string(),
            secret_id: secret_id.to_string(),
            applicant_id: requester.id.clone(),
            reason: reason.to_string(),
            status: GrantStatus::Pending,
            approver_id: None,
            decided_at: None,
            valid_from: None,
            valid_until: None,
            note: None,
            access_count: 0,
            last_accessed_at: None,
            created_at: now,
            updated_at: now,
        };

        let stored = grant.clone();
        let name = self
            .db
            .transaction(move |tx| {
                let secret = secrets::load_live_record(tx, &stored.secret_id)?;
                let open: Option<String> = tx
                    .query_row(
                        "SELECT status FROM access_grants \
                         WHERE secret_id = ?1 AND applicant_id = ?2 \
                           AND status IN ('pending', 'approved') LIMIT 1",
                        params![stored.secret_id, stored.applicant_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(status) = open {
                    return Err(CoreError::conflict(format!(
                        "applicant {} already has a {status} grant for secret {}",
                        stored.applicant_id, stored.secret_id
                    )));
                }

                tx.execute(
                    &format!(
                        "INSERT INTO access_grants ({GRANT_COLUMNS}) \
                         VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL, NULL, NULL, NULL, 0, NULL, ?6, ?6)"
                    ),
                    params![
                        stored.id,
                        stored.secret_id,
                        stored.applicant_id,
                        stored.reason,
                        stored.status.as_str(),
                        stored.created_at,
                    ],
                )
                .map_err(|e| match StoreError::from(e) {
                    err if err.is_constraint_violation() => {
                        CoreError::conflict("an open grant for this secret already exists")
                    }
                    err => CoreError::Store(err),
                })?;
                Ok(secret.name)
            })
            .await?;

        self.audit
            .record(AuditEvent::now(&requester.id, AuditAction::GrantRequested, &grant.id));
        info!(grant_id = %grant.id, secret_id, "access requested");

        let mut recipients: Vec<Recipient> = self
            .policy
            .users_permitted("access_request", "approve")
            .into_iter()
            .map(Recipient::User)
            .collect();
        if recipients.is_empty() {
            recipients.push(Recipient::Approvers);
        }
        let notifications: Vec<Notification> = recipients
            .into_iter()
            .map(|recipient| {
                Notification::new(NotificationKind::AccessRequestCreated, recipient, &grant.id)
                    .with("secret_name", name.as_str())
                    .with("applicant_id", &grant.applicant_id)
                    .with("reason", &grant.reason)
            })
            .collect();
        let delivery = notify::deliver_all(self.notifier.as_ref(), &notifications).await;
        Ok(Notified {
            value: grant,
            delivery,
        })
    }

    /// Approve a pending grant for `hours` from now. The applicant is
    /// notified.
    pub async fn approve(
        &self,
        requester: &Requester,
        grant_id: &str,
        hours: u32,
        note: Option<&str>,
    ) -> CoreResult<Notified<AccessGrant>> {
        self.approve_at(requester, grant_id, hours, note, crate::now_ms())
            .await
    }

    #[instrument(skip(self, requester, note), fields(approver = %requester.id))]
    pub(crate) async fn approve_at(
        &self,
        requester: &Requester,
        grant_id: &str,
        hours: u32,
        note: Option<&str>,
        now: i64,
    ) -> CoreResult<Notified<AccessGrant>> {
        self.policy.authorize(requester, "access_request", "approve")?;
        if hours == 0 {
            return Err(CoreError::InvalidArgument(
                "validity duration must be at least one hour".into(),
            ));
        }

        let id = grant_id.to_string();
        let approver = requester.id.clone();
        let note = note.map(str::to_string);
        let valid_until = now + i64::from(hours) * HOUR_MS;
        let (grant, name) = self
            .db
            .transaction(move |tx| {
                let grant = load_grant(tx, &id)?;
                require_status(&grant, GrantStatus::Pending, "approve")?;
                tx.execute(
                    "UPDATE access_grants SET status = 'approved', approver_id = ?2, decided_at = ?3, \
                     valid_from = ?3, valid_until = ?4, note = ?5, updated_at = ?3 \
                     WHERE id = ?1 AND status = 'pending'",
                    params![id, approver, now, valid_until, note],
                )?;
                Ok::<_, CoreError>((load_grant(tx, &id)?, secret_name(tx, &grant.secret_id)?))
            })
            .await?;

        self.audit
            .record(AuditEvent::now(&requester.id, AuditAction::GrantApproved, grant_id));
        info!(grant_id, hours, valid_until, "access approved");

        let notification = Notification::new(
            NotificationKind::AccessRequestApproved,
            Recipient::User(grant.applicant_id.clone()),
            &grant.id,
        )
        .with("secret_name", name)
        .with("valid_until", format_ms(valid_until));
        let delivery = notify::deliver(self.notifier.as_ref(), &notification).await;
        Ok(Notified {
            value: grant,
            delivery,
        })
    }

    /// Reject a pending grant. The applicant is notified.
    #[instrument(skip(self, requester, reason), fields(approver = %requester.id))]
    pub async fn reject(
        &self,
        requester: &Requester,
        grant_id: &str,
        reason: &str,
    ) -> CoreResult<Notified<AccessGrant>> {
        self.policy.authorize(requester, "access_request", "reject")?;

        let id = grant_id.to_string();
        let approver = requester.id.clone();
        let reason = reason.to_string();
        let now = crate::now_ms();
        let (grant, name) = self
            .db
            .transaction(move |tx| {
                let grant = load_grant(tx, &id)?;
                require_status(&grant, GrantStatus::Pending, "reject")?;
                tx.execute(
                    "UPDATE access_grants SET status = 'rejected', approver_id = ?2, decided_at = ?3, \
                     note = ?4, updated_at = ?3 \
                     WHERE id = ?1 AND status = 'pending'",
                    params![id, approver, now, reason],
                )?;
                Ok::<_, CoreError>((load_grant(tx, &id)?, secret_name(tx, &grant.secret_id)?))
            })
            .await?;

        self.audit
            .record(AuditEvent::now(&requester.id, AuditAction::GrantRejected, grant_id));
        info!(grant_id, "access rejected");

        let notification = Notification::new(
            NotificationKind::AccessRequestRejected,
            Recipient::User(grant.applicant_id.clone()),
            &grant.id,
        )
        .with("secret_name", name)
        .with("note", grant.note.clone().unwrap_or_default());
        let delivery = notify::deliver(self.notifier.as_ref(), &notification).await;
        Ok(Notified {
            value: grant,
            delivery,
        })
    }

    /// Revoke an approved grant. The validity window is left as it was;
    /// only the status changes, and `reason` replaces the note.
    #[instrument(skip(self, requester, reason), fields(actor = %requester.id))]
    pub async fn revoke(
        &self,
        requester: &Requester,
        grant_id: &str,
        reason: &str,
    ) -> CoreResult<AccessGrant> {
        self.policy.authorize(requester, "access_request", "approve")?;

        let id = grant_id.to_string();
        let reason = reason.to_string();
        let now = crate::now_ms();
        let grant = self
            .db
            .transaction(move |tx| {
                let grant = load_grant(tx, &id)?;
                require_status(&grant, GrantStatus::Approved, "revoke")?;
                tx.execute(
                    "UPDATE access_grants SET status = 'revoked', note = ?2, updated_at = ?3 \
                     WHERE id = ?1 AND status = 'approved'",
                    params![id, reason, now],
                )?;
                load_grant(tx, &id)
            })
            .await?;

        self.audit
            .record(AuditEvent::now(&requester.id, AuditAction::GrantRevoked, grant_id));
        info!(grant_id, "access revoked");
        Ok(grant)
    }

    /// A single grant, visible to its applicant and to approvers.
    pub async fn get(&self, requester: &Requester, grant_id: &str) -> CoreResult<AccessGrant> {
        self.policy.authorize(requester, "access_request", "read")?;
        let id = grant_id.to_string();
        let grant = self
            .db
            .execute(move |conn| Ok(load_grant(conn, &id)))
            .await??;
        if grant.applicant_id != requester.id && !self.is_approver(requester) {
            return Err(CoreError::forbidden("grant belongs to another applicant"));
        }
        Ok(grant)
    }

    /// Grants matching `filter`, newest first. Requesters who cannot
    /// approve only ever see their own.
    pub async fn list(&self, requester: &Requester, mut filter: GrantFilter) -> CoreResult<Vec<AccessGrant>> {
        self.policy.authorize(requester, "access_request", "read")?;
        if !self.is_approver(requester) {
            filter.applicant_id = Some(requester.id.clone());
        }

        self.db
            .execute(move |conn| {
                let run = || -> CoreResult<Vec<AccessGrant>> {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {GRANT_COLUMNS} FROM access_grants \
                         WHERE (?1 IS NULL OR status = ?1) \
                           AND (?2 IS NULL OR applicant_id = ?2) \
                           AND (?3 IS NULL OR secret_id = ?3) \
                         ORDER BY created_at DESC, id DESC LIMIT ?4 OFFSET ?5"
                    ))?;
                    let rows = stmt.query_map(
                        params![
                            filter.status.map(|s| s.as_str()),
                            filter.applicant_id,
                            filter.secret_id,
                            filter.limit.unwrap_or(50),
                            filter.offset
                        ],
                        GrantRow::from_row,
                    )?;
                    rows.map(|row| row?.into_grant()).collect()
                };
                Ok(run())
            })
            .await?
    }

    /// The applicant's grant on `secret_id` that is valid at `now`, if any.
    pub async fn valid_grant_for(
        &self,
        secret_id: &str,
        applicant_id: &str,
        now: i64,
    ) -> CoreResult<Option<AccessGrant>> {
        let (secret_id, applicant_id) = (secret_id.to_string(), applicant_id.to_string());
        let grant = self
            .db
            .execute(move |conn| {
                let row = conn
                    .query_row(
                        &format!(
                            "SELECT {GRANT_COLUMNS} FROM access_grants \
                             WHERE secret_id = ?1 AND applicant_id = ?2 AND status = 'approved' \
                             ORDER BY created_at DESC LIMIT 1"
                        ),
                        params![secret_id, applicant_id],
                        GrantRow::from_row,
                    )
                    .optional()?;
                Ok(row.map(GrantRow::into_grant).transpose())
            })
            .await??;
        Ok(grant.filter(|g| g.can_access_at(now)))
    }

    /// Ids of secrets `applicant_id` may read through a grant at `now`.
    pub async fn accessible_secret_ids(&self, applicant_id: &str, now: i64) -> CoreResult<HashSet<String>> {
        let applicant_id = applicant_id.to_string();
        let ids = self
            .db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT secret_id FROM access_grants \
                     WHERE applicant_id = ?1 AND status = 'approved' \
                       AND valid_from <= ?2 AND ?2 < valid_until",
                )?;
                let ids = stmt
                    .query_map(params![applicant_id, now], |row| row.get(0))?
                    .collect::<Result<HashSet<String>, _>>()?;
                Ok(ids)
            })
            .await?;
        Ok(ids)
    }

    /// Count one payload read on `grant_id`.
    ///
    /// Only a grant that is still approved and inside its window at `now`
    /// is counted. Returns `false` when the grant no longer qualifies, for
    /// example because it was revoked after the caller checked it.
    pub async fn record_access(&self, grant_id: &str, now: i64) -> CoreResult<bool> {
        let id = grant_id.to_string();
        let changed = self
            .db
            .execute(move |conn| {
                let changed = conn.execute(
                    "UPDATE access_grants SET access_count = access_count + 1, last_accessed_at = ?2 \
                     WHERE id = ?1 AND status = 'approved' \
                       AND valid_from <= ?2 AND ?2 < valid_until",
                    params![id, now],
                )?;
                Ok(changed)
            })
            .await?;
        if changed == 0 {
            debug!(grant_id, "grant no longer valid, access not recorded");
            return Ok(false);
        }
        debug!(grant_id, "grant access recorded");
        Ok(true)
    }

    /// Flip every approved grant whose window has closed to `expired` and
    /// notify each applicant once.
    pub async fn expire_overdue(&self) -> CoreResult<Vec<Notified<AccessGrant>>> {
        self.expire_overdue_at(crate::now_ms()).await
    }

    /// [`expire_overdue`](Self::expire_overdue) with an explicit clock.
    #[instrument(skip(self))]
    pub async fn expire_overdue_at(&self, now: i64) -> CoreResult<Vec<Notified<AccessGrant>>> {
        let expired = self
            .db
            .transaction(move |tx| {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {GRANT_COLUMNS} FROM access_grants \
                     WHERE status = 'approved' AND valid_until <= ?1 ORDER BY valid_until"
                ))?;
                let due = stmt
                    .query_map([now], GrantRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                drop(stmt);

                tx.execute(
                    "UPDATE access_grants SET status = 'expired', updated_at = ?1 \
                     WHERE status = 'approved' AND valid_until <= ?1",
                    [now],
                )?;

                let mut expired = Vec::with_capacity(due.len());
                for row in due {
                    let mut grant = row.into_grant()?;
                    grant.status = GrantStatus::Expired;
                    grant.updated_at = now;
                    let name = secret_name(tx, &grant.secret_id)?;
                    expired.push((grant, name));
                }
                Ok::<_, CoreError>(expired)
            })
            .await?;

        let mut results = Vec::with_capacity(expired.len());
        for (grant, name) in expired {
            info!(grant_id = %grant.id, applicant = %grant.applicant_id, "access grant expired");
            let notification = Notification::new(
                NotificationKind::AccessRequestExpired,
                Recipient::User(grant.applicant_id.clone()),
                &grant.id,
            )
            .with("secret_name", name);
            let delivery = notify::deliver(self.notifier.as_ref(), &notification).await;
            results.push(Notified {
                value: grant,
                delivery,
            });
        }
        Ok(results)
    }

    fn is_approver(&self, requester: &Requester) -> bool {
        self.policy
            .check(&requester.role, "access_request", "approve")
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
