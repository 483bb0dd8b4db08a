//! Secret record store.
//!
//! Owns the live [`SecretRecord`]s. Every operation is authorized by the
//! [`PolicyEngine`] first; payload reads additionally require the
//! requester to own the record or hold a currently valid access grant.
//! Every mutation seals the payload through the [`Sealer`] and appends a
//! version snapshot in the same transaction as the record write.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension, Row, params};
use sealkeep_store::{Database, StoreError};
use sealkeep_vault::Sealer;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::error::{CoreError, CoreResult};
use crate::grants::GrantWorkflow;
use crate::payload::{SecretKind, SecretPayload};
use crate::policy::{PolicyEngine, Requester};
use crate::versions::{self, ChangeKind};

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// A live secret. The payload stays sealed; see [`RevealedSecret`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecretRecord {
    pub id: String,
    pub name: String,
    pub description: String,
    pub kind: SecretKind,
    pub category: String,
    pub environment: String,
    pub tags: BTreeSet<String>,
    #[serde(skip_serializing)]
    pub sealed_payload: String,
    /// Unix milliseconds; 0 means never.
    pub expires_at: i64,
    pub version: i64,
    pub owner_id: String,
    pub updated_by: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

impl SecretRecord {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at > 0 && self.expires_at <= now
    }
}

/// Input to [`SecretStore::create`].
#[derive(Debug, Clone, Deserialize)]
pub struct NewSecret {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub expires_at: i64,
    pub payload: SecretPayload,
}

impl NewSecret {
    pub fn new(name: impl Into<String>, payload: SecretPayload) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            category: String::new(),
            environment: String::new(),
            tags: BTreeSet::new(),
            expires_at: 0,
            payload,
        }
    }
}

/// Partial update; `None` leaves a field unchanged. The kind is fixed at
/// creation, so a new payload must be of the record's kind.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SecretUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub environment: Option<String>,
    pub tags: Option<BTreeSet<String>>,
    pub expires_at: Option<i64>,
    pub payload: Option<SecretPayload>,
    /// Stored on the version snapshot.
    pub reason: Option<String>,
}

impl SecretUpdate {
    fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.category.is_none()
            && self.environment.is_none()
            && self.tags.is_none()
            && self.expires_at.is_none()
            && self.payload.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SecretFilter {
    pub kind: Option<SecretKind>,
    pub category: Option<String>,
    pub environment: Option<String>,
    pub owner_id: Option<String>,
    pub tag: Option<String>,
    /// Case-insensitive substring of the name.
    pub search: Option<String>,
    pub limit: Option<u32>,
    pub offset: u32,
}

/// A listed secret with whether the requester may read its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecretSummary {
    #[serde(flatten)]
    pub record: SecretRecord,
    pub has_access: bool,
}

/// How a payload read was authorized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "via")]
pub enum AccessVia {
    Owner,
    Grant { grant_id: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct RevealedSecret {
    pub record: SecretRecord,
    pub payload: SecretPayload,
    pub via: AccessVia,
}

// ═══════════════════════════════════════════════════════════════════════
//  Row helpers (shared with versions and grants)
// ═══════════════════════════════════════════════════════════════════════

pub(crate) const SECRET_COLUMNS: &str = "id, name, description, kind, category, environment, tags, \
     sealed_payload, expires_at, version, owner_id, updated_by, created_at, updated_at, deleted_at";

struct SecretRow {
    id: String,
    name: String,
    description: String,
    kind: String,
    category: String,
    environment: String,
    tags: String,
    sealed_payload: String,
    expires_at: i64,
    version: i64,
    owner_id: String,
    updated_by: String,
    created_at: i64,
    updated_at: i64,
    deleted_at: Option<i64>,
}

impl SecretRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            kind: row.get(3)?,
            category: row.get(4)?,
            environment: row.get(5)?,
            tags: row.get(6)?,
            sealed_payload: row.get(7)?,
            expires_at: row.get(8)?,
            version: row.get(9)?,
            owner_id: row.get(10)?,
            updated_by: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
            deleted_at: row.get(14)?,
        })
    }

    fn into_record(self) -> CoreResult<SecretRecord> {
        Ok(SecretRecord {
            kind: parse_kind(&self.kind)?,
            tags: decode_tags(&self.tags)?,
            id: self.id,
            name: self.name,
            description: self.description,
            category: self.category,
            environment: self.environment,
            sealed_payload: self.sealed_payload,
            expires_at: self.expires_at,
            version: self.version,
            owner_id: self.owner_id,
            updated_by: self.updated_by,
            created_at: self.created_at,
            updated_at: self.updated_at,
            deleted_at: self.deleted_at,
        })
    }
}

pub(crate) fn parse_kind(value: &str) -> CoreResult<SecretKind> {
    SecretKind::parse(value).ok_or_else(|| {
        CoreError::Store(StoreError::Corrupt {
            column: "kind",
            value: value.to_string(),
        })
    })
}

pub(crate) fn encode_tags(tags: &BTreeSet<String>) -> CoreResult<String> {
    Ok(serde_json::to_string(tags)?)
}

pub(crate) fn decode_tags(value: &str) -> CoreResult<BTreeSet<String>> {
    Ok(serde_json::from_str(value)?)
}

fn collect_records(
    rows: impl Iterator<Item = rusqlite::Result<SecretRow>>,
) -> CoreResult<Vec<SecretRecord>> {
    rows.map(|row| row?.into_record()).collect()
}

/// Load a record, deleted or not.
pub(crate) fn load_record(conn: &Connection, id: &str) -> CoreResult<Option<SecretRecord>> {
    conn.query_row(
        &format!("SELECT {SECRET_COLUMNS} FROM secrets WHERE id = ?1"),
        [id],
        SecretRow::from_row,
    )
    .optional()?
    .map(SecretRow::into_record)
    .transpose()
}

/// Load a record that exists and is not soft-deleted.
pub(crate) fn load_live_record(conn: &Connection, id: &str) -> CoreResult<SecretRecord> {
    match load_record(conn, id)? {
        Some(record) if !record.is_deleted() => Ok(record),
        _ => Err(CoreError::not_found("secret", id)),
    }
}

fn insert_record(conn: &Connection, record: &SecretRecord) -> CoreResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO secrets ({SECRET_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
        ),
        params![
            record.id,
            record.name,
            record.description,
            record.kind.as_str(),
            record.category,
            record.environment,
            encode_tags(&record.tags)?,
            record.sealed_payload,
            record.expires_at,
            record.version,
            record.owner_id,
            record.updated_by,
            record.created_at,
            record.updated_at,
            record.deleted_at,
        ],
    )?;
    Ok(())
}

/// Overwrite every mutable column of an existing record.
pub(crate) fn write_record(conn: &Connection, record: &SecretRecord) -> CoreResult<()> {
    let changed = conn.execute(
        "UPDATE secrets SET name = ?2, description = ?3, kind = ?4, category = ?5, \
         environment = ?6, tags = ?7, sealed_payload = ?8, expires_at = ?9, version = ?10, \
         updated_by = ?11, updated_at = ?12, deleted_at = ?13 \
         WHERE id = ?1",
        params![
            record.id,
            record.name,
            record.description,
            record.kind.as_str(),
            record.category,
            record.environment,
            encode_tags(&record.tags)?,
            record.sealed_payload,
            record.expires_at,
            record.version,
            record.updated_by,
            record.updated_at,
            record.deleted_at,
        ],
    )?;
    if changed == 0 {
        return Err(CoreError::not_found("secret", &record.id));
    }
    Ok(())
}

fn require_name(name: &str) -> CoreResult<()> {
    if name.trim().is_empty() {
        return Err(CoreError::InvalidArgument("secret name must not be empty".into()));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
//  SecretStore
// ═══════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct SecretStore {
    db: Database,
    sealer: Sealer,
    policy: PolicyEngine,
    grants: GrantWorkflow,
    audit: Arc<dyn AuditSink>,
}

impl SecretStore {
    pub fn new(
        db: Database,
        sealer: Sealer,
        policy: PolicyEngine,
        grants: GrantWorkflow,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            db,
            sealer,
            policy,
            grants,
            audit,
        }
    }

    /// Seal and store a new secret owned by the requester, as version 1.
    #[instrument(skip(self, requester, new), fields(actor = %requester.id, name = %new.name))]
    pub async fn create(&self, requester: &Requester, new: NewSecret) -> CoreResult<SecretRecord> {
        self.policy.authorize(requester, "secret", "create")?;
        require_name(&new.name)?;
        new.payload.validate()?;

        let sealed_payload = self.sealer.seal(&new.payload.to_bytes()?).await?;
        let now = crate::now_ms();
        let record = SecretRecord {
            id: Uuid::now_v7().to_string(),
            name: new.name,
            description: new.description,
            kind: new.payload.kind(),
            category: new.category,
            environment: new.environment,
            tags: new.tags,
            sealed_payload,
            expires_at: new.expires_at.max(0),
            version: 1,
            owner_id: requester.id.clone(),
            updated_by: requester.id.clone(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        let stored = record.clone();
        self.db
            .transaction(move |tx| {
                insert_record(tx, &stored)?;
                versions::append_snapshot(tx, &stored, 1, ChangeKind::Created, "", &stored.owner_id, now)
            })
            .await?;

        self.audit
            .record(AuditEvent::now(&requester.id, AuditAction::SecretCreated, &record.id));
        info!(secret_id = %record.id, kind = %record.kind, "secret created");
        Ok(record)
    }

    /// Metadata of a live secret, without the payload.
    pub async fn describe(&self, requester: &Requester, id: &str) -> CoreResult<SecretRecord> {
        self.policy.authorize(requester, "secret", "read")?;
        let id = id.to_string();
        self.db
            .execute(move |conn| Ok(load_live_record(conn, &id)))
            .await?
    }

    /// Decrypt a secret for its owner or a holder of a valid grant.
    ///
    /// A grant-backed read counts as an access on the grant. Anyone else
    /// gets `Forbidden` and no record data.
    #[instrument(skip(self, requester), fields(actor = %requester.id))]
    pub async fn get(&self, requester: &Requester, id: &str) -> CoreResult<RevealedSecret> {
        let record = self.describe(requester, id).await?;
        let now = crate::now_ms();

        let via = if record.owner_id == requester.id {
            AccessVia::Owner
        } else {
            match self.grants.valid_grant_for(id, &requester.id, now).await? {
                Some(grant) => AccessVia::Grant { grant_id: grant.id },
                None => {
                    debug!(secret_id = id, "read denied, no valid grant");
                    return Err(CoreError::forbidden(
                        "requester neither owns the secret nor holds a valid access grant",
                    ));
                }
            }
        };

        let plaintext = self.sealer.open(&record.sealed_payload).await?;
        let payload = SecretPayload::from_bytes(&plaintext)?;

        if let AccessVia::Grant { grant_id } = &via {
            if !self.grants.record_access(grant_id, now).await? {
                return Err(CoreError::forbidden(
                    "access grant ended before the read completed",
                ));
            }
        }
        self.audit
            .record(AuditEvent::now(&requester.id, AuditAction::SecretRead, id));
        debug!(secret_id = id, ?via, "secret revealed");

        Ok(RevealedSecret {
            record,
            payload,
            via,
        })
    }

    /// Live secrets matching `filter`, most recently updated first.
    pub async fn list(
        &self,
        requester: &Requester,
        filter: SecretFilter,
    ) -> CoreResult<Vec<SecretSummary>> {
        self.policy.authorize(requester, "secret", "read")?;

        let records = self
            .db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SECRET_COLUMNS} FROM secrets \
                     WHERE deleted_at IS NULL \
                       AND (?1 IS NULL OR kind = ?1) \
                       AND (?2 IS NULL OR category = ?2) \
                       AND (?3 IS NULL OR environment = ?3) \
                       AND (?4 IS NULL OR owner_id = ?4) \
                       AND (?5 IS NULL OR EXISTS (SELECT 1 FROM json_each(secrets.tags) WHERE value = ?5)) \
                       AND (?6 IS NULL OR name LIKE '%' || ?6 || '%') \
                     ORDER BY updated_at DESC, id DESC LIMIT ?7 OFFSET ?8"
                ))?;
                let rows = stmt.query_map(
                    params![
                        filter.kind.map(|k| k.as_str()),
                        filter.category,
                        filter.environment,
                        filter.owner_id,
                        filter.tag,
                        filter.search,
                        filter.limit.unwrap_or(100),
                        filter.offset
                    ],
                    SecretRow::from_row,
                )?;
                Ok(collect_records(rows))
            })
            .await??;

        let granted = self
            .grants
            .accessible_secret_ids(&requester.id, crate::now_ms())
            .await?;
        Ok(records
            .into_iter()
            .map(|record| SecretSummary {
                has_access: record.owner_id == requester.id || granted.contains(&record.id),
                record,
            })
            .collect())
    }

    /// Live secrets the requester may read through a currently valid grant.
    pub async fn list_accessible(&self, requester: &Requester) -> CoreResult<Vec<SecretRecord>> {
        self.policy.authorize(requester, "secret", "read")?;
        let ids: HashSet<String> = self
            .grants
            .accessible_secret_ids(&requester.id, crate::now_ms())
            .await?;

        self.db
            .execute(move |conn| {
                let mut records = Vec::with_capacity(ids.len());
                for id in &ids {
                    match load_record(conn, id) {
                        Ok(Some(record)) if !record.is_deleted() => records.push(record),
                        Ok(_) => {}
                        Err(err) => return Ok(Err(err)),
                    }
                }
                records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
                Ok(Ok(records))
            })
            .await?
    }

    /// Apply `change`, bump the version and snapshot the new state.
    #[instrument(skip(self, requester, change), fields(actor = %requester.id))]
    pub async fn update(
        &self,
        requester: &Requester,
        id: &str,
        change: SecretUpdate,
    ) -> CoreResult<SecretRecord> {
        self.policy.authorize(requester, "secret", "update")?;
        if change.is_empty() {
            return Err(CoreError::InvalidArgument("update changes nothing".into()));
        }
        if let Some(name) = &change.name {
            require_name(name)?;
        }

        let sealed = match &change.payload {
            Some(payload) => {
                payload.validate()?;
                Some((payload.kind(), self.sealer.seal(&payload.to_bytes()?).await?))
            }
            None => None,
        };

        let id_owned = id.to_string();
        let actor = requester.id.clone();
        let now = crate::now_ms();
        let record = self
            .db
            .transaction(move |tx| {
                let mut record = load_live_record(tx, &id_owned)?;
                if let Some((kind, sealed_payload)) = sealed {
                    if kind != record.kind {
                        return Err(CoreError::InvalidArgument(format!(
                            "payload kind {kind} does not match secret kind {}",
                            record.kind
                        )));
                    }
                    record.sealed_payload = sealed_payload;
                }
                if let Some(name) = change.name {
                    record.name = name;
                }
                if let Some(description) = change.description {
                    record.description = description;
                }
                if let Some(category) = change.category {
                    record.category = category;
                }
                if let Some(environment) = change.environment {
                    record.environment = environment;
                }
                if let Some(tags) = change.tags {
                    record.tags = tags;
                }
                if let Some(expires_at) = change.expires_at {
                    record.expires_at = expires_at.max(0);
                }

                record.version = versions::next_version(tx, &record.id)?;
                record.updated_by = actor;
                record.updated_at = now;
                write_record(tx, &record)?;
                let reason = change.reason.unwrap_or_default();
                versions::append_snapshot(
                    tx,
                    &record,
                    record.version,
                    ChangeKind::Updated,
                    &reason,
                    &record.updated_by,
                    now,
                )?;
                Ok(record)
            })
            .await?;

        self.audit
            .record(AuditEvent::now(&requester.id, AuditAction::SecretUpdated, id));
        info!(secret_id = id, version = record.version, "secret updated");
        Ok(record)
    }

    /// Soft-delete: stamp `deleted_at`, bump the version and snapshot.
    /// History stays; [`VersionHistory::restore`](crate::versions::VersionHistory::restore)
    /// revives the record.
    #[instrument(skip(self, requester), fields(actor = %requester.id))]
    pub async fn delete(
        &self,
        requester: &Requester,
        id: &str,
        reason: Option<&str>,
    ) -> CoreResult<SecretRecord> {
        self.policy.authorize(requester, "secret", "delete")?;

        let id_owned = id.to_string();
        let actor = requester.id.clone();
        let reason = reason.unwrap_or_default().to_string();
        let now = crate::now_ms();
        let record = self
            .db
            .transaction(move |tx| {
                let mut record = load_live_record(tx, &id_owned)?;
                record.version = versions::next_version(tx, &record.id)?;
                record.updated_by = actor;
                record.updated_at = now;
                record.deleted_at = Some(now);
                write_record(tx, &record)?;
                versions::append_snapshot(
                    tx,
                    &record,
                    record.version,
                    ChangeKind::Deleted,
                    &reason,
                    &record.updated_by,
                    now,
                )?;
                Ok::<_, CoreError>(record)
            })
            .await?;

        self.audit
            .record(AuditEvent::now(&requester.id, AuditAction::SecretDeleted, id));
        info!(secret_id = id, version = record.version, "secret deleted");
        Ok(record)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
