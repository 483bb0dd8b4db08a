//! Append-only version history of secrets.
//!
//! Every create, update, delete and restore appends one
//! [`SecretVersion`] at `max(version) + 1` inside the transaction that
//! writes the record, so version numbers per secret are exactly `1..=N`.
//! The table itself rejects `UPDATE` and `DELETE`.

use std::fmt;
use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension, Row, params};
use sealkeep_store::{Database, StoreError};
use sealkeep_vault::Sealer;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, instrument};

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::error::{CoreError, CoreResult};
use crate::payload::SecretKind;
use crate::policy::{PolicyEngine, Requester};
use crate::secrets::{self, SecretRecord};

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
    Restored,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::Restored => "restored",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "updated" => Some(Self::Updated),
            "deleted" => Some(Self::Deleted),
            "restored" => Some(Self::Restored),
            _ => None,
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable snapshot of a secret's mutable fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecretVersion {
    pub secret_id: String,
    pub version: i64,
    pub name: String,
    pub description: String,
    pub kind: SecretKind,
    pub category: String,
    pub environment: String,
    pub tags: std::collections::BTreeSet<String>,
    #[serde(skip_serializing)]
    pub sealed_payload: String,
    pub expires_at: i64,
    pub change_kind: ChangeKind,
    pub change_reason: String,
    pub actor_id: String,
    pub captured_at: i64,
}

/// One differing metadata field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    pub field: &'static str,
    pub from: Value,
    pub to: Value,
}

/// Field-level differences between two versions. The payload is only
/// ever reported as changed or unchanged.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionDiff {
    pub secret_id: String,
    pub from_version: i64,
    pub to_version: i64,
    pub changes: Vec<FieldChange>,
    pub payload_changed: bool,
}

impl VersionDiff {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && !self.payload_changed
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Snapshot primitives
// ═══════════════════════════════════════════════════════════════════════

const VERSION_COLUMNS: &str = "secret_id, version, name, description, kind, category, environment, \
     tags, sealed_payload, expires_at, change_kind, change_reason, actor_id, captured_at";

/// `max(version) + 1` for `secret_id`, or 1 when there is no history.
pub(crate) fn next_version(conn: &Connection, secret_id: &str) -> CoreResult<i64> {
    let max: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM secret_versions WHERE secret_id = ?1",
        [secret_id],
        |row| row.get(0),
    )?;
    Ok(max + 1)
}

/// Append a snapshot of `record`'s mutable fields at `version`.
///
/// Must run inside the transaction that writes the record.
pub(crate) fn append_snapshot(
    conn: &Connection,
    record: &SecretRecord,
    version: i64,
    change: ChangeKind,
    reason: &str,
    actor: &str,
    now: i64,
) -> CoreResult<()> {
    let expected = next_version(conn, &record.id)?;
    if version != expected {
        return Err(CoreError::conflict(format!(
            "secret {} would get version {version}, next free version is {expected}",
            record.id
        )));
    }

    conn.execute(
        &format!(
            "INSERT INTO secret_versions ({VERSION_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
        ),
        params![
            record.id,
            version,
            record.name,
            record.description,
            record.kind.as_str(),
            record.category,
            record.environment,
            secrets::encode_tags(&record.tags)?,
            record.sealed_payload,
            record.expires_at,
            change.as_str(),
            reason,
            actor,
            now,
        ],
    )?;
    Ok(())
}

struct VersionRow {
    secret_id: String,
    version: i64,
    name: String,
    description: String,
    kind: String,
    category: String,
    environment: String,
    tags: String,
    sealed_payload: String,
    expires_at: i64,
    change_kind: String,
    change_reason: String,
    actor_id: String,
    captured_at: i64,
}

impl VersionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            secret_id: row.get(0)?,
            version: row.get(1)?,
            name: row.get(2)?,
            description: row.get(3)?,
            kind: row.get(4)?,
            category: row.get(5)?,
            environment: row.get(6)?,
            tags: row.get(7)?,
            sealed_payload: row.get(8)?,
            expires_at: row.get(9)?,
            change_kind: row.get(10)?,
            change_reason: row.get(11)?,
            actor_id: row.get(12)?,
            captured_at: row.get(13)?,
        })
    }

    fn into_version(self) -> CoreResult<SecretVersion> {
        let change_kind = ChangeKind::parse(&self.change_kind).ok_or_else(|| {
            CoreError::Store(StoreError::Corrupt {
                column: "change_kind",
                value: self.change_kind.clone(),
            })
        })?;
        Ok(SecretVersion {
            kind: secrets::parse_kind(&self.kind)?,
            tags: secrets::decode_tags(&self.tags)?,
            change_kind,
            secret_id: self.secret_id,
            version: self.version,
            name: self.name,
            description: self.description,
            category: self.category,
            environment: self.environment,
            sealed_payload: self.sealed_payload,
            expires_at: self.expires_at,
            change_reason: self.change_reason,
            actor_id: self.actor_id,
            captured_at: self.captured_at,
        })
    }
}

fn load_version(conn: &Connection, secret_id: &str, version: i64) -> CoreResult<SecretVersion> {
    conn.query_row(
        &format!(
            "SELECT {VERSION_COLUMNS} FROM secret_versions WHERE secret_id = ?1 AND version = ?2"
        ),
        params![secret_id, version],
        VersionRow::from_row,
    )
    .optional()?
    .ok_or_else(|| CoreError::not_found("secret version", format!("{secret_id}@{version}")))?
    .into_version()
}

fn require_secret(conn: &Connection, secret_id: &str) -> CoreResult<SecretRecord> {
    secrets::load_record(conn, secret_id)?.ok_or_else(|| CoreError::not_found("secret", secret_id))
}

/// Metadata fields compared by [`VersionHistory::diff`].
fn field_changes(a: &SecretVersion, b: &SecretVersion) -> Vec<FieldChange> {
    let pairs: [(&'static str, Value, Value); 7] = [
        ("name", json!(a.name), json!(b.name)),
        ("description", json!(a.description), json!(b.description)),
        ("kind", json!(a.kind), json!(b.kind)),
        ("category", json!(a.category), json!(b.category)),
        ("environment", json!(a.environment), json!(b.environment)),
        ("tags", json!(a.tags), json!(b.tags)),
        ("expires_at", json!(a.expires_at), json!(b.expires_at)),
    ];
    pairs
        .into_iter()
        .filter(|(_, from, to)| from != to)
        .map(|(field, from, to)| FieldChange { field, from, to })
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════
//  VersionHistory
// ═══════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct VersionHistory {
    db: Database,
    sealer: Sealer,
    policy: PolicyEngine,
    audit: Arc<dyn AuditSink>,
}

impl VersionHistory {
    pub fn new(
        db: Database,
        sealer: Sealer,
        policy: PolicyEngine,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            db,
            sealer,
            policy,
            audit,
        }
    }

    /// Every snapshot of `secret_id`, newest first. Works for deleted
    /// secrets too.
    pub async fn history(&self, requester: &Requester, secret_id: &str) -> CoreResult<Vec<SecretVersion>> {
        self.policy.authorize(requester, "secret", "read")?;
        let secret_id = secret_id.to_string();
        self.db
            .execute(move |conn| {
                let run = || -> CoreResult<Vec<SecretVersion>> {
                    require_secret(conn, &secret_id)?;
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {VERSION_COLUMNS} FROM secret_versions \
                         WHERE secret_id = ?1 ORDER BY version DESC"
                    ))?;
                    let rows = stmt.query_map([&secret_id], VersionRow::from_row)?;
                    rows.map(|row| row?.into_version()).collect()
                };
                Ok(run())
            })
            .await?
    }

    /// The snapshot at `version`.
    pub async fn history_at(
        &self,
        requester: &Requester,
        secret_id: &str,
        version: i64,
    ) -> CoreResult<SecretVersion> {
        self.policy.authorize(requester, "secret", "read")?;
        let secret_id = secret_id.to_string();
        self.db
            .execute(move |conn| Ok(load_version(conn, &secret_id, version)))
            .await?
    }

    /// Roll the live record back to `version`.
    ///
    /// The current state is first captured as a `restored` snapshot at
    /// the next version number; the live record then takes the target
    /// snapshot's fields and that same version number. A soft-deleted
    /// record comes back to life.
    #[instrument(skip(self, requester), fields(actor = %requester.id))]
    pub async fn restore(
        &self,
        requester: &Requester,
        secret_id: &str,
        version: i64,
    ) -> CoreResult<SecretRecord> {
        self.policy.authorize(requester, "secret", "update")?;

        let id = secret_id.to_string();
        let actor = requester.id.clone();
        let now = crate::now_ms();
        let record = self
            .db
            .transaction(move |tx| {
                let mut record = require_secret(tx, &id)?;
                let target = load_version(tx, &id, version)?;

                let next = next_version(tx, &id)?;
                let reason = format!("restored from version {version}");
                append_snapshot(tx, &record, next, ChangeKind::Restored, &reason, &actor, now)?;

                record.name = target.name;
                record.description = target.description;
                record.kind = target.kind;
                record.category = target.category;
                record.environment = target.environment;
                record.tags = target.tags;
                record.sealed_payload = target.sealed_payload;
                record.expires_at = target.expires_at;
                record.version = next;
                record.updated_by = actor;
                record.updated_at = now;
                record.deleted_at = None;
                secrets::write_record(tx, &record)?;
                Ok::<_, CoreError>(record)
            })
            .await?;

        self.audit
            .record(AuditEvent::now(&requester.id, AuditAction::SecretRestored, secret_id));
        info!(secret_id, from = version, version = record.version, "secret restored");
        Ok(record)
    }

    /// Differences going from `from` to `to`.
    ///
    /// Payloads are compared by plaintext, since sealing the same value
    /// twice yields different ciphertext; neither value is returned.
    pub async fn diff(
        &self,
        requester: &Requester,
        secret_id: &str,
        from: i64,
        to: i64,
    ) -> CoreResult<VersionDiff> {
        let a = self.history_at(requester, secret_id, from).await?;
        let b = self.history_at(requester, secret_id, to).await?;

        let payload_changed = if a.sealed_payload == b.sealed_payload {
            false
        } else {
            let left = self.sealer.open(&a.sealed_payload).await?;
            let right = self.sealer.open(&b.sealed_payload).await?;
            left != right
        };

        Ok(VersionDiff {
            secret_id: secret_id.to_string(),
            from_version: from,
            to_version: to,
            changes: field_changes(&a, &b),
            payload_changed,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use sealkeep_vault::LocalCipher;

    use super::*;
    use crate::grants::GrantWorkflow;
    use crate::notify::LogNotifier;
    use crate::payload::SecretPayload;
    use crate::secrets::{NewSecret, SecretStore, SecretUpdate};

    struct Discard;

    impl AuditSink for Discard {
        fn record(&self, _: AuditEvent) {}
    }

    async fn setup() -> (SecretStore, VersionHistory, Database) {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let policy = PolicyEngine::load(db.clone(), "super_admin").await.unwrap();
        let audit: Arc<dyn AuditSink> = Arc::new(Discard);
        let sealer = Sealer::local_only(LocalCipher::generate().unwrap());
        let grants = GrantWorkflow::new(db.clone(), policy.clone(), Arc::new(LogNotifier), audit.clone());
        let store = SecretStore::new(db.clone(), sealer.clone(), policy.clone(), grants, audit.clone());
        let history = VersionHistory::new(db.clone(), sealer, policy, audit);
        (store, history, db)
    }

    fn admin() -> Requester {
        Requester::new("root", "super_admin")
    }

    fn token(value: &str) -> SecretPayload {
        SecretPayload::Token {
            token: value.into(),
            token_type: None,
            refresh_token: None,
        }
    }

    #[tokio::test]
    async fn history_is_contiguous_and_descending() {
        let (store, history, _) = setup().await;
        let record = store.create(&admin(), NewSecret::new("t", token("a"))).await.unwrap();
        for n in 0..4 {
            store
                .update(
                    &admin(),
                    &record.id,
                    SecretUpdate {
                        description: Some(format!("rev {n}")),
                        ..SecretUpdate::default()
                    },
                )
                .await
                .unwrap();
        }

        let versions: Vec<i64> = history
            .history(&admin(), &record.id)
            .await
            .unwrap()
            .iter()
            .map(|v| v.version)
            .collect();
        assert_eq!(versions, vec![5, 4, 3, 2, 1]);
    }

    #[tokio::test]
    async fn restore_snapshots_current_state_first() {
        let (store, history, _) = setup().await;
        let record = store.create(&admin(), NewSecret::new("t", token("one"))).await.unwrap();
        store
            .update(
                &admin(),
                &record.id,
                SecretUpdate {
                    name: Some("renamed".into()),
                    payload: Some(token("two")),
                    ..SecretUpdate::default()
                },
            )
            .await
            .unwrap();

        let restored = history.restore(&admin(), &record.id, 1).await.unwrap();
        assert_eq!(restored.version, 3);
        assert_eq!(restored.name, "t");
        assert_eq!(store.get(&admin(), &record.id).await.unwrap().payload, token("one"));

        let v3 = history.history_at(&admin(), &record.id, 3).await.unwrap();
        assert_eq!(v3.change_kind, ChangeKind::Restored);
        assert_eq!(v3.name, "renamed");
        assert_eq!(v3.change_reason, "restored from version 1");
    }

    #[tokio::test]
    async fn restore_revives_deleted_secret() {
        let (store, history, _) = setup().await;
        let record = store.create(&admin(), NewSecret::new("t", token("x"))).await.unwrap();
        store.delete(&admin(), &record.id, None).await.unwrap();

        let restored = history.restore(&admin(), &record.id, 1).await.unwrap();
        assert!(!restored.is_deleted());
        assert_eq!(restored.version, 3);
        assert_eq!(store.describe(&admin(), &record.id).await.unwrap().version, 3);
    }

    #[tokio::test]
    async fn missing_versions_are_not_found() {
        let (store, history, _) = setup().await;
        let record = store.create(&admin(), NewSecret::new("t", token("x"))).await.unwrap();

        assert!(matches!(
            history.history_at(&admin(), &record.id, 9).await,
            Err(CoreError::NotFound { .. })
        ));
        assert!(matches!(
            history.restore(&admin(), &record.id, 9).await,
            Err(CoreError::NotFound { .. })
        ));
        assert!(matches!(
            history.history(&admin(), "nope").await,
            Err(CoreError::NotFound { .. })
        ));
        // A failed restore appends nothing.
        assert_eq!(history.history(&admin(), &record.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn diff_reports_fields_and_hides_payload() {
        let (store, history, _) = setup().await;
        let record = store.create(&admin(), NewSecret::new("t", token("same"))).await.unwrap();
        store
            .update(
                &admin(),
                &record.id,
                SecretUpdate {
                    payload: Some(token("same")),
                    environment: Some("prod".into()),
                    ..SecretUpdate::default()
                },
            )
            .await
            .unwrap();
        store
            .update(
                &admin(),
                &record.id,
                SecretUpdate {
                    payload: Some(token("different")),
                    ..SecretUpdate::default()
                },
            )
            .await
            .unwrap();

        let d12 = history.diff(&admin(), &record.id, 1, 2).await.unwrap();
        assert!(!d12.payload_changed);
        assert_eq!(d12.changes.len(), 1);
        assert_eq!(d12.changes[0].field, "environment");
        assert_eq!(d12.changes[0].to, json!("prod"));

        let d23 = history.diff(&admin(), &record.id, 2, 3).await.unwrap();
        assert!(d23.payload_changed);
        assert!(d23.changes.is_empty());
        let printed = serde_json::to_string(&d23).unwrap();
        assert!(!printed.contains("different"));

        assert!(history.diff(&admin(), &record.id, 3, 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn snapshots_are_append_only() {
        let (store, _, db) = setup().await;
        let record = store.create(&admin(), NewSecret::new("t", token("x"))).await.unwrap();
        let id = record.id.clone();
        let result = db
            .execute(move |conn| {
                Ok(conn.execute(
                    "UPDATE secret_versions SET name = 'tampered' WHERE secret_id = ?1",
                    [&id],
                ))
            })
            .await
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn concurrent_updates_never_share_a_version() {
        let (store, history, _) = setup().await;
        let record = store.create(&admin(), NewSecret::new("t", token("x"))).await.unwrap();

        let mut tasks = Vec::new();
        for n in 0..10 {
            let store = store.clone();
            let id = record.id.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .update(
                        &admin(),
                        &id,
                        SecretUpdate {
                            description: Some(format!("writer {n}")),
                            ..SecretUpdate::default()
                        },
                    )
                    .await
            }));
        }
        for task in futures::future::join_all(tasks).await {
            task.unwrap().unwrap();
        }

        let mut versions: Vec<i64> = history
            .history(&admin(), &record.id)
            .await
            .unwrap()
            .iter()
            .map(|v| v.version)
            .collect();
        versions.reverse();
        assert_eq!(versions, (1..=11).collect::<Vec<_>>());
    }
}
