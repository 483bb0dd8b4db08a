//! Integration tests for the sealkeep-core crate.
//!
//! These drive the wired [`Sealkeep`] services end to end: secrets and their
//! history, the access grant lifecycle with notifications, live policy
//! edits, and the sweeps, against in-memory and on-disk databases.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sealkeep_core::{
    AccessVia, AuditQuery, ChangeKind, CoreError, DeliveryError, GrantStatus, InboxNotifier,
    NewSecret, Notification, NotificationKind, Notifier, Recipient, Requester, SealkeepConfig,
    Sealkeep, SecretPayload, SecretUpdate,
};
use sealkeep_store::Database;
use sealkeep_vault::{LocalCipher, Sealer};

const HOUR_MS: i64 = 3_600_000;

#[derive(Default)]
struct Outbox {
    sent: Mutex<Vec<Notification>>,
}

impl Outbox {
    fn kinds_for(&self, recipient: &Recipient) -> Vec<NotificationKind> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|n| &n.recipient == recipient)
            .map(|n| n.kind)
            .collect()
    }
}

#[async_trait]
impl Notifier for Outbox {
    async fn notify(&self, notification: &Notification) -> Result<(), DeliveryError> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

async fn vault() -> (Sealkeep, Arc<Outbox>) {
    let db = Database::open_in_memory().unwrap();
    db.run_migrations().await.unwrap();
    let sealer = Sealer::local_only(LocalCipher::generate().unwrap());
    let outbox = Arc::new(Outbox::default());
    let vault = Sealkeep::with_database(db, sealer, SealkeepConfig::default(), outbox.clone())
        .await
        .unwrap();
    (vault, outbox)
}

fn manager() -> Requester {
    Requester::new("mia", "sec_mgr")
}

fn developer() -> Requester {
    Requester::new("dan", "dev")
}

fn api_key(value: &str) -> SecretPayload {
    SecretPayload::ApiKey {
        api_key: value.into(),
        api_secret: None,
        endpoint: Some("https://billing.example.com".into()),
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Access grants
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn grant_window_opens_and_sweep_closes_it() {
    let (vault, outbox) = vault().await;
    let secret = vault
        .secrets
        .create(&manager(), NewSecret::new("billing-api", api_key("k-1")))
        .await
        .unwrap();

    let denied = vault.secrets.get(&developer(), &secret.id).await;
    assert!(matches!(denied, Err(CoreError::Forbidden { .. })));

    let grant = vault
        .grants
        .request(&developer(), &secret.id, "debug invoice export")
        .await
        .unwrap();
    assert!(grant.delivered());
    let grant = grant.into_inner();
    assert_eq!(grant.status, GrantStatus::Pending);
    assert_eq!(
        outbox.kinds_for(&Recipient::Approvers),
        vec![NotificationKind::AccessRequestCreated]
    );

    let before = sealkeep_core::now_ms();
    let approved = vault
        .grants
        .approve(&manager(), &grant.id, 24, Some("one day"))
        .await
        .unwrap()
        .into_inner();
    let approved_at = approved.valid_from.unwrap();
    assert!(approved_at >= before && approved_at <= sealkeep_core::now_ms());
    assert_eq!(approved.valid_until, Some(approved_at + 24 * HOUR_MS));
    assert!(approved.can_access_at(approved_at + 23 * HOUR_MS));
    assert!(!approved.can_access_at(approved_at + 24 * HOUR_MS));

    let revealed = vault.secrets.get(&developer(), &secret.id).await.unwrap();
    assert_eq!(revealed.payload, api_key("k-1"));
    assert_eq!(
        revealed.via,
        AccessVia::Grant {
            grant_id: grant.id.clone()
        }
    );

    let expired = vault
        .grants
        .expire_overdue_at(approved_at + 25 * HOUR_MS)
        .await
        .unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].value.status, GrantStatus::Expired);

    let dan = Recipient::User("dan".into());
    assert_eq!(
        outbox.kinds_for(&dan),
        vec![
            NotificationKind::AccessRequestApproved,
            NotificationKind::AccessRequestExpired
        ]
    );

    let after = vault.secrets.get(&developer(), &secret.id).await;
    assert!(matches!(after, Err(CoreError::Forbidden { .. })));

    let stored = vault.grants.get(&manager(), &grant.id).await.unwrap();
    assert_eq!(stored.access_count, 1);
}

#[tokio::test]
async fn terminal_grants_refuse_further_transitions() {
    let (vault, _) = vault().await;
    let secret = vault
        .secrets
        .create(&manager(), NewSecret::new("smtp", api_key("s")))
        .await
        .unwrap();

    let grant = vault
        .grants
        .request(&developer(), &secret.id, "mail relay test")
        .await
        .unwrap()
        .into_inner();
    let rejected = vault
        .grants
        .reject(&manager(), &grant.id, "use the sandbox relay")
        .await
        .unwrap()
        .into_inner();
    assert_eq!(rejected.status, GrantStatus::Rejected);
    assert_eq!(rejected.note.as_deref(), Some("use the sandbox relay"));

    let again = vault.grants.approve(&manager(), &grant.id, 1, None).await;
    assert!(matches!(again, Err(CoreError::InvalidState { .. })));
    let revoke = vault.grants.revoke(&manager(), &grant.id, "n/a").await;
    assert!(matches!(revoke, Err(CoreError::InvalidState { .. })));

    // A closed request does not block a new one.
    vault
        .grants
        .request(&developer(), &secret.id, "second try")
        .await
        .unwrap();
}

#[tokio::test]
async fn one_open_grant_per_applicant_and_secret() {
    let (vault, _) = vault().await;
    let secret = vault
        .secrets
        .create(&manager(), NewSecret::new("queue", api_key("q")))
        .await
        .unwrap();

    let first = vault
        .grants
        .request(&developer(), &secret.id, "replay dead letters")
        .await
        .unwrap()
        .into_inner();
    let dup = vault.grants.request(&developer(), &secret.id, "again").await;
    assert!(matches!(dup, Err(CoreError::Conflict { .. })));

    vault.grants.approve(&manager(), &first.id, 2, None).await.unwrap();
    let dup = vault.grants.request(&developer(), &secret.id, "more").await;
    assert!(matches!(dup, Err(CoreError::Conflict { .. })));

    let revoked = vault
        .grants
        .revoke(&manager(), &first.id, "incident closed")
        .await
        .unwrap();
    assert_eq!(revoked.status, GrantStatus::Revoked);
    assert!(!revoked.can_access());

    let denied = vault.secrets.get(&developer(), &secret.id).await;
    assert!(matches!(denied, Err(CoreError::Forbidden { .. })));
}

#[tokio::test]
async fn developers_cannot_decide_grants() {
    let (vault, _) = vault().await;
    let secret = vault
        .secrets
        .create(&manager(), NewSecret::new("cdn", api_key("c")))
        .await
        .unwrap();
    let grant = vault
        .grants
        .request(&developer(), &secret.id, "purge cache")
        .await
        .unwrap()
        .into_inner();

    let approve = vault.grants.approve(&developer(), &grant.id, 1, None).await;
    assert!(matches!(approve, Err(CoreError::Forbidden { .. })));
    let still = vault.grants.get(&manager(), &grant.id).await.unwrap();
    assert_eq!(still.status, GrantStatus::Pending);
}

#[tokio::test]
async fn approvers_find_requests_in_their_inbox() {
    let db = Database::open_in_memory().unwrap();
    db.run_migrations().await.unwrap();
    let sealer = Sealer::local_only(LocalCipher::generate().unwrap());
    let inbox = Arc::new(InboxNotifier::new(db.clone()));
    let vault = Sealkeep::with_database(db, sealer, SealkeepConfig::default(), inbox)
        .await
        .unwrap();
    vault.policy.assign_role("mia", "sec_mgr").await.unwrap();
    vault.policy.assign_role("dan", "dev").await.unwrap();

    let secret = vault
        .secrets
        .create(&manager(), NewSecret::new("warehouse", api_key("w")))
        .await
        .unwrap();
    let grant = vault
        .grants
        .request(&developer(), &secret.id, "backfill job")
        .await
        .unwrap();
    assert!(grant.delivered());

    let mia = vault
        .inbox
        .inbox(&Recipient::User("mia".into()), true)
        .await
        .unwrap();
    assert_eq!(mia.len(), 1);
    assert_eq!(mia[0].kind, "access_request_created");
    assert_eq!(mia[0].related_id, grant.value.id);

    assert!(
        vault
            .inbox
            .inbox(&Recipient::User("dan".into()), true)
            .await
            .unwrap()
            .is_empty()
    );
}

// ═══════════════════════════════════════════════════════════════════════
//  Version history
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn history_descends_and_restore_appends() {
    let (vault, _) = vault().await;
    let mgr = manager();
    let secret = vault
        .secrets
        .create(&mgr, NewSecret::new("payments", api_key("v1")))
        .await
        .unwrap();
    vault
        .secrets
        .update(
            &mgr,
            &secret.id,
            SecretUpdate {
                payload: Some(api_key("v2")),
                reason: Some("rotate".into()),
                ..SecretUpdate::default()
            },
        )
        .await
        .unwrap();
    vault
        .secrets
        .update(
            &mgr,
            &secret.id,
            SecretUpdate {
                description: Some("prod gateway".into()),
                ..SecretUpdate::default()
            },
        )
        .await
        .unwrap();

    let history = vault.versions.history(&mgr, &secret.id).await.unwrap();
    let numbers: Vec<i64> = history.iter().map(|v| v.version).collect();
    assert_eq!(numbers, vec![3, 2, 1]);
    assert_eq!(history[2].change_kind, ChangeKind::Created);

    let restored = vault.versions.restore(&mgr, &secret.id, 1).await.unwrap();
    assert_eq!(restored.version, 4);
    assert_eq!(restored.description, "");

    let v4 = vault.versions.history_at(&mgr, &secret.id, 4).await.unwrap();
    assert_eq!(v4.change_kind, ChangeKind::Restored);
    assert_eq!(v4.description, "prod gateway");

    let live = vault.secrets.get(&mgr, &secret.id).await.unwrap();
    assert_eq!(live.payload, api_key("v1"));
    assert_eq!(live.via, AccessVia::Owner);

    let diff = vault.versions.diff(&mgr, &secret.id, 1, 3).await.unwrap();
    assert!(diff.payload_changed);
    assert_eq!(diff.changes.len(), 1);
    assert_eq!(diff.changes[0].field, "description");
    let rendered = serde_json::to_string(&diff).unwrap();
    assert!(!rendered.contains("\"v1\"") && !rendered.contains("\"v2\""));
}

#[tokio::test]
async fn versions_stay_contiguous_through_delete_and_restore() {
    let (vault, _) = vault().await;
    let mgr = manager();
    let secret = vault
        .secrets
        .create(&mgr, NewSecret::new("ledger", api_key("l")))
        .await
        .unwrap();

    let deleted = vault
        .secrets
        .delete(&mgr, &secret.id, Some("decommissioned"))
        .await
        .unwrap();
    assert!(deleted.is_deleted());
    assert!(matches!(
        vault.secrets.describe(&mgr, &secret.id).await,
        Err(CoreError::NotFound { .. })
    ));

    let revived = vault.versions.restore(&mgr, &secret.id, 1).await.unwrap();
    assert!(!revived.is_deleted());

    let history = vault.versions.history(&mgr, &secret.id).await.unwrap();
    let kinds: Vec<ChangeKind> = history.iter().map(|v| v.change_kind).collect();
    assert_eq!(
        kinds,
        vec![ChangeKind::Restored, ChangeKind::Deleted, ChangeKind::Created]
    );
    for (expected, version) in (1..=3).rev().zip(&history) {
        assert_eq!(version.version, expected);
    }

    let missing = vault.versions.restore(&mgr, &secret.id, 9).await;
    assert!(matches!(missing, Err(CoreError::NotFound { .. })));
}

// ═══════════════════════════════════════════════════════════════════════
//  Policy
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn live_policy_edits_take_effect_immediately() {
    let (vault, _) = vault().await;
    let policy = &vault.policy;

    assert!(!policy.check("contractor", "secret", "read"));
    policy.inherit("contractor", "dev").await.unwrap();
    assert!(policy.check("contractor", "secret", "read"));
    assert!(!policy.check("contractor", "secret", "create"));

    policy.add_rule("contractor", "secret", "create").await.unwrap();
    let contractor = Requester::new("cleo", "contractor");
    let secret = vault
        .secrets
        .create(&contractor, NewSecret::new("staging-db", api_key("st")))
        .await
        .unwrap();
    assert_eq!(secret.owner_id, "cleo");

    policy.disinherit("contractor", "dev").await.unwrap();
    assert!(!policy.check("contractor", "secret", "read"));
    let blocked = vault.secrets.describe(&contractor, &secret.id).await;
    assert!(matches!(blocked, Err(CoreError::Forbidden { .. })));
}

#[tokio::test]
async fn inheritance_cycles_are_rejected() {
    let (vault, _) = vault().await;
    let policy = &vault.policy;

    policy.inherit("lead", "sec_mgr").await.unwrap();
    let cycle = policy.inherit("dev", "lead").await;
    assert!(matches!(cycle, Err(CoreError::InvalidArgument(_))));
    assert!(!policy.check("dev", "secret", "create"));

    let dup = policy.inherit("lead", "sec_mgr").await;
    assert!(matches!(dup, Err(CoreError::Conflict { .. })));
}

#[tokio::test]
async fn super_role_passes_policy_but_not_payload_checks() {
    let (vault, _) = vault().await;
    let root = Requester::new("root", "super_admin");
    let secret = vault
        .secrets
        .create(&manager(), NewSecret::new("hsm-pin", api_key("pin")))
        .await
        .unwrap();

    assert!(vault.policy.check("super_admin", "anything", "at_all"));
    vault.secrets.describe(&root, &secret.id).await.unwrap();
    let read = vault.secrets.get(&root, &secret.id).await;
    match read {
        Err(err @ CoreError::Forbidden { .. }) => assert!(!err.to_string().contains("pin")),
        other => panic!("expected Forbidden, got {other:?}"),
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Sweeps and audit
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn sweep_warns_owner_of_expiring_secret() {
    let (vault, outbox) = vault().await;
    let mut new = NewSecret::new("tls-edge", api_key("t"));
    new.expires_at = sealkeep_core::now_ms() + 2 * 24 * HOUR_MS;
    vault.secrets.create(&manager(), new).await.unwrap();

    let report = vault.sweeper().run_once().await.unwrap();
    assert_eq!(report.secrets.expiring, 1);
    assert_eq!(
        outbox.kinds_for(&Recipient::User("mia".into())),
        vec![NotificationKind::SecretExpiring]
    );

    let again = vault.sweeper().run_once().await.unwrap();
    assert_eq!(again.secrets.suppressed, 1);
}

#[tokio::test]
async fn reads_are_audited() {
    let (vault, _) = vault().await;
    let secret = vault
        .secrets
        .create(&manager(), NewSecret::new("vpn", api_key("v")))
        .await
        .unwrap();
    vault.secrets.get(&manager(), &secret.id).await.unwrap();

    let query = AuditQuery {
        resource_id: Some(secret.id.clone()),
        ..AuditQuery::default()
    };
    let mut records = Vec::new();
    for _ in 0..50 {
        records = vault.audit.query(query.clone()).await.unwrap();
        if records.len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let actions: Vec<&str> = records.iter().map(|r| r.action.as_str()).collect();
    assert!(actions.contains(&"secret.create"));
    assert!(actions.contains(&"secret.read"));
}

#[tokio::test]
async fn open_on_disk_persists_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = SealkeepConfig::default();
    config.database.path = dir.path().join("nested").join("vault.db");
    config.security.encryption_key = "0123456789abcdef0123456789abcdef".into();

    let id = {
        let vault = Sealkeep::open(config.clone()).await.unwrap();
        vault
            .secrets
            .create(&manager(), NewSecret::new("persisted", api_key("disk")))
            .await
            .unwrap()
            .id
    };

    let vault = Sealkeep::open(config).await.unwrap();
    let revealed = vault.secrets.get(&manager(), &id).await.unwrap();
    assert_eq!(revealed.payload, api_key("disk"));
    assert!(vault.policy.check("sec_mgr", "secret", "create"));
}

#[tokio::test]
async fn open_rejects_short_key() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = SealkeepConfig::default();
    config.database.path = dir.path().join("vault.db");
    config.security.encryption_key = "too-short".into();

    let result = Sealkeep::open(config).await;
    assert!(matches!(result, Err(CoreError::Config(_))));
}
