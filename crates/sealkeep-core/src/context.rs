//! Service wiring.
//!
//! [`Sealkeep`] owns one database handle, one sealer and one policy engine
//! and hands clones of them to every service. Everything is cheap to clone.

use std::sync::Arc;

use sealkeep_store::Database;
use sealkeep_vault::Sealer;
use tracing::info;

use crate::audit::{AuditSink, SqliteAuditLog};
use crate::config::SealkeepConfig;
use crate::error::{CoreError, CoreResult};
use crate::expiry::ExpiryWatch;
use crate::grants::GrantWorkflow;
use crate::notify::{InboxNotifier, Notifier};
use crate::policy::PolicyEngine;
use crate::secrets::SecretStore;
use crate::sweeper::Sweeper;
use crate::versions::VersionHistory;

#[derive(Clone)]
pub struct Sealkeep {
    pub db: Database,
    pub sealer: Sealer,
    pub policy: PolicyEngine,
    pub grants: GrantWorkflow,
    pub secrets: SecretStore,
    pub versions: VersionHistory,
    pub inbox: InboxNotifier,
    pub audit: SqliteAuditLog,
    pub expiry: ExpiryWatch,
    config: SealkeepConfig,
}

impl Sealkeep {
    /// Open the database named by `config`, run migrations, build the
    /// sealer and load policy. Notifications go to the database inbox.
    pub async fn open(config: SealkeepConfig) -> CoreResult<Self> {
        config.validate()?;

        let path = config.database.path.clone();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                CoreError::Config(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let db = Database::open_and_migrate(path.clone()).await?;
        info!(path = %path.display(), "store initialized");

        let sealer = Sealer::from_settings(
            config.security.encryption_key.as_bytes(),
            &config.security.transit,
        )?;

        let inbox = InboxNotifier::new(db.clone());
        Self::with_database(db, sealer, config, Arc::new(inbox)).await
    }

    /// Wire services over an already migrated database with a caller
    /// supplied notifier.
    pub async fn with_database(
        db: Database,
        sealer: Sealer,
        config: SealkeepConfig,
        notifier: Arc<dyn Notifier>,
    ) -> CoreResult<Self> {
        let policy = PolicyEngine::load(db.clone(), &config.policy.super_role).await?;
        let audit = SqliteAuditLog::new(db.clone());
        let sink: Arc<dyn AuditSink> = Arc::new(audit.clone());

        let grants = GrantWorkflow::new(db.clone(), policy.clone(), notifier.clone(), sink.clone());
        let secrets = SecretStore::new(
            db.clone(),
            sealer.clone(),
            policy.clone(),
            grants.clone(),
            sink.clone(),
        );
        let versions = VersionHistory::new(db.clone(), sealer.clone(), policy.clone(), sink);
        let expiry = ExpiryWatch::new(db.clone(), notifier, config.sweeps.expiry_warning_days);
        let inbox = InboxNotifier::new(db.clone());

        info!(super_role = %config.policy.super_role, "sealkeep services ready");
        Ok(Self {
            db,
            sealer,
            policy,
            grants,
            secrets,
            versions,
            inbox,
            audit,
            expiry,
            config,
        })
    }

    pub fn config(&self) -> &SealkeepConfig {
        &self.config
    }

    /// Background sweeps over these services, not yet started.
    pub fn sweeper(&self) -> Sweeper {
        Sweeper::new(
            self.grants.clone(),
            self.expiry.clone(),
            self.inbox.clone(),
            self.config.sweeps.clone(),
        )
    }
}
