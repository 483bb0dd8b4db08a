//! Periodic background sweeps.
//!
//! Three independent loops share one [`CancellationToken`]:
//!
//! | sweep                  | default period | work                                      |
//! |------------------------|----------------|-------------------------------------------|
//! | grant expiry           | 1 h            | approved grants past `valid_until` expire  |
//! | secret expiry warnings | 6 h            | [`ExpiryWatch`] notices                    |
//! | notification cleanup   | 24 h           | read inbox entries past retention removed  |
//!
//! Each loop runs once immediately, then on its period. A failing pass is
//! logged and the loop keeps going.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::SweepConfig;
use crate::error::CoreResult;
use crate::expiry::{ExpiryReport, ExpiryWatch};
use crate::grants::GrantWorkflow;
use crate::notify::InboxNotifier;

const DAY_MS: i64 = 24 * 3_600_000;

/// Totals from [`Sweeper::run_once`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub grants_expired: usize,
    pub secrets: ExpiryReport,
    pub notifications_purged: usize,
}

#[derive(Clone)]
pub struct Sweeper {
    grants: GrantWorkflow,
    expiry: ExpiryWatch,
    inbox: InboxNotifier,
    config: SweepConfig,
}

impl Sweeper {
    pub fn new(
        grants: GrantWorkflow,
        expiry: ExpiryWatch,
        inbox: InboxNotifier,
        config: SweepConfig,
    ) -> Self {
        Self {
            grants,
            expiry,
            inbox,
            config,
        }
    }

    pub async fn expire_grants(&self) -> CoreResult<usize> {
        let expired = self.grants.expire_overdue().await?;
        let undelivered = expired.iter().filter(|n| !n.delivered()).count();
        if undelivered > 0 {
            warn!(undelivered, "some grant expiry notices were not delivered");
        }
        Ok(expired.len())
    }

    pub async fn warn_expiring_secrets(&self) -> CoreResult<ExpiryReport> {
        self.expiry.run().await
    }

    pub async fn purge_notifications(&self) -> CoreResult<usize> {
        let retention = i64::from(self.config.notification_retention_days) * DAY_MS;
        self.inbox
            .purge_read_before(crate::now_ms() - retention)
            .await
    }

    /// Run every sweep once, in order. Stops at the first failure.
    pub async fn run_once(&self) -> CoreResult<SweepReport> {
        Ok(SweepReport {
            grants_expired: self.expire_grants().await?,
            secrets: self.warn_expiring_secrets().await?,
            notifications_purged: self.purge_notifications().await?,
        })
    }

    /// Start the three loops on the current runtime.
    pub fn spawn(self, cancel: CancellationToken) -> SweeperHandle {
        let grant_sweep = {
            let sweeper = self.clone();
            spawn_loop(
                "grant_expiry",
                self.config.grant_expiry_period(),
                cancel.clone(),
                move || {
                    let sweeper = sweeper.clone();
                    async move {
                        match sweeper.expire_grants().await {
                            Ok(0) => {}
                            Ok(expired) => info!(expired, "grant expiry sweep"),
                            Err(err) => warn!(%err, "grant expiry sweep failed"),
                        }
                    }
                },
            )
        };

        let secret_sweep = {
            let sweeper = self.clone();
            spawn_loop(
                "secret_expiry",
                self.config.secret_expiry_period(),
                cancel.clone(),
                move || {
                    let sweeper = sweeper.clone();
                    async move {
                        if let Err(err) = sweeper.warn_expiring_secrets().await {
                            warn!(%err, "secret expiry sweep failed");
                        }
                    }
                },
            )
        };

        let cleanup_sweep = {
            let sweeper = self.clone();
            spawn_loop(
                "notification_cleanup",
                self.config.notification_cleanup_period(),
                cancel.clone(),
                move || {
                    let sweeper = sweeper.clone();
                    async move {
                        if let Err(err) = sweeper.purge_notifications().await {
                            warn!(%err, "notification cleanup failed");
                        }
                    }
                },
            )
        };

        SweeperHandle {
            cancel,
            tasks: vec![grant_sweep, secret_sweep, cleanup_sweep],
        }
    }
}

fn spawn_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    mut job: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(sweep = name, period_secs = period.as_secs(), "sweep started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => job().await,
            }
        }

        info!(sweep = name, "sweep stopped");
    })
}

/// Running sweeps.
pub struct SweeperHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SweeperHandle {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel every loop and wait for the in-flight passes to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for result in futures::future::join_all(self.tasks).await {
            if let Err(err) = result {
                warn!(%err, "sweep task ended abnormally");
            }
        }
    }
}
