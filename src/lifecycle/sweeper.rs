//! Lifecycle sweeps.
//!
//! Each sweep evaluates its entities independently: one transaction per
//! entity, so one failure never blocks the others. Failed entities are left
//! untouched and picked up again by the next run. Owners whose files were
//! removed have their total data size recomputed afterwards.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db::{Database, SessionRepository, ShareAccessTokenRepository};
use crate::expiry::Expirable;
use crate::file::{AggregateRefresher, ContentStore, FileRepository, FileService};
use crate::share::{GrantRepository, GrantService, TicketRepository, TicketService};
use crate::{FransError, Result};

/// A lifecycle task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SweepKind {
    Files,
    Tickets,
    Grants,
    Sessions,
}

impl SweepKind {
    /// All sweeps, in the order a full run executes them.
    ///
    /// Files go first so tickets and grants emptied by the file sweep are
    /// removed in the same run.
    pub const ALL: [SweepKind; 4] = [
        SweepKind::Files,
        SweepKind::Tickets,
        SweepKind::Grants,
        SweepKind::Sessions,
    ];

    /// Task name as used on the command line.
    pub fn task_name(&self) -> &'static str {
        match self {
            SweepKind::Files => "lifecycle-file",
            SweepKind::Tickets => "lifecycle-ticket",
            SweepKind::Grants => "lifecycle-grant",
            SweepKind::Sessions => "lifecycle-session",
        }
    }
}

impl FromStr for SweepKind {
    type Err = FransError;

    fn from_str(s: &str) -> Result<Self> {
        SweepKind::ALL
            .into_iter()
            .find(|kind| kind.task_name() == s)
            .ok_or_else(|| FransError::Validation(format!("unknown lifecycle task: {s}")))
    }
}

impl fmt::Display for SweepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.task_name())
    }
}

/// Outcome of a sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Entities deleted.
    pub deleted: usize,
    /// Entities whose deletion failed and was rolled back.
    pub failed: usize,
    /// Users whose total data size was recomputed.
    pub refreshed_users: usize,
}

impl SweepReport {
    fn merge(&mut self, other: &SweepReport) {
        self.deleted += other.deleted;
        self.failed += other.failed;
        self.refreshed_users += other.refreshed_users;
    }
}

/// Runs the lifecycle sweeps.
pub struct LifecycleSweeper {
    db: Database,
    store: ContentStore,
    config: Config,
}

impl LifecycleSweeper {
    pub fn new(db: Database, store: ContentStore, config: Config) -> Self {
        Self { db, store, config }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Run one sweep as of now.
    pub async fn run(&self, kind: SweepKind) -> Result<SweepReport> {
        self.run_at(kind, Utc::now()).await
    }

    /// Run one sweep as of `now`.
    pub async fn run_at(&self, kind: SweepKind, now: DateTime<Utc>) -> Result<SweepReport> {
        match kind {
            SweepKind::Files => self.sweep_files(now).await,
            SweepKind::Tickets => self.sweep_tickets(now).await,
            SweepKind::Grants => self.sweep_grants(now).await,
            SweepKind::Sessions => self.sweep_sessions(now).await,
        }
    }

    /// Run every sweep in order. A failing sweep does not stop the others.
    pub async fn run_all(&self) -> SweepReport {
        let now = Utc::now();
        let mut total = SweepReport::default();
        for kind in SweepKind::ALL {
            match self.run_at(kind, now).await {
                Ok(report) => total.merge(&report),
                Err(e) => warn!(task = %kind, error = %e, "lifecycle sweep failed"),
            }
        }
        total
    }

    /// Delete files whose policy says they are done.
    pub async fn sweep_files(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let service = FileService::new(&self.db, &self.store, self.config.file_expiry());
        let candidates = FileRepository::list_sweep_candidates(self.db.pool()).await?;
        debug!(candidates = candidates.len(), "file sweep started");

        let mut report = SweepReport::default();
        let mut affected = BTreeSet::new();

        for candidate in candidates {
            if !candidate.should_delete(service.defaults(), now) {
                continue;
            }

            let mut tx = self.db.begin().await?;
            let mut pending = self.store.pending();
            // Re-check inside the transaction; a download may have landed since listing
            let loaded = FileRepository::get_by_id(&mut *tx, &candidate.id).await;
            let result = match loaded {
                Ok(Some(file)) if file.should_delete(service.defaults(), now) => {
                    service.delete_in(&mut tx, &file.id, &mut pending).await
                }
                Ok(_) => Ok(None),
                Err(e) => Err(e),
            };

            match pending.settle(tx, result).await {
                Ok(Some(deleted)) => {
                    report.deleted += 1;
                    affected.insert(deleted.owner_id);
                }
                Ok(None) => {}
                Err(e) => {
                    report.failed += 1;
                    warn!(file_id = %candidate.id, error = %e, "could not delete expired file");
                }
            }
        }

        report.refreshed_users = self.refresh_users(&affected).await;
        info!(
            deleted_count = report.deleted,
            failed_count = report.failed,
            "file lifecycle sweep finished"
        );
        Ok(report)
    }

    /// Delete tickets that hold no files, or have expired along with all their files.
    pub async fn sweep_tickets(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let service = TicketService::new(&self.db, &self.store, &self.config);
        let ids = TicketRepository::list_ids(self.db.pool()).await?;

        let mut report = SweepReport::default();
        let mut affected = BTreeSet::new();

        for id in ids {
            let mut tx = self.db.begin().await?;
            let mut pending = self.store.pending();
            let mut owner = None;
            let loaded = TicketRepository::load(&mut tx, &id).await;
            let result = match loaded {
                Ok(Some(ticket)) if service.should_delete(&ticket, now) => {
                    owner = Some(ticket.ticket.owner_id);
                    service.delete_in(&mut tx, &id, &mut pending).await
                }
                Ok(_) => Ok(None),
                Err(e) => Err(e),
            };

            match pending.settle(tx, result).await {
                Ok(Some(files)) => {
                    report.deleted += 1;
                    affected.extend(owner);
                    affected.extend(files.into_iter().map(|f| f.owner_id));
                }
                Ok(None) => {}
                Err(e) => {
                    report.failed += 1;
                    warn!(ticket_id = %id, error = %e, "could not delete expired ticket");
                }
            }
        }

        report.refreshed_users = self.refresh_users(&affected).await;
        info!(
            deleted_count = report.deleted,
            failed_count = report.failed,
            "ticket lifecycle sweep finished"
        );
        Ok(report)
    }

    /// Delete grants that have expired and hold no files.
    pub async fn sweep_grants(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let service = GrantService::new(&self.db, &self.store, &self.config);
        let ids = GrantRepository::list_ids(self.db.pool()).await?;

        let mut report = SweepReport::default();
        let mut affected = BTreeSet::new();

        for id in ids {
            let mut tx = self.db.begin().await?;
            let mut pending = self.store.pending();
            let loaded = GrantRepository::load(&mut tx, &id).await;
            let result = match loaded {
                Ok(Some(grant)) if service.should_delete(&grant, now) => {
                    service.delete_in(&mut tx, &id, &mut pending).await
                }
                Ok(_) => Ok(None),
                Err(e) => Err(e),
            };

            match pending.settle(tx, result).await {
                Ok(Some(files)) => {
                    report.deleted += 1;
                    affected.extend(files.into_iter().map(|f| f.owner_id));
                }
                Ok(None) => {}
                Err(e) => {
                    report.failed += 1;
                    warn!(grant_id = %id, error = %e, "could not delete expired grant");
                }
            }
        }

        report.refreshed_users = self.refresh_users(&affected).await;
        info!(
            deleted_count = report.deleted,
            failed_count = report.failed,
            "grant lifecycle sweep finished"
        );
        Ok(report)
    }

    /// Delete expired sessions and share access tokens.
    pub async fn sweep_sessions(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let sessions = SessionRepository::new(self.db.pool())
            .delete_expired(now)
            .await?;
        let tokens = ShareAccessTokenRepository::new(
            self.db.pool(),
            self.config.lifecycle.share_token_expiry_secs,
        )
        .delete_expired(now)
        .await?;

        info!(
            deleted_count = sessions + tokens,
            sessions, tokens, "session lifecycle sweep finished"
        );
        Ok(SweepReport {
            deleted: (sessions + tokens) as usize,
            ..SweepReport::default()
        })
    }

    /// Recompute every user's total data size.
    pub async fn refresh_aggregates(&self) -> Result<SweepReport> {
        let refreshed_users = AggregateRefresher::refresh_all(&self.db).await?;
        Ok(SweepReport {
            refreshed_users,
            ..SweepReport::default()
        })
    }

    async fn refresh_users(&self, user_ids: &BTreeSet<String>) -> usize {
        let mut refreshed = 0;
        for user_id in user_ids {
            match AggregateRefresher::refresh_user(&self.db, user_id).await {
                Ok(_) => refreshed += 1,
                Err(e) => warn!(user_id = %user_id, error = %e, "could not refresh total data size"),
            }
        }
        refreshed
    }
}
