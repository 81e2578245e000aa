//! Periodic lifecycle runs.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info};

use super::sweeper::{LifecycleSweeper, SweepKind};

/// Runs every sweep on a fixed interval, one background task per sweep.
///
/// A sweep never overlaps with itself: the next tick is only awaited once
/// the previous run has finished.
pub struct LifecycleScheduler {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl LifecycleScheduler {
    /// Spawn the sweep tasks. The first run happens immediately.
    pub fn start(sweeper: Arc<LifecycleSweeper>, period: Duration) -> Self {
        info!(
            "Lifecycle scheduler started (interval: {} seconds)",
            period.as_secs()
        );

        let (shutdown, _) = watch::channel(false);
        let handles = SweepKind::ALL
            .into_iter()
            .map(|kind| {
                let sweeper = Arc::clone(&sweeper);
                let mut stop = shutdown.subscribe();
                tokio::spawn(async move {
                    let mut timer = interval(period);
                    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

                    loop {
                        tokio::select! {
                            _ = timer.tick() => {}
                            _ = stop.changed() => break,
                        }

                        match sweeper.run(kind).await {
                            Ok(report) => debug!(task = %kind, ?report, "lifecycle run complete"),
                            Err(e) => error!(task = %kind, error = %e, "lifecycle run failed"),
                        }
                    }
                    debug!(task = %kind, "lifecycle task stopped");
                })
            })
            .collect();

        Self { shutdown, handles }
    }

    /// Stop all tasks, letting runs in progress finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "lifecycle task panicked");
            }
        }
        info!("Lifecycle scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::{Database, NewSession, NewUser, SessionRepository, UserRepository};
    use crate::file::ContentStore;
    use chrono::{Duration as ChronoDuration, Utc};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_scheduler_runs_and_stops() {
        let db = Database::open_in_memory().await.unwrap();
        let dir = TempDir::new().unwrap();
        let store = ContentStore::new(dir.path(), 1024).unwrap();
        let user = UserRepository::new(db.pool())
            .create(&NewUser::new("alice", "Alice"))
            .await
            .unwrap();
        let sessions = SessionRepository::new(db.pool());
        sessions
            .create(&NewSession {
                id: "id-token".into(),
                user_id: user.id.clone(),
                refresh_token: "stale".into(),
                expires_at: Utc::now() - ChronoDuration::hours(1),
            })
            .await
            .unwrap();

        let sweeper = Arc::new(LifecycleSweeper::new(db.clone(), store, Config::default()));
        let scheduler = LifecycleScheduler::start(sweeper, Duration::from_secs(3600));

        // The first tick fires immediately
        let mut remaining = 1;
        for _ in 0..50 {
            remaining = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM sessions")
                .fetch_one(db.pool())
                .await
                .unwrap();
            if remaining == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(remaining, 0);

        scheduler.shutdown().await;
    }
}
