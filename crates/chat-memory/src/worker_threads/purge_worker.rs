//! Background ticker that hard-deletes soft-deleted rows past retention
use crate::error::Result;
use crate::memory_db::{MemoryDatabase, PurgeStats};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct PurgeWorker {
    database: Arc<MemoryDatabase>,
    interval: Duration,
    retention: Duration,
}

impl PurgeWorker {
    pub fn new(database: Arc<MemoryDatabase>, interval: Duration, retention: Duration) -> Self {
        Self {
            database,
            interval,
            retention,
        }
    }

    /// Interval in minutes; `0` disables purging
    pub fn from_minutes(database: Arc<MemoryDatabase>, interval_minutes: u64, retention: Duration) -> Self {
        Self::new(database, Duration::from_secs(interval_minutes * 60), retention)
    }

    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    /// One purge pass over every project
    pub async fn run_once(&self) -> Result<PurgeStats> {
        let database = Arc::clone(&self.database);
        let retention = self.retention;
        tokio::task::spawn_blocking(move || database.purge_all(retention)).await?
    }

    /// Start ticking until `shutdown` fires. Returns `None` when disabled.
    pub fn spawn(self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        if !self.is_enabled() {
            info!("Purge worker disabled");
            return None;
        }
        info!(
            "Purge worker started: every {:?}, retention {:?}",
            self.interval, self.retention
        );
        Some(tokio::spawn(async move { self.run(shutdown).await }))
    }

    async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.run_once().await {
                Ok(stats) if stats.sessions + stats.messages > 0 => info!(
                    "Purged {} session(s) and {} message(s)",
                    stats.sessions, stats.messages
                ),
                Ok(_) => debug!("Purge pass found nothing to delete"),
                Err(e) => error!("Purge pass failed, retrying next tick: {}", e),
            }
        }
        info!("Purge worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::test_support::test_options;
    use crate::memory_db::{CreateSessionRequest, NewMessage, RoleType};
    use uuid::Uuid;

    fn seeded() -> Arc<MemoryDatabase> {
        let db = MemoryDatabase::new_in_memory("purge", test_options()).unwrap();
        let scope = db.scope(Uuid::new_v4());
        db.sessions
            .create(&scope, &CreateSessionRequest { session_id: "gone".into(), ..Default::default() })
            .unwrap();
        db.messages
            .create_many(&scope, "gone", &[NewMessage::new(RoleType::User, "bye")])
            .unwrap();
        db.sessions.delete(&scope, "gone").unwrap();
        Arc::new(db)
    }

    #[test]
    fn test_zero_interval_disables_worker() {
        let worker = PurgeWorker::from_minutes(seeded(), 0, Duration::ZERO);
        assert!(!worker.is_enabled());
    }

    #[tokio::test]
    async fn test_disabled_worker_does_not_spawn() {
        let worker = PurgeWorker::from_minutes(seeded(), 0, Duration::ZERO);
        assert!(worker.spawn(CancellationToken::new()).is_none());
    }

    #[tokio::test]
    async fn test_run_once_respects_retention() {
        let db = seeded();
        let kept = PurgeWorker::new(Arc::clone(&db), Duration::from_secs(60), Duration::from_secs(3600));
        assert_eq!(kept.run_once().await.unwrap(), PurgeStats::default());

        let worker = PurgeWorker::new(db, Duration::from_secs(60), Duration::ZERO);
        let stats = worker.run_once().await.unwrap();
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.messages, 1);
    }

    #[tokio::test]
    async fn test_ticker_stops_on_shutdown() {
        let shutdown = CancellationToken::new();
        let handle = PurgeWorker::new(seeded(), Duration::from_millis(10), Duration::ZERO)
            .spawn(shutdown.clone())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }
}
