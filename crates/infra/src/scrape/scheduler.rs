use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use aetos_core::ScrapeJobId;

use crate::store::LifecycleStore;

use super::launcher::{LaunchError, ScrapeLauncher};

/// When scheduled scrapes fire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// On the hour, at each listed UTC hour, every day.
    DailyAt(Vec<u32>),
    Every(Duration),
}

impl Schedule {
    pub const DEFAULT_HOURS_UTC: [u32; 3] = [9, 14, 21];

    /// Hours outside `0..24` are dropped.
    pub fn daily_at(hours: impl IntoIterator<Item = u32>) -> Self {
        let mut hours: Vec<u32> = hours.into_iter().filter(|h| *h < 24).collect();
        hours.sort_unstable();
        hours.dedup();
        Self::DailyAt(hours)
    }

    /// First fire time strictly after `after`. `None` for an empty daily list.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Every(period) => Some(after + chrono::Duration::from_std(*period).ok()?),
            Schedule::DailyAt(hours) => {
                let today = after.date_naive();
                [today, today.succ_opt()?]
                    .into_iter()
                    .flat_map(|day| hours.iter().filter_map(move |h| day.and_hms_opt(*h, 0, 0)))
                    .map(|at| at.and_utc())
                    .find(|at| *at > after)
            }
        }
    }
}

impl Default for Schedule {
    fn default() -> Self {
        Self::daily_at(Self::DEFAULT_HOURS_UTC)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScheduleStats {
    pub launched: u64,
    /// Runs skipped because the rotation had nothing enabled.
    pub skipped: u64,
    pub failed: u64,
    pub last_job: Option<ScrapeJobId>,
}

/// Fires rotation scrapes on a [`Schedule`].
pub struct ScrapeScheduler<S> {
    launcher: Arc<ScrapeLauncher<S>>,
    schedule: Schedule,
}

impl<S> ScrapeScheduler<S>
where
    S: LifecycleStore + Clone + 'static,
{
    pub fn new(launcher: Arc<ScrapeLauncher<S>>, schedule: Schedule) -> Self {
        Self { launcher, schedule }
    }

    async fn fire(&self, stats: &Mutex<ScheduleStats>) {
        let result = self.launcher.launch(None, None).await;
        let mut stats = stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match result {
            Ok(launched) => {
                info!(job_id = %launched.ticket.job_id, brand = %launched.brand, "scheduled scrape started");
                stats.launched += 1;
                stats.last_job = Some(launched.ticket.job_id);
            }
            Err(LaunchError::RotationEmpty) => {
                warn!("no searches enabled in the rotation; scheduled scrape skipped");
                stats.skipped += 1;
            }
            Err(err) => {
                error!(error = %err, "scheduled scrape failed");
                stats.failed += 1;
            }
        }
    }

    pub fn spawn(self) -> ScheduleHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(ScheduleStats::default()));
        let join = tokio::spawn(schedule_loop(self, shutdown_rx, stats.clone()));

        ScheduleHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }
}

/// Handle to control a running scheduler.
#[derive(Debug)]
pub struct ScheduleHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<ScheduleStats>>,
}

impl ScheduleHandle {
    /// Stop firing and wait for an in-flight launch to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                error!(error = %err, "scrape scheduler task panicked");
            }
        }
    }

    pub fn stats(&self) -> ScheduleStats {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

async fn schedule_loop<S>(
    scheduler: ScrapeScheduler<S>,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<ScheduleStats>>,
) where
    S: LifecycleStore + Clone + 'static,
{
    info!(schedule = ?scheduler.schedule, "scrape scheduler started");
    let mut cursor = Utc::now();

    loop {
        if *shutdown.borrow() {
            break;
        }

        let now = Utc::now();
        let Some(target) = scheduler.schedule.next_after(cursor.max(now)) else {
            warn!("scrape schedule has no fire times; scheduler idle");
            let _ = shutdown.changed().await;
            break;
        };
        let wait = (target - now).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        }

        scheduler.fire(&stats).await;
        // Never fire the same slot twice if the timer wakes early.
        cursor = target;
    }

    info!("scrape scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::TimeZone;

    use crate::coordinators::ScraperClient;
    use crate::store::{InMemoryLifecycleStore, NewRotationEntry};

    fn utc(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, h, m, 0).unwrap()
    }

    #[test]
    fn daily_schedule_picks_the_next_hour_and_wraps_to_tomorrow() {
        let schedule = Schedule::default();
        assert_eq!(schedule.next_after(utc(8, 30)), Some(utc(9, 0)));
        assert_eq!(schedule.next_after(utc(9, 0)), Some(utc(14, 0)));
        assert_eq!(schedule.next_after(utc(14, 1)), Some(utc(21, 0)));
        assert_eq!(
            schedule.next_after(utc(21, 0)),
            Some(Utc.with_ymd_and_hms(2026, 3, 15, 9, 0, 0).unwrap())
        );
    }

    #[test]
    fn daily_hours_are_sorted_and_bounded() {
        assert_eq!(Schedule::daily_at([21, 9, 30, 9]), Schedule::DailyAt(vec![9, 21]));
        assert_eq!(Schedule::daily_at([]).next_after(utc(0, 0)), None);
    }

    #[tokio::test]
    async fn scheduler_fires_and_records_skips_on_an_empty_rotation() {
        let store = Arc::new(InMemoryLifecycleStore::new());
        let launcher = Arc::new(ScrapeLauncher::new(
            store,
            ScraperClient::new("http://127.0.0.1:9", "k"),
            None,
        ));
        let handle =
            ScrapeScheduler::new(launcher, Schedule::Every(Duration::from_millis(10))).spawn();

        for _ in 0..200 {
            if handle.stats().skipped >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let stats = handle.stats();
        handle.shutdown().await;

        assert!(stats.skipped >= 2);
        assert_eq!(stats.launched, 0);
    }

    #[tokio::test]
    async fn scheduler_advances_the_rotation_each_run() {
        let store = Arc::new(InMemoryLifecycleStore::new());
        for brand in ["Bronica", "Pentax"] {
            store
                .add_rotation_entry(NewRotationEntry {
                    brand: brand.into(),
                    search_term: None,
                    enabled: true,
                })
                .await
                .unwrap();
        }
        // Unreachable scraper: every run fails after advancing the rotation.
        let launcher = Arc::new(ScrapeLauncher::new(
            store.clone(),
            ScraperClient::new("http://127.0.0.1:9", "k"),
            None,
        ));
        let handle =
            ScrapeScheduler::new(launcher, Schedule::Every(Duration::from_millis(10))).spawn();

        for _ in 0..200 {
            if handle.stats().failed >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.shutdown().await;

        let rotation = store.rotation().await.unwrap();
        assert!(rotation.iter().all(|e| e.last_searched_at.is_some()));
    }
}
