//! Scrape jobs this service starts itself: an admin trigger or the schedule
//! picks a brand (explicit or from the search rotation), the scraper is asked
//! to run it, and a background poller ingests the results once the job
//! completes.

pub mod launcher;
pub mod poller;
pub mod scheduler;

pub use launcher::{LaunchError, LaunchedScrape, ScrapeLauncher, ScrapeSource};
pub use poller::{PollConfig, PollOutcome, ScrapePoller};
pub use scheduler::{Schedule, ScheduleHandle, ScheduleStats, ScrapeScheduler};
