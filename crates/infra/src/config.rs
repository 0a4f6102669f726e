//! Runtime configuration read from the environment.
//!
//! Every setting has a default. A value that is present but does not parse
//! falls back to the default with a warning naming the variable.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::coordinators::{CircuitBreakerConfig, DispatchConfig};
use crate::outbox::RelayConfig;
use crate::retry::RetryPolicy;
use crate::scrape::{PollConfig, Schedule};
use crate::transition::TransitionConfig;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_SCRAPER_URL: &str = "http://scraperv2:8000";
const DEFAULT_JITTER: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Postgres connection string; `None` selects the in-memory store.
    pub database_url: Option<String>,
    /// Redis connection string; `None` selects the in-memory broker.
    pub redis_url: Option<String>,
    pub bind_addr: String,
    pub scraper_url: String,
    pub scraper_api_key: String,
    /// Negotiation-bot endpoint; `None` parks listings entering `MESSAGING`.
    pub chatterbot_url: Option<String>,
    /// Resale-listing endpoint; `None` parks listings entering `RECEIVED`.
    pub ebay_url: Option<String>,
    pub transition: TransitionConfig,
    pub relay: RelayConfig,
    pub dispatch: DispatchConfig,
    /// Rotation scrapes; `None` disables the scheduler.
    pub scrape_schedule: Option<Schedule>,
    /// Background polling of started scrape jobs; `None` leaves result
    /// delivery to the job-complete webhook.
    pub scrape_poll: Option<PollConfig>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            redis_url: None,
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            scraper_url: DEFAULT_SCRAPER_URL.to_string(),
            scraper_api_key: String::new(),
            chatterbot_url: None,
            ebay_url: None,
            transition: TransitionConfig::default(),
            relay: RelayConfig::default(),
            dispatch: DispatchConfig::default(),
            scrape_schedule: Some(Schedule::default()),
            scrape_poll: Some(PollConfig::default()),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let num = |key: &str, default: u64| parse_or(&lookup, key, default);
        let millis = |key: &str, default: u64| Duration::from_millis(num(key, default));

        let transition = TransitionConfig::with_max_attempts(num("AETOS_TRANSITION_MAX_ATTEMPTS", 5) as u32);

        let relay = RelayConfig::default()
            .with_batch_size(num("AETOS_RELAY_BATCH_SIZE", 100) as usize)
            .with_poll_interval(millis("AETOS_RELAY_POLL_MS", 500))
            .with_backoff(RetryPolicy::unbounded(
                millis("AETOS_RELAY_BACKOFF_BASE_MS", 250),
                millis("AETOS_RELAY_BACKOFF_MAX_MS", 30_000),
            ));

        let dispatch = DispatchConfig {
            retry: RetryPolicy::exponential(
                (num("AETOS_DISPATCH_MAX_ATTEMPTS", 5) as u32).max(1),
                millis("AETOS_DISPATCH_BASE_DELAY_MS", 500),
                millis("AETOS_DISPATCH_MAX_DELAY_MS", 60_000),
            )
            .with_jitter(parse_jitter(&lookup, "AETOS_DISPATCH_JITTER", DEFAULT_JITTER)),
            attempt_timeout: millis("AETOS_DISPATCH_TIMEOUT_MS", 10_000),
            breaker: CircuitBreakerConfig {
                failure_threshold: (num("AETOS_BREAKER_FAILURE_THRESHOLD", 5) as u32).max(1),
                open_duration: millis("AETOS_BREAKER_OPEN_MS", 60_000),
                ..CircuitBreakerConfig::default()
            },
            ..DispatchConfig::default()
        };

        let scrape_schedule = match text("AETOS_SCRAPE_HOURS") {
            None => Some(Schedule::default()),
            Some(raw) if raw.eq_ignore_ascii_case("off") => None,
            Some(raw) => Some(parse_hours(&raw).unwrap_or_else(|| {
                warn!(variable = "AETOS_SCRAPE_HOURS", value = %raw, "unparsable setting; using default");
                Schedule::default()
            })),
        };

        let max_polls = num("AETOS_SCRAPE_MAX_POLLS", 40) as u32;
        let scrape_poll = (max_polls > 0).then(|| PollConfig {
            interval: Duration::from_secs(num("AETOS_SCRAPE_POLL_SECS", 180)),
            max_polls,
        });

        Self {
            database_url: text("DATABASE_URL"),
            redis_url: text("REDIS_URL"),
            bind_addr: text("AETOS_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            scraper_url: text("SCRAPER_API_URL").unwrap_or_else(|| DEFAULT_SCRAPER_URL.to_string()),
            scraper_api_key: text("SCRAPER_API_KEY").unwrap_or_default(),
            chatterbot_url: text("CHATTERBOT_API_URL"),
            ebay_url: text("EBAY_API_URL"),
            transition,
            relay,
            dispatch,
            scrape_schedule,
            scrape_poll,
        }
    }
}

/// Comma-separated UTC hours, each below 24.
fn parse_hours(raw: &str) -> Option<Schedule> {
    let hours = raw
        .split(',')
        .map(|h| h.trim().parse::<u32>().ok().filter(|h| *h < 24))
        .collect::<Option<Vec<_>>>()?;
    Some(Schedule::daily_at(hours))
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Copy + std::fmt::Display,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(variable = key, value = %raw, %default, "unparsable setting; using default");
            default
        }),
    }
}

fn parse_jitter<F>(lookup: &F, key: &str, default: f64) -> f64
where
    F: Fn(&str) -> Option<String>,
{
    let value = parse_or(lookup, key, default);
    if value.is_finite() {
        value
    } else {
        warn!(variable = key, value, default, "non-finite jitter; using default");
        default
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> OrchestratorConfig {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        OrchestratorConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let c = config(&[]);
        assert_eq!(c.database_url, None);
        assert_eq!(c.bind_addr, "0.0.0.0:8080");
        assert_eq!(c.scraper_url, "http://scraperv2:8000");
        assert_eq!(c.transition.max_attempts, 5);
        assert_eq!(c.relay.batch_size, 100);
        assert_eq!(c.relay.poll_interval, Duration::from_millis(500));
        assert_eq!(c.dispatch.retry.max_attempts, 5);
        assert_eq!(c.dispatch.attempt_timeout, Duration::from_secs(10));
        assert_eq!(c.dispatch.breaker.failure_threshold, 5);
        assert!((c.dispatch.retry.jitter - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn overrides_are_read() {
        let c = config(&[
            ("DATABASE_URL", "postgres://localhost/aetos"),
            ("CHATTERBOT_API_URL", "http://chatterbot:8000"),
            ("AETOS_DISPATCH_MAX_ATTEMPTS", "3"),
            ("AETOS_DISPATCH_TIMEOUT_MS", "250"),
            ("AETOS_RELAY_BATCH_SIZE", "10"),
        ]);
        assert_eq!(c.database_url.as_deref(), Some("postgres://localhost/aetos"));
        assert_eq!(c.chatterbot_url.as_deref(), Some("http://chatterbot:8000"));
        assert_eq!(c.dispatch.retry.max_attempts, 3);
        assert_eq!(c.dispatch.attempt_timeout, Duration::from_millis(250));
        assert_eq!(c.relay.batch_size, 10);
    }

    #[test]
    fn garbage_and_blank_values_fall_back() {
        let c = config(&[
            ("AETOS_TRANSITION_MAX_ATTEMPTS", "lots"),
            ("REDIS_URL", "   "),
        ]);
        assert_eq!(c.transition.max_attempts, 5);
        assert_eq!(c.redis_url, None);
    }

    #[test]
    fn non_finite_jitter_falls_back_to_default() {
        for raw in ["NaN", "inf", "-infinity"] {
            let c = config(&[("AETOS_DISPATCH_JITTER", raw)]);
            assert!((c.dispatch.retry.jitter - 0.1).abs() < f64::EPSILON, "{raw}");
            let delay = c.dispatch.retry.delay_for_attempt(1);
            assert!(delay <= Duration::from_millis(550));
        }
    }

    #[test]
    fn scrape_schedule_and_polling_are_configurable() {
        let c = config(&[]);
        assert_eq!(c.scrape_schedule, Some(Schedule::daily_at([9, 14, 21])));
        assert_eq!(c.scrape_poll, Some(PollConfig::default()));

        let c = config(&[
            ("AETOS_SCRAPE_HOURS", "6, 18"),
            ("AETOS_SCRAPE_POLL_SECS", "30"),
            ("AETOS_SCRAPE_MAX_POLLS", "4"),
        ]);
        assert_eq!(c.scrape_schedule, Some(Schedule::DailyAt(vec![6, 18])));
        let poll = c.scrape_poll.unwrap();
        assert_eq!((poll.interval, poll.max_polls), (Duration::from_secs(30), 4));

        let c = config(&[("AETOS_SCRAPE_HOURS", "off"), ("AETOS_SCRAPE_MAX_POLLS", "0")]);
        assert_eq!(c.scrape_schedule, None);
        assert_eq!(c.scrape_poll, None);

        let c = config(&[("AETOS_SCRAPE_HOURS", "9,25")]);
        assert_eq!(c.scrape_schedule, Some(Schedule::default()));
    }
}
