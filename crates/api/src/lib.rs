//! HTTP API: scraper webhook, admin surface, health, and the wiring of the
//! background relay and dispatch workers.

pub mod app;
