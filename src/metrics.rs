// src/metrics.rs
//! Metric names and one-time registration (so series show up on the exporter).

use metrics::{describe_counter, describe_gauge};
use once_cell::sync::OnceCell;

pub const BROKER_ITEMS: &str = "broker_items_total";
pub const BROKER_ITEM_ERRORS: &str = "broker_item_errors_total";
pub const INFERENCE_FALLBACK: &str = "inference_fallback_total";
pub const PERSIST_ERRORS: &str = "persist_errors_total";
pub const SCRAPER_WORKERS_ACTIVE: &str = "scraper_workers_active";
pub const SCRAPER_RECORDS: &str = "scraper_records_total";

pub fn ensure_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(BROKER_ITEMS, "Work items processed, labelled by lane.");
        describe_counter!(
            BROKER_ITEM_ERRORS,
            "Work items skipped because the payload was malformed."
        );
        describe_counter!(
            INFERENCE_FALLBACK,
            "Predictions replaced by the neutral fallback."
        );
        describe_counter!(PERSIST_ERRORS, "Persistence calls that failed.");
        describe_gauge!(SCRAPER_WORKERS_ACTIVE, "Registered scraper workers.");
        describe_counter!(
            SCRAPER_RECORDS,
            "Records handed to the background lane by scrapers."
        );
    });
}
