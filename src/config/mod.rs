// src/config/mod.rs
pub mod app;
pub mod model;
pub mod scraper;

pub use app::AppConfig;
pub use scraper::{Credentials, ScraperConfig, SearchQuery, SourceSpec};
