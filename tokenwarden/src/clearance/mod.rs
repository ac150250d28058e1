//! Clearance cookie cache and the external scraper that fills it.

mod broker;
mod cache;
mod error;
mod store;
mod types;

pub use broker::{
    AcquisitionBroker, DEFAULT_HARD_TIMEOUT, DEFAULT_SCRAPER_TIMEOUT, SCRAPER_SCRIPT,
    ScraperBroker, ScraperConfig, parse_result_file, scan_stdout,
};
pub use cache::ClearanceCache;
pub use error::{BrokerError, ClearanceError};
pub use store::ClearanceStore;
pub use types::{
    ANONYMOUS_IDENTITY, AcquiredClearance, CLEARANCE_TTL, CacheKey, ClearanceEntry,
    ClearanceStats, DIRECT_EGRESS, EXPIRING_SOON_WINDOW, EgressPath,
};
