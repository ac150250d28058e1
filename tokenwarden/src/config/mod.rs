//! Application configuration.
//!
//! - [`AppConfig`]: process-wide settings read once at startup
//! - [`Settings`]: the runtime-mutable subset carried by `settingsUpdated`

mod app;
mod settings;

pub use app::AppConfig;
pub use settings::Settings;
