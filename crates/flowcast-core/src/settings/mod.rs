//! Layered runtime settings.
//!
//! Compiled defaults, then an optional JSON file deep-merged on top, then
//! `FLOWCAST_*` environment overrides. The binary applies CLI flags last and
//! hands the finished struct to each subsystem by value.

mod loader;
mod types;

pub use loader::{
    apply_env_overrides, apply_overrides, deep_merge, load_settings_from_path, parse_bool,
    parse_f64_range, parse_u16_range, parse_u32_range, parse_u64_range, parse_usize_range,
};
pub use types::*;

/// Errors that can occur when loading or parsing settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

pub type Result<T> = std::result::Result<T, SettingsError>;
