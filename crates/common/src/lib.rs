//! Common types for the session credit accounting crates

mod config;
mod error;

pub use config::{
    CONFIG_PATH_ENV, CreditConfig, DEFAULT_USAGE_REPORTING_THRESHOLD, THRESHOLD_ENV,
};
pub use error::{Error, Result};
