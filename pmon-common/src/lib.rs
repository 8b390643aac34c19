//! # pmon Common Library
//!
//! Shared code for the pollen-monitor evaluation service:
//! - Error taxonomy
//! - Configuration loading (TOML)
//! - Artifact name codec (instrument filename grammar)
//! - Species threshold tables
//! - Completed-sample ledger

pub mod config;
pub mod error;
pub mod ledger;
pub mod pathname;
pub mod species;

pub use error::{Error, Result};
