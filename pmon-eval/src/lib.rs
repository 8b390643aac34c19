//! pmon-eval library interface
//!
//! Exposes the evaluation pipeline for integration testing: the sample
//! coordinator, region processor, checkpointing, the dynamic threshold engine
//! and report generation.

pub mod app;
pub mod capability;
pub mod imaging;
pub mod models;
pub mod services;

pub use app::EvalApp;
