//! Zapcast Common - Shared types and configuration
//!
//! This crate provides the configuration, error type and identifier
//! aliases shared by every Zapcast component.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
