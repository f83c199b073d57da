//! Zapcast Storage - Campaign, message and instance persistence
//!
//! This crate provides the persisted model of the campaign delivery
//! scheduler, the store traits the engine depends on, PostgreSQL
//! implementations of those traits and an in-memory implementation.

pub mod db;
pub mod memory;
pub mod models;
pub mod repository;

pub use db::{Database, DatabasePool};
pub use memory::MemoryStore;
pub use models::*;
pub use repository::*;
