//! Zapcast API - HTTP trigger surface
//!
//! This crate provides the REST API for Zapcast: campaign lifecycle
//! endpoints, the run/resume and sweep triggers, health and metrics.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod routes;

pub use auth::AppState;
pub use routes::create_router;
