//! Core data models for the photo ingestion pipeline.
//!
//! These entities map to SQLite tables via `sqlx::FromRow` and serialize
//! as JSON via `serde` for the HTTP surface.

pub mod object;
pub mod photo;
pub mod queue_message;
