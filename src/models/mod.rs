//! Core data models for the SWORD deposit server.
//!
//! These entities represent buckets, versioned objects and their tags,
//! deposit records and segmented uploads. Row types map to database tables
//! via `sqlx::FromRow` and serialize as JSON via `serde`.

pub mod bucket;
pub mod deposit;
pub mod multipart;
pub mod object;
pub mod tags;
