//! Core data models for the blob store.
//!
//! `FileMetadataRecord` maps to the `files` table via `sqlx::FromRow` and
//! serializes as the `info` response body. The operation keys are in-memory
//! only and feed admission control.

pub mod file_record;
pub mod operation;
