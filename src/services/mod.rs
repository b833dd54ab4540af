//! Core services: admission control, object storage, the ingest pipeline and
//! the optional metadata store, tied together by `StorageService`.

pub mod admission;
pub mod ingest;
pub mod metadata;
pub mod object_store;
pub mod stages;
pub mod storage_service;
