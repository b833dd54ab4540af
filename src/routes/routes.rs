//! Defines routes for the blob store.
//!
//! ## Structure
//! - `PUT    /upload`                 : multipart upload, returns the new id
//! - `GET    /download?filename={id}` : raw object bytes
//! - `DELETE /delete?filename={id}`   : permanent removal
//! - `GET    /info?filename={id}`     : metadata record
//! - `GET    /healthz`, `GET /readyz` : probes

use crate::{
    handlers::{
        file_handlers::{delete_file, download_file, file_info, upload_file},
        health_handlers::{healthz, readyz},
    },
    services::storage_service::StorageService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, put},
};

/// Build the router. The caller attaches `StorageService` state and must serve
/// it with `ConnectInfo<SocketAddr>` so handlers can see the client address.
pub fn routes(max_upload_bytes: usize) -> Router<StorageService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/upload",
            put(upload_file).layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .route("/download", get(download_file))
        .route("/delete", delete(delete_file))
        .route("/info", get(file_info))
}
