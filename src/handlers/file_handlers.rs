//! HTTP handlers for the four object operations.
//! Each handler extracts the client address and request parameters and
//! delegates everything else to `StorageService`.

use crate::{
    errors::AppError, models::file_record::FileMetadataRecord,
    services::ingest::ExpectedDigests, services::storage_service::StorageService,
};
use axum::{
    Json,
    extract::{ConnectInfo, Multipart, Query, State, multipart::MultipartError},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// `?filename=` parameter shared by download, delete and info.
#[derive(Debug, Deserialize)]
pub struct FilenameQuery {
    #[serde(default)]
    pub filename: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub filename: String,
}

fn multipart_error(err: MultipartError) -> AppError {
    AppError::new(err.status(), format!("param 'file' is invalid: {}", err.body_text()))
}

/// `PUT /upload`: multipart field `file`, optional `md5`, `sha1`, `sha256`.
pub async fn upload_file(
    State(service): State<StorageService>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let mut file = None;
    let mut expected = ExpectedDigests::default();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("file") => file = Some(field.bytes().await.map_err(multipart_error)?),
            Some("md5") => expected.md5 = Some(field.text().await.map_err(multipart_error)?),
            Some("sha1") => expected.sha1 = Some(field.text().await.map_err(multipart_error)?),
            Some("sha256") => {
                expected.sha256 = Some(field.text().await.map_err(multipart_error)?)
            }
            _ => {}
        }
    }

    let file = file.ok_or_else(|| {
        AppError::bad_request("param 'file' is invalid (must be a multipart-form file)")
    })?;

    let filename = service
        .upload(addr.ip(), Vec::from(file), expected)
        .await?;
    Ok(Json(UploadResponse { filename }))
}

/// `GET /download?filename=`: raw object bytes.
pub async fn download_file(
    State(service): State<StorageService>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(q): Query<FilenameQuery>,
) -> Result<Response, AppError> {
    let data = service.download(addr.ip(), &q.filename).await?;

    let mut response = data.into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    Ok(response)
}

/// `DELETE /delete?filename=`: empty 200 on success.
pub async fn delete_file(
    State(service): State<StorageService>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(q): Query<FilenameQuery>,
) -> Result<StatusCode, AppError> {
    service.delete(addr.ip(), &q.filename).await?;
    Ok(StatusCode::OK)
}

/// `GET /info?filename=`: the metadata record as JSON.
pub async fn file_info(
    State(service): State<StorageService>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(q): Query<FilenameQuery>,
) -> Result<Json<FileMetadataRecord>, AppError> {
    let record = service.info(addr.ip(), &q.filename).await?;
    Ok(Json(record))
}
