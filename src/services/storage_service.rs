//! src/services/storage_service.rs
//!
//! StorageService: the per-operation control flow shared by the HTTP
//! handlers. Every operation is admitted first; upload then goes through the
//! ingest pipeline, download/delete touch the object store and then the
//! optional metadata store, info reads metadata only.

use crate::{
    models::{
        file_record::FileMetadataRecord,
        operation::{ClientOperationKey, OperationKind},
    },
    services::{
        admission::{Admission, AdmissionController, Denial},
        ingest::{ExpectedDigests, IngestError, IngestPipeline},
        metadata::{MetadataError, MetadataStore},
        object_store::{ObjectStore, StorageError},
    },
};
use bytes::Bytes;
use std::{net::IpAddr, sync::Arc};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Outcome categories surfaced to the HTTP boundary.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The caller sent something unusable; retrying as-is will not help.
    #[error("{0}")]
    InvalidInput(String),
    #[error("{0}")]
    NotFound(String),
    /// Admission refused the request. Nothing was recorded.
    #[error("{0}")]
    Denied(Denial),
    #[error("service is running in without-metadata mode")]
    MetadataDisabled,
    #[error("{0}")]
    Internal(String),
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidObjectId(_) => {
                ServiceError::InvalidInput(format!("too short or malformed file name: {err}"))
            }
            StorageError::ObjectNotFound(_) => ServiceError::NotFound(err.to_string()),
            other => ServiceError::Internal(other.to_string()),
        }
    }
}

impl From<MetadataError> for ServiceError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::NotFound(_) => ServiceError::NotFound(err.to_string()),
            other => ServiceError::Internal(other.to_string()),
        }
    }
}

impl From<IngestError> for ServiceError {
    fn from(err: IngestError) -> Self {
        if let Some(id) = err.stored_id() {
            warn!(%id, "object stored but upload reported an error");
        }
        match err {
            IngestError::DigestMismatch(_) => ServiceError::InvalidInput(err.to_string()),
            IngestError::Storage(inner) => inner.into(),
            other => ServiceError::Internal(other.to_string()),
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Clone)]
pub struct StorageService {
    /// Shared limiter; the sweeper task holds another handle.
    pub admission: Arc<AdmissionController>,

    pub pipeline: IngestPipeline,
}

impl StorageService {
    pub fn new(admission: Arc<AdmissionController>, pipeline: IngestPipeline) -> Self {
        Self {
            admission,
            pipeline,
        }
    }

    pub fn objects(&self) -> &ObjectStore {
        self.pipeline.store()
    }

    pub fn metadata(&self) -> Option<&MetadataStore> {
        self.pipeline.metadata()
    }

    fn admit(&self, client: IpAddr, operation: OperationKind, bytes: u64) -> ServiceResult<()> {
        match self
            .admission
            .admit(ClientOperationKey::new(client, operation), bytes)
        {
            Admission::Allowed => Ok(()),
            Admission::Denied(reason) => {
                debug!(%client, %operation, bytes, %reason, "request denied");
                Err(ServiceError::Denied(reason))
            }
        }
    }

    /// Store a new object and return its id.
    pub async fn upload(
        &self,
        client: IpAddr,
        data: Vec<u8>,
        expected: ExpectedDigests,
    ) -> ServiceResult<String> {
        if data.is_empty() {
            return Err(ServiceError::InvalidInput("param 'file' is empty".into()));
        }
        let size = data.len();
        self.admit(client, OperationKind::Upload, size as u64)?;

        let id = self.pipeline.ingest(data, &expected).await?;
        info!(%client, %id, size, "uploaded object");
        Ok(id)
    }

    /// Fetch an object's bytes and count the download.
    pub async fn download(&self, client: IpAddr, id: &str) -> ServiceResult<Bytes> {
        let size = self.objects().size(id).await?;
        self.admit(client, OperationKind::Download, size)?;

        let data = self.objects().read(id).await?;
        if let Some(metadata) = self.metadata() {
            metadata.record_download(id).await?;
        }
        Ok(data)
    }

    /// Remove an object for good, leaving a metadata tombstone.
    pub async fn delete(&self, client: IpAddr, id: &str) -> ServiceResult<()> {
        let size = self.objects().size(id).await?;
        self.admit(client, OperationKind::Delete, size)?;

        self.objects().remove(id).await?;
        if let Some(metadata) = self.metadata() {
            metadata.mark_removed(id).await?;
        }
        info!(%client, %id, "deleted object");
        Ok(())
    }

    pub async fn info(&self, client: IpAddr, id: &str) -> ServiceResult<FileMetadataRecord> {
        ObjectStore::validate_id(id)?;
        self.admit(client, OperationKind::Info, 0)?;

        let metadata = self.metadata().ok_or(ServiceError::MetadataDisabled)?;
        Ok(metadata.load(id).await?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::services::{
        admission::AdmissionLimits, object_store::DEFAULT_MAX_ALLOCATION_ATTEMPTS,
        stages::Uppercase,
    };
    use std::net::Ipv4Addr;
    use tempfile::TempDir;

    pub(crate) const CLIENT: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    pub(crate) async fn service(
        dir: &TempDir,
        limits: AdmissionLimits,
        with_metadata: bool,
    ) -> StorageService {
        let metadata = if with_metadata {
            Some(MetadataStore::in_memory().await)
        } else {
            None
        };
        let pipeline = IngestPipeline::new(
            ObjectStore::new(dir.path(), DEFAULT_MAX_ALLOCATION_ATTEMPTS),
            metadata,
        )
        .with_pre_stages(vec![Arc::new(Uppercase)]);
        StorageService::new(Arc::new(AdmissionController::new(limits)), pipeline)
    }

    #[tokio::test]
    async fn lifecycle_with_metadata() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, AdmissionLimits::UNLIMITED, true).await;

        let id = service
            .upload(CLIENT, b"capitalize Proverka".to_vec(), ExpectedDigests::default())
            .await
            .unwrap();
        assert_eq!(
            service.download(CLIENT, &id).await.unwrap(),
            Bytes::from_static(b"CAPITALIZE PROVERKA")
        );

        service.delete(CLIENT, &id).await.unwrap();
        assert!(matches!(
            service.delete(CLIENT, &id).await,
            Err(ServiceError::NotFound(_))
        ));

        let record = service.info(CLIENT, &id).await.unwrap();
        assert!(record.is_removed);
        assert_eq!(record.downloads_count, 1);
    }

    #[tokio::test]
    async fn empty_upload_is_rejected_before_admission() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, AdmissionLimits::from_raw(1, 0), false).await;

        assert!(matches!(
            service.upload(CLIENT, Vec::new(), ExpectedDigests::default()).await,
            Err(ServiceError::InvalidInput(_))
        ));
        assert_eq!(service.admission.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn digest_mismatch_is_client_error() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, AdmissionLimits::UNLIMITED, false).await;
        let expected = ExpectedDigests {
            sha256: Some("00".into()),
            ..Default::default()
        };

        let err = service
            .upload(CLIENT, b"data".to_vec(), expected)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidInput(ref msg) if msg == "sha256-hashsum doesn't match"));
    }

    #[tokio::test]
    async fn info_without_metadata_is_not_applicable() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, AdmissionLimits::UNLIMITED, false).await;

        assert!(matches!(
            service.info(CLIENT, "abcdef").await,
            Err(ServiceError::MetadataDisabled)
        ));
        assert!(matches!(
            service.info(CLIENT, "a").await,
            Err(ServiceError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn download_is_charged_the_object_size() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, AdmissionLimits::from_raw(0, 10), false).await;

        let id = service
            .upload(CLIENT, b"eight by".to_vec(), ExpectedDigests::default())
            .await
            .unwrap();
        service.download(CLIENT, &id).await.unwrap();

        assert!(matches!(
            service.download(CLIENT, &id).await,
            Err(ServiceError::Denied(Denial::BandwidthExceeded))
        ));
    }

    #[tokio::test]
    async fn missing_object_is_not_found_before_admission() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, AdmissionLimits::from_raw(1, 0), false).await;

        for _ in 0..3 {
            assert!(matches!(
                service.download(CLIENT, "missing-id").await,
                Err(ServiceError::NotFound(_))
            ));
        }
        assert_eq!(service.admission.tracked_keys(), 0);
    }
}
