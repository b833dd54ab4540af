//! Upload ingest pipeline.
//!
//! verify digests -> pre-stages (in order) -> persist -> metadata create ->
//! post-stages (concurrently, joined)
//!
//! Nothing is persisted when verification or a pre-stage fails. Failures after
//! persistence are reported with the id of the object that was stored anyway.

use crate::services::{
    metadata::{MetadataError, MetadataStore},
    object_store::{ObjectStore, StorageError},
    stages::{PostStage, PreStage, StageError},
};
use bytes::Bytes;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::{fmt, sync::Arc};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestKind {
    Md5,
    Sha1,
    Sha256,
}

impl DigestKind {
    /// Lowercase hex digest of `data`.
    pub fn hex_digest(self, data: &[u8]) -> String {
        match self {
            DigestKind::Md5 => format!("{:x}", md5::compute(data)),
            DigestKind::Sha1 => hex::encode(Sha1::digest(data)),
            DigestKind::Sha256 => hex::encode(Sha256::digest(data)),
        }
    }
}

impl fmt::Display for DigestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DigestKind::Md5 => "md5",
            DigestKind::Sha1 => "sha1",
            DigestKind::Sha256 => "sha256",
        })
    }
}

/// Hex digests a client expects its payload to have. Blank values are ignored.
#[derive(Debug, Clone, Default)]
pub struct ExpectedDigests {
    pub md5: Option<String>,
    pub sha1: Option<String>,
    pub sha256: Option<String>,
}

impl ExpectedDigests {
    /// Check every supplied digest against `data`; reports the first mismatch.
    pub fn verify(&self, data: &[u8]) -> Result<(), DigestKind> {
        let expected = [
            (DigestKind::Md5, &self.md5),
            (DigestKind::Sha1, &self.sha1),
            (DigestKind::Sha256, &self.sha256),
        ];

        for (kind, value) in expected {
            let Some(value) = value.as_deref().map(str::trim).filter(|v| !v.is_empty()) else {
                continue;
            };
            if !kind.hex_digest(data).eq_ignore_ascii_case(value) {
                return Err(kind);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("{0}-hashsum doesn't match")]
    DigestMismatch(DigestKind),
    #[error("pre-stage `{stage}` failed: {source}")]
    PreStage {
        stage: String,
        #[source]
        source: StageError,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("object `{id}` stored but its metadata was not created: {source}")]
    Metadata {
        id: String,
        #[source]
        source: MetadataError,
    },
    #[error(
        "object `{id}` stored but {count} post-stage(s) failed: {joined}",
        count = .failures.len(),
        joined = .failures.join("; ")
    )]
    PostStages { id: String, failures: Vec<String> },
}

impl IngestError {
    /// Id of the object left on disk despite the error, if any.
    pub fn stored_id(&self) -> Option<&str> {
        match self {
            IngestError::Metadata { id, .. } | IngestError::PostStages { id, .. } => Some(id),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct IngestPipeline {
    store: ObjectStore,
    metadata: Option<MetadataStore>,
    pre_stages: Vec<Arc<dyn PreStage>>,
    post_stages: Vec<Arc<dyn PostStage>>,
}

impl IngestPipeline {
    pub fn new(store: ObjectStore, metadata: Option<MetadataStore>) -> Self {
        Self {
            store,
            metadata,
            pre_stages: Vec::new(),
            post_stages: Vec::new(),
        }
    }

    pub fn with_pre_stages(mut self, stages: Vec<Arc<dyn PreStage>>) -> Self {
        self.pre_stages = stages;
        self
    }

    pub fn with_post_stages(mut self, stages: Vec<Arc<dyn PostStage>>) -> Self {
        self.post_stages = stages;
        self
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn metadata(&self) -> Option<&MetadataStore> {
        self.metadata.as_ref()
    }

    /// Verify, transform and persist `raw`, returning the new object id.
    pub async fn ingest(
        &self,
        raw: Vec<u8>,
        expected: &ExpectedDigests,
    ) -> Result<String, IngestError> {
        expected.verify(&raw).map_err(IngestError::DigestMismatch)?;

        let mut data = raw;
        for stage in &self.pre_stages {
            data = stage.apply(data).map_err(|source| IngestError::PreStage {
                stage: stage.name().to_string(),
                source,
            })?;
        }

        let data = Bytes::from(data);
        let id = self.store.allocate_and_write(data.clone()).await?;

        let created = match &self.metadata {
            Some(metadata) => metadata.create(&id).await.map(|_| ()),
            None => Ok(()),
        };

        let failures = self.run_post_stages(&id, data).await;

        if let Err(source) = created {
            return Err(IngestError::Metadata { id, source });
        }
        if !failures.is_empty() {
            return Err(IngestError::PostStages { id, failures });
        }
        Ok(id)
    }

    /// Run every post-stage on its own blocking task and collect all failures.
    async fn run_post_stages(&self, id: &str, data: Bytes) -> Vec<String> {
        let mut tasks = JoinSet::new();
        for stage in &self.post_stages {
            let stage = Arc::clone(stage);
            let data = data.clone();
            tasks.spawn_blocking(move || {
                stage
                    .apply(&data)
                    .map_err(|err| format!("{}: {}", stage.name(), err))
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(failure)) => failures.push(failure),
                Err(err) => failures.push(format!("post-stage task failed: {err}")),
            }
        }

        if failures.is_empty() {
            debug!(%id, stages = self.post_stages.len(), "post-stages finished");
        } else {
            failures.sort();
            warn!(%id, ?failures, "post-stages failed");
        }
        failures
    }
}
