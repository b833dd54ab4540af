//! Payload stages run around persistence.
//!
//! Pre-stages rewrite the payload before it is stored, in registration order.
//! Post-stages only observe the stored bytes and run concurrently.

use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Failure reported by a stage.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct StageError(pub String);

impl StageError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

pub trait PreStage: Send + Sync {
    fn name(&self) -> &str;

    /// Consume the payload and return the transformed one.
    fn apply(&self, data: Vec<u8>) -> Result<Vec<u8>, StageError>;
}

pub trait PostStage: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, data: &[u8]) -> Result<(), StageError>;
}

/// Upper-cases the payload. UTF-8 text is upper-cased fully, anything else
/// only in its ASCII range.
#[derive(Debug, Default)]
pub struct Uppercase;

impl PreStage for Uppercase {
    fn name(&self) -> &str {
        "uppercase"
    }

    fn apply(&self, data: Vec<u8>) -> Result<Vec<u8>, StageError> {
        match String::from_utf8(data) {
            Ok(text) => Ok(text.to_uppercase().into_bytes()),
            Err(err) => {
                let mut raw = err.into_bytes();
                raw.make_ascii_uppercase();
                Ok(raw)
            }
        }
    }
}

const PREVIEW_LEN: usize = 64;

/// Logs the size and a short preview of every stored payload.
#[derive(Debug, Default)]
pub struct LogPayload;

impl PostStage for LogPayload {
    fn name(&self) -> &str {
        "log"
    }

    fn apply(&self, data: &[u8]) -> Result<(), StageError> {
        let preview = String::from_utf8_lossy(&data[..data.len().min(PREVIEW_LEN)]);
        info!(size = data.len(), %preview, "stored payload");
        Ok(())
    }
}

#[derive(Debug, Error)]
#[error("unknown {kind} stage `{name}`")]
pub struct UnknownStage {
    pub kind: &'static str,
    pub name: String,
}

pub fn pre_stage(name: &str) -> Result<Arc<dyn PreStage>, UnknownStage> {
    match name {
        "uppercase" => Ok(Arc::new(Uppercase)),
        other => Err(UnknownStage {
            kind: "pre",
            name: other.to_string(),
        }),
    }
}

pub fn post_stage(name: &str) -> Result<Arc<dyn PostStage>, UnknownStage> {
    match name {
        "log" => Ok(Arc::new(LogPayload)),
        other => Err(UnknownStage {
            kind: "post",
            name: other.to_string(),
        }),
    }
}

/// Resolve configured pre-stage names, keeping their order.
pub fn pre_stages(names: &[String]) -> Result<Vec<Arc<dyn PreStage>>, UnknownStage> {
    names.iter().map(|name| pre_stage(name)).collect()
}

pub fn post_stages(names: &[String]) -> Result<Vec<Arc<dyn PostStage>>, UnknownStage> {
    names.iter().map(|name| post_stage(name)).collect()
}
