//! Keys used by admission control to bucket activity.

use std::{fmt, net::IpAddr};

/// The four operations exposed over HTTP, each throttled independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Upload,
    Download,
    Delete,
    Info,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Upload => "upload",
            OperationKind::Download => "download",
            OperationKind::Delete => "delete",
            OperationKind::Info => "info",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Throttling bucket: one client address performing one kind of operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientOperationKey {
    pub client: IpAddr,
    pub operation: OperationKind,
}

impl ClientOperationKey {
    pub fn new(client: IpAddr, operation: OperationKind) -> Self {
        Self { client, operation }
    }
}
