//! Types shared across the firesnap workspace.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Guest memory size used when a request does not specify one, in MiB.
pub const DEFAULT_MEM_SIZE_MIB: u32 = 256;
/// vCPU count used when a request does not specify one.
pub const DEFAULT_VCPU_COUNT: u32 = 1;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("resource exhausted: {0}")]
    Resource(String),

    #[error("{service} request failed: {message}")]
    External {
        service: &'static str,
        message: String,
    },

    #[error("{operation} {}: {source}", .path.display())]
    Io {
        operation: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` failed: {message}")]
    Command { command: String, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("canceled: {0}")]
    Canceled(String),
}

impl Error {
    pub fn io(
        operation: impl Into<String>,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Error::Io {
            operation: operation.into(),
            path: path.into(),
            source,
        }
    }

    pub fn external(service: &'static str, message: impl Into<String>) -> Self {
        Error::External {
            service,
            message: message.into(),
        }
    }

    pub fn command(command: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Command {
            command: command.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Machine shape of a microVM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            vcpu_count: DEFAULT_VCPU_COUNT,
            mem_size_mib: DEFAULT_MEM_SIZE_MIB,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_names_operation_and_path() {
        let err = Error::io(
            "mounting ext4 on",
            "/tmp/snap",
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        let message = err.to_string();
        assert!(message.contains("mounting ext4 on"), "{message}");
        assert!(message.contains("/tmp/snap"), "{message}");
    }

    #[test]
    fn machine_config_defaults() {
        let cfg = MachineConfig::default();
        assert_eq!(cfg.mem_size_mib, 256);
        assert_eq!(cfg.vcpu_count, 1);
    }
}
