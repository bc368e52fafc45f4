use std::path::PathBuf;

use thiserror::Error;

/// Failures in the open/load/attach lifecycle. Fatal to the handle instance;
/// the caller may retry with a different object or surface the error to an
/// operator.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to open probe object at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load probe object at {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: aya::EbpfError,
    },

    #[error("program {name} not found in probe object")]
    ProgramNotFound { name: &'static str },

    #[error("program {name} is not the expected kind: {source}")]
    ProgramKind {
        name: &'static str,
        #[source]
        source: aya::programs::ProgramError,
    },

    #[error("failed to attach program {name}: {source}")]
    Attach {
        name: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("probe object declares {count} programs, exceeding the attach cap of {cap}")]
    TooManyPrograms { count: usize, cap: usize },

    #[error("cannot {op} a handle in state {state}")]
    InvalidTransition { state: &'static str, op: &'static str },
}

/// Map-not-found and bridge-allocation failures. Transient; the host may
/// retry the operation.
#[derive(Debug, Error)]
pub enum MapError {
    #[error("map {name} not found in probe object")]
    NotFound { name: String },

    #[error("map {name} has an unexpected type: {source}")]
    Convert {
        name: String,
        #[source]
        source: aya::maps::MapError,
    },

    #[error("map operation failed: {0}")]
    Access(#[from] aya::maps::MapError),

    #[error("failed to enumerate online CPUs: {0}")]
    Io(#[from] std::io::Error),
}
