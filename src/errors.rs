//! Typed error hierarchy for buildyard.
//!
//! Four top-level enums cover the subsystems:
//! - `ModelError`: model store lookups and snapshot persistence
//! - `JobError`: job manager lookups
//! - `AssetError`: on-demand asset resolution and transformation
//! - `ConfigError`: startup configuration validation (fatal)

use std::path::PathBuf;

use thiserror::Error;

/// Errors from the model store.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Unknown repo: {repo}")]
    RepoNotFound { repo: String },

    #[error("Unknown branch {branch} for repo {repo}")]
    BranchNotFound { repo: String, branch: String },

    #[error("Failed to read snapshot at {path}: {source}")]
    SnapshotRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode snapshot at {path}: {source}")]
    SnapshotDecode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to write snapshot at {path}: {source}")]
    SnapshotWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode snapshot: {0}")]
    SnapshotEncode(#[source] serde_json::Error),
}

/// Errors from the job manager.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Unknown job id {id}")]
    JobNotFound { id: u64 },

    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Errors from the asset cache.
#[derive(Debug, Error)]
pub enum AssetError {
    #[error("No source file for {path}")]
    NotFound { path: String },

    #[error("Invalid asset path {path}")]
    InvalidPath { path: String },

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to transform {path}: {source:#}")]
    TransformFailed {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

/// Startup configuration errors. Any of these aborts the process before the
/// listener binds.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid port {port}: must be between 1 and 65535")]
    InvalidPort { port: u16 },

    #[error("Root directory {path} does not exist or is not a directory")]
    InvalidRoot { path: PathBuf },

    #[error("Invalid {field}: {message}")]
    InvalidValue { field: &'static str, message: String },

    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}
