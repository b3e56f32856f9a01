//! Ferry Core - Foundational Types and Abstractions
//!
//! This module provides the types shared by the ferry server and client:
//! the error taxonomy, configuration, the operation model, registry
//! credential documents, the Docker JSON stream framing and the
//! content-defined chunker used to deduplicate build contexts.

pub mod auth;
pub mod chunking;
pub mod config;
pub mod error;
pub mod frame;
pub mod image;
pub mod operation;

// Re-export commonly used types
pub use auth::{DockerConfig, RegistryAuthHeader, RegistryConfigHeader};
pub use chunking::{ChunkDigest, ChunkManifest, Chunker, ChunkerConfig};
pub use config::{ServerConfig, StoreConfig};
pub use error::{ErrorCategory, FerryError, Result};
pub use frame::Frame;
pub use operation::{BuildOptions, OperationKind, OperationRequest, ResourceLimits};

/// Ferry version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Git commit the binaries were built from, if provided at build time.
pub const GIT_COMMIT: &str = match option_env!("FERRY_GIT_COMMIT") {
    Some(commit) => commit,
    None => "unknown",
};

/// Docker Engine API version advertised by the server.
pub const API_VERSION: &str = "1.40";
