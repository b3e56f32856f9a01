//! Ferry Runtime - execution and data-transfer engine.
//!
//! This crate holds the parts of ferry that move bytes and run work:
//! the content-addressed chunk store and dedup uploader, context
//! reconstruction, the cluster seam with its Kubernetes implementation,
//! the workload lifecycle engine, credential secrets, and the dual-path
//! scheduler that picks between in-process and cluster execution.

pub mod cluster;
pub mod dedup;
pub mod engine;
pub mod local;
pub mod output;
pub mod reconstruct;
pub mod scheduler;
pub mod script;
pub mod secret;
pub mod store;
pub mod workload;

// Re-export common types
pub use cluster::{ClusterApi, KubeCluster, LogStream, MemoryCluster, WorkloadPhase};
pub use dedup::{ChunkOutcome, ChunkRemote, ChunkUploader, HttpChunkRemote, UploadSummary};
pub use engine::{EngineConfig, WorkloadEngine};
pub use local::{LocalRunner, ShellRunner};
pub use output::{CaptureSink, DigestCapture, FramedSink, OutputSink};
pub use reconstruct::{reconstruct, reconstruct_to_file, spool_to_file};
pub use scheduler::{ExecutionPath, Scheduler, SchedulerConfig};
pub use script::Script;
pub use secret::{CredentialSecret, SecretManager};
pub use store::ChunkStore;
pub use workload::WorkloadBuilder;

/// Ferry Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
