//! commonspace core library
//!
//! Registers a batch of anatomical scans to a common template by driving
//! external registration tools stage by stage, memoizing every stage on disk.

pub mod backend;
pub mod cache;
pub mod cas;
pub mod config;
pub mod error;
pub mod fakes;
pub mod fingerprint;
pub mod graph;
pub mod job;
pub mod metrics;
pub mod obs;
pub mod pipeline;
pub mod stage;
pub mod telemetry;

pub use backend::{
    CommandBackend, ExtractionMethod, Interpolation, RegistrationBackend, ToolCommands, ToolError,
};
pub use cache::{
    ArtifactFile, CacheLookup, CachedArtifact, NullCache, PersistentCache, StageCache,
    CACHE_DIR_NAME,
};
pub use cas::fs::FsBlobStore;
pub use cas::{BlobStore, CasError, Digest};
pub use config::{EngineSettings, MAX_BRAIN_ITERATIONS};
pub use error::{PipelineError, Result};
pub use fingerprint::{StageFingerprint, ENGINE_VERSION};
pub use graph::{GraphNode, PipelineGraph};
pub use job::RegistrationJob;
pub use metrics::{RunMetrics, RunStats};
pub use pipeline::{run, PipelineEngine, RegistrationResult};
pub use stage::{OutputLayout, Stage};

/// Crate version, as reported by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
