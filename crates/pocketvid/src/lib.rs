pub mod config;
pub mod job;
pub mod preset;
pub mod error;
pub mod store;
pub mod process;
pub mod tools;
pub mod probe;
pub mod credentials;
pub mod proxy;
pub mod admission;
pub mod acquire;
pub mod transcode;
pub mod segment;
pub mod source;
pub mod sweeper;
pub mod orchestrator;

pub use config::{ConverterConfig, ProcessTimeout};
pub use error::{JobError, StoreError};
pub use job::{JobRecord, JobState, JobUpdate, OutputDescriptor, PartDescriptor};
pub use orchestrator::{Orchestrator, StatusView, Toolset};
pub use preset::{OutputFormat, QualityPreset};
pub use source::{validate_source_reference, SourceError};
pub use store::JobStore;
pub use sweeper::{RetentionSweeper, SweepReport};
