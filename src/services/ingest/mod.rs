pub mod archive;
pub mod metadata;
pub mod orchestrator;
pub mod store;
pub mod types;
pub mod writer;

pub use orchestrator::IngestOrchestrator;
pub use types::{IngestJobPublic, IngestJobRow, IngestJobStatus};
