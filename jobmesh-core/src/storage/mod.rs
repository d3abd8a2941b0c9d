//! Job namespace layout and job-scoped store access

pub mod job_storage;
pub mod node_path;

pub use job_storage::JobNodeStorage;
pub use node_path::{parse_item, path, JobNodePath};
