pub mod pipeline;
pub mod config;
pub mod sources;
pub mod sinks;
pub mod transform;
pub mod trigger;
pub mod observability;
pub mod metrics_server;

pub use pipeline::{SyncContext, SyncController, SyncError};
