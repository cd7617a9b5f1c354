mod telemetry_queries;

pub use telemetry_queries::{existing_end_ats, latest_end_at};
