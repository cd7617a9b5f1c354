mod solar_event;
mod solar_telemetry;

pub use solar_event::{SolarEventRow, SystemEvent};
pub use solar_telemetry::{MergedRecord, SolarTelemetryRow};
