use time::OffsetDateTime;

/// Event or alarm reported by the metering API for a system.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SystemEvent {
    pub event_id: i64,
    pub event_type_id: i64,
    pub event_type_key: String,
    pub event_description: String,
    pub severity: String,
    /// Epoch seconds.
    pub started_at: Option<i64>,
    /// Epoch seconds; `None` while the event is still open.
    pub ended_at: Option<i64>,
    pub is_active: bool,
    pub device_serial: String,
}

/// A `SystemEvent` as persisted in `solar_events`.
#[derive(Debug, Clone, PartialEq)]
pub struct SolarEventRow {
    pub system_id: i64,
    /// Designated timestamp: the event start, or retrieval time for events
    /// without one.
    pub ts: OffsetDateTime,
    pub started_at: Option<OffsetDateTime>,
    pub ended_at: Option<OffsetDateTime>,
    pub retrieved_at: OffsetDateTime,
    pub event: SystemEvent,
}

impl SolarEventRow {
    pub fn new(system_id: i64, retrieved_at: OffsetDateTime, event: SystemEvent) -> Self {
        let started_at = event
            .started_at
            .and_then(|s| OffsetDateTime::from_unix_timestamp(s).ok());
        let ended_at = event
            .ended_at
            .and_then(|s| OffsetDateTime::from_unix_timestamp(s).ok());

        Self {
            system_id,
            ts: started_at.unwrap_or(retrieved_at),
            started_at,
            ended_at,
            retrieved_at,
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn open_event_uses_start_as_designated_timestamp() {
        let row = SolarEventRow::new(
            7,
            datetime!(2024-06-02 00:00:00 UTC),
            SystemEvent {
                event_id: 1,
                started_at: Some(1_717_200_000),
                ended_at: None,
                is_active: true,
                ..SystemEvent::default()
            },
        );

        assert_eq!(row.ts, datetime!(2024-06-01 00:00:00 UTC));
        assert!(row.ended_at.is_none());
    }

    #[test]
    fn event_without_start_falls_back_to_retrieval_time() {
        let retrieved_at = datetime!(2024-06-02 00:00:00 UTC);
        let row = SolarEventRow::new(7, retrieved_at, SystemEvent::default());
        assert_eq!(row.ts, retrieved_at);
        assert!(row.started_at.is_none());
    }
}
