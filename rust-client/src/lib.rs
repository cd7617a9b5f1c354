//! QuestDB access for unified solar telemetry.
//!
//! `domain` holds the row types shared by the sync service and any reader of
//! the `solar_telemetry` / `solar_events` tables; `db` holds the typed queries.

pub mod db;
pub mod domain;
