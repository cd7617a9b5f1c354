use std::collections::{BTreeMap, BTreeSet};

use rust_client::domain::MergedRecord;

use crate::sources::{RawInterval, TelemetrySource};

impl TelemetrySource {
    /// Writes this source's measures into `record`, leaving every other
    /// field untouched. Absent measures become zero.
    pub fn merge_into(self, interval: &RawInterval, record: &mut MergedRecord) {
        match self {
            Self::Production => {
                record.production_wh = interval.wh_del.unwrap_or_default();
                record.production_devices = interval.devices_reporting.unwrap_or_default();
            }
            Self::Consumption => {
                record.consumption_wh = interval.enwh.unwrap_or_default();
                record.consumption_devices = interval.devices_reporting.unwrap_or_default();
            }
            Self::Battery => {
                let charge = interval.charge.as_ref();
                record.battery_charge_wh = charge.and_then(|c| c.enwh).unwrap_or_default();
                record.battery_devices = charge.and_then(|c| c.devices_reporting).unwrap_or_default();
                record.battery_discharge_wh = interval
                    .discharge
                    .as_ref()
                    .and_then(|d| d.enwh)
                    .unwrap_or_default();
                record.battery_soc_percent = interval
                    .soc
                    .as_ref()
                    .and_then(|s| s.percent)
                    .unwrap_or_default();
            }
            Self::GridImport => record.grid_import_wh = interval.wh_imported.unwrap_or_default(),
            Self::GridExport => record.grid_export_wh = interval.wh_exported.unwrap_or_default(),
        }
    }
}

/// Union-merges per-source intervals into one timeline.
///
/// Rules:
/// - one record per distinct `end_at`, ascending;
/// - intervals without `end_at` are dropped;
/// - fields no source reported stay zero;
/// - the result does not depend on the order sources are supplied in.
pub fn merge_sources<'a, I>(sources: I) -> Vec<MergedRecord>
where
    I: IntoIterator<Item = (TelemetrySource, &'a [RawInterval])>,
{
    let mut merged: BTreeMap<i64, MergedRecord> = BTreeMap::new();
    let mut dropped = 0usize;

    for (source, intervals) in sources {
        for interval in intervals {
            let Some(end_at) = interval.end_at else {
                dropped += 1;
                continue;
            };
            let record = merged
                .entry(end_at)
                .or_insert_with(|| MergedRecord::new(end_at));
            source.merge_into(interval, record);
        }
    }

    if dropped > 0 {
        tracing::debug!(dropped, "dropped intervals without end_at");
    }
    merged.into_values().collect()
}

pub fn merge_intervals(intervals: &BTreeMap<TelemetrySource, Vec<RawInterval>>) -> Vec<MergedRecord> {
    merge_sources(intervals.iter().map(|(source, list)| (*source, list.as_slice())))
}

pub fn stamp_battery_mode(records: &mut [MergedRecord], mode: Option<&str>) {
    let mode = mode.unwrap_or_default();
    for record in records {
        record.battery_mode = mode.to_string();
    }
}

/// Keeps records strictly newer than the watermark.
pub fn filter_after_watermark(records: Vec<MergedRecord>, watermark: Option<i64>) -> Vec<MergedRecord> {
    match watermark {
        Some(watermark) => records.into_iter().filter(|r| r.end_at > watermark).collect(),
        None => records,
    }
}

/// Drops records whose `end_at` is already stored.
pub fn filter_existing(records: Vec<MergedRecord>, existing: &BTreeSet<i64>) -> Vec<MergedRecord> {
    records
        .into_iter()
        .filter(|r| !existing.contains(&r.end_at))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{BatteryFlow, StateOfCharge};

    fn at(end_at: i64) -> RawInterval {
        RawInterval {
            end_at: Some(end_at),
            ..RawInterval::default()
        }
    }

    fn sample() -> Vec<(TelemetrySource, Vec<RawInterval>)> {
        vec![
            (
                TelemetrySource::Production,
                vec![
                    RawInterval { wh_del: Some(100.0), devices_reporting: Some(12), ..at(1_800) },
                    RawInterval { wh_del: Some(50.0), devices_reporting: Some(12), ..at(900) },
                ],
            ),
            (
                TelemetrySource::Consumption,
                vec![RawInterval { enwh: Some(40.0), devices_reporting: Some(1), ..at(900) }],
            ),
            (
                TelemetrySource::Battery,
                vec![RawInterval {
                    charge: Some(BatteryFlow { enwh: Some(10.0), devices_reporting: Some(2) }),
                    discharge: Some(BatteryFlow { enwh: Some(3.0), devices_reporting: Some(2) }),
                    soc: Some(StateOfCharge { percent: Some(55.0), devices_reporting: Some(2) }),
                    ..at(2_700)
                }],
            ),
            (
                TelemetrySource::GridImport,
                vec![RawInterval { wh_imported: Some(7.0), ..at(1_800) }, RawInterval::default()],
            ),
            (TelemetrySource::GridExport, vec![RawInterval { wh_exported: Some(9.0), ..at(900) }]),
        ]
    }

    fn merge_in_order(order: &[usize]) -> Vec<MergedRecord> {
        let sources = sample();
        merge_sources(order.iter().map(|i| (sources[*i].0, sources[*i].1.as_slice())))
    }

    #[test]
    fn merge_is_independent_of_source_order() {
        let expected = merge_in_order(&[0, 1, 2, 3, 4]);
        for order in [[4, 3, 2, 1, 0], [2, 0, 4, 1, 3], [1, 4, 0, 3, 2]] {
            assert_eq!(merge_in_order(&order), expected);
        }
    }

    #[test]
    fn output_is_sorted_unique_and_skips_missing_end_at() {
        let merged = merge_in_order(&[0, 1, 2, 3, 4]);
        let keys: Vec<_> = merged.iter().map(|r| r.end_at).collect();
        assert_eq!(keys, vec![900, 1_800, 2_700]);

        let first = &merged[0];
        assert_eq!(first.production_wh, 50.0);
        assert_eq!(first.consumption_wh, 40.0);
        assert_eq!(first.grid_export_wh, 9.0);
        assert_eq!(first.grid_import_wh, 0.0);
        assert_eq!(first.battery_devices, 0);
    }

    #[test]
    fn production_and_battery_share_one_record() {
        let production = [RawInterval { wh_del: Some(250.0), devices_reporting: Some(10), ..at(500) }];
        let battery = [RawInterval {
            charge: Some(BatteryFlow { enwh: Some(80.0), devices_reporting: Some(1) }),
            discharge: Some(BatteryFlow { enwh: Some(5.0), devices_reporting: Some(1) }),
            soc: Some(StateOfCharge { percent: Some(71.0), devices_reporting: Some(1) }),
            ..at(500)
        }];

        let merged = merge_sources([
            (TelemetrySource::Production, &production[..]),
            (TelemetrySource::Battery, &battery[..]),
        ]);

        assert_eq!(merged.len(), 1);
        let r = &merged[0];
        assert_eq!(r.end_at, 500);
        assert_eq!(r.production_wh, 250.0);
        assert_eq!(r.production_devices, 10);
        assert_eq!(r.battery_charge_wh, 80.0);
        assert_eq!(r.battery_discharge_wh, 5.0);
        assert_eq!(r.battery_soc_percent, 71.0);
        assert_eq!(r.battery_devices, 1);
        assert_eq!(r.consumption_wh, 0.0);
        assert_eq!(r.grid_import_wh, 0.0);
        assert_eq!(r.grid_export_wh, 0.0);
        assert_eq!(r.battery_mode, "");
    }

    #[test]
    fn watermark_filter_is_strict() {
        let records: Vec<_> = [900, 1_000, 1_100, 1_200].into_iter().map(MergedRecord::new).collect();
        let kept: Vec<_> = filter_after_watermark(records.clone(), Some(1_000))
            .iter()
            .map(|r| r.end_at)
            .collect();
        assert_eq!(kept, vec![1_100, 1_200]);
        assert_eq!(filter_after_watermark(records, None).len(), 4);
    }

    #[test]
    fn existing_keys_are_dropped() {
        let records: Vec<_> = [900, 1_800, 2_700].into_iter().map(MergedRecord::new).collect();
        let existing = BTreeSet::from([900, 2_700]);
        let kept = filter_existing(records, &existing);
        assert_eq!(kept, vec![MergedRecord::new(1_800)]);
    }

    #[test]
    fn battery_mode_is_stamped_on_every_record() {
        let mut records: Vec<_> = [900, 1_800].into_iter().map(MergedRecord::new).collect();
        stamp_battery_mode(&mut records, Some("backup_only"));
        assert!(records.iter().all(|r| r.battery_mode == "backup_only"));

        stamp_battery_mode(&mut records, None);
        assert!(records.iter().all(|r| r.battery_mode.is_empty()));
    }
}
