//! Post-run validation of the collected time series.
//!
//! After a fill, the LN2 temperature of every filled camera should be at
//! or below where it started. The external collector writes the dataset
//! next to the log as JSON rows keyed by timestamp; this module only
//! judges it.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use crate::fill::EventTimes;

/// Minimum data collected after the run before the temperature check is
/// meaningful.
const MIN_EXTRA_TIME_MS: i64 = 3 * 60 * 1000;

/// One sample of the post-run dataset. Besides the timestamp, columns are
/// flat `temp_<camera>_ln2` values.
#[derive(Debug, Clone, Deserialize)]
pub struct DataRow {
    pub time_ms: i64,
    #[serde(flatten)]
    pub values: HashMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
    Passed,
    /// Not an error: there was nothing to validate or not enough of it.
    Skipped(String),
    Failed(String),
}

pub fn load_data(path: &Path) -> anyhow::Result<Vec<DataRow>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading data file {}", path.display()))?;
    let rows: Vec<DataRow> =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    Ok(rows)
}

/// Validates the post-fill dataset against the event-time record.
pub fn validate_fill(
    event_times: &EventTimes,
    cameras: &[String],
    rows: &[DataRow],
    max_temperature_increase: f64,
) -> Validation {
    log::info!("Validating post-fill data.");

    // No fill phase ran: nothing to check.
    if event_times.fill_start_ms.is_none() || event_times.fill_complete_ms.is_none() {
        return Validation::Skipped("no fill phase was run".into());
    }

    if rows.is_empty() {
        log::error!("No post-fill data was collected.");
        return Validation::Skipped("no post-fill data was collected".into());
    }

    let mut rows: Vec<&DataRow> = rows.iter().collect();
    rows.sort_by_key(|row| row.time_ms);

    let end_ms = event_times.end_ms.unwrap_or(i64::MAX);
    let last_ms = rows.last().map(|row| row.time_ms).unwrap_or(i64::MIN);
    if last_ms.saturating_sub(end_ms) < MIN_EXTRA_TIME_MS {
        log::warn!(
            "Not enough data collected after the fill to check the LN2 \
             temperature difference."
        );
        return Validation::Skipped("insufficient post-fill data".into());
    }

    for camera in cameras {
        let column = format!("temp_{camera}_ln2");
        let series: Vec<f64> = rows
            .iter()
            .filter_map(|row| row.values.get(&column).copied())
            .collect();

        let (Some(&first), Some(&last)) = (series.first(), series.last()) else {
            log::warn!("No {column:?} column in the post-fill data.");
            continue;
        };

        if last > first {
            let message = format!(
                "LN2 temperature for camera {camera} increased from {first:.2} to \
                 {last:.2} degC after the fill."
            );
            if last > first + max_temperature_increase {
                log::error!("{message}");
                return Validation::Failed(message);
            }
            log::warn!("{message}");
        }
    }

    Validation::Passed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(time_ms: i64, temps: &[(&str, f64)]) -> DataRow {
        DataRow {
            time_ms,
            values: temps
                .iter()
                .map(|(camera, temp)| (format!("temp_{camera}_ln2"), *temp))
                .collect(),
        }
    }

    fn filled_events(end_ms: i64) -> EventTimes {
        EventTimes {
            start_ms: Some(0),
            fill_start_ms: Some(end_ms - 400_000),
            fill_complete_ms: Some(end_ms - 10_000),
            end_ms: Some(end_ms),
            ..EventTimes::default()
        }
    }

    #[test]
    fn passes_trivially_without_a_fill_phase() {
        let events = EventTimes {
            purge_start_ms: Some(1),
            purge_complete_ms: Some(2),
            end_ms: Some(3),
            ..EventTimes::default()
        };
        let rows = vec![row(10, &[("r1", -180.0)])];
        assert!(matches!(
            validate_fill(&events, &["r1".into()], &rows, 0.0),
            Validation::Skipped(_)
        ));
    }

    #[test]
    fn insufficient_trailing_data_is_a_warning_not_a_failure() {
        let events = filled_events(1_000_000);
        // Last sample only one minute after end.
        let rows = vec![
            row(900_000, &[("r1", -170.0)]),
            row(1_060_000, &[("r1", -150.0)]),
        ];
        assert!(matches!(
            validate_fill(&events, &["r1".into()], &rows, 0.0),
            Validation::Skipped(_)
        ));
    }

    #[test]
    fn temperature_drop_passes() {
        let events = filled_events(1_000_000);
        let rows = vec![
            row(900_000, &[("r1", -160.0), ("b1", -165.0)]),
            row(1_200_000, &[("r1", -181.0), ("b1", -182.5)]),
        ];
        assert_eq!(
            validate_fill(
                &events,
                &["r1".into(), "b1".into()],
                &rows,
                0.0
            ),
            Validation::Passed
        );
    }

    #[test]
    fn temperature_rise_beyond_threshold_fails() {
        let events = filled_events(1_000_000);
        let rows = vec![
            row(900_000, &[("r1", -180.0)]),
            row(1_200_000, &[("r1", -170.0)]),
        ];
        match validate_fill(&events, &["r1".into()], &rows, 0.5) {
            Validation::Failed(message) => assert!(message.contains("r1")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn small_rise_within_threshold_is_tolerated() {
        let events = filled_events(1_000_000);
        let rows = vec![
            row(900_000, &[("r1", -180.0)]),
            row(1_200_000, &[("r1", -179.5)]),
        ];
        assert_eq!(
            validate_fill(&events, &["r1".into()], &rows, 1.0),
            Validation::Passed
        );
    }

    #[test]
    fn unsorted_rows_are_ordered_by_time() {
        let events = filled_events(1_000_000);
        let rows = vec![
            row(1_200_000, &[("r1", -181.0)]),
            row(900_000, &[("r1", -160.0)]),
        ];
        assert_eq!(
            validate_fill(&events, &["r1".into()], &rows, 0.0),
            Validation::Passed
        );
    }
}
