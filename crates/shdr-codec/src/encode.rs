//! ---
//! shdr_section: "02-line-codec"
//! shdr_subsection: "module"
//! shdr_type: "source"
//! shdr_scope: "code"
//! shdr_description: "Observation model and SHDR line grammar."
//! shdr_version: "v0.0.0-prealpha"
//! shdr_owner: "tbd"
//! ---
use indexmap::IndexMap;
use shdr_common::time::format_timestamp;

use crate::entries::{encode_data_set_entries, encode_table_entries};
use crate::fields::escape;
use crate::types::{
    ConditionLevel, DataSetValue, FaultState, Observation, ObservationValue, TableValue,
    TimeSeriesValue, UNAVAILABLE,
};

/// Timestamp field (with a trailing separator), empty when the timestamp is unset.
pub(crate) fn timestamp_prefix(timestamp: i64, duration: Option<f64>) -> String {
    if timestamp == 0 {
        return String::new();
    }
    match duration {
        Some(duration) => format!("{}@{}|", format_timestamp(timestamp), duration),
        None => format!("{}|", format_timestamp(timestamp)),
    }
}

fn header(observation: &Observation) -> String {
    format!(
        "{}{}",
        timestamp_prefix(observation.timestamp, observation.duration),
        escape(&observation.qualified_key())
    )
}

/// Encode plain data items, coalescing items that share a timestamp onto one line.
///
/// Lines appear in the order each timestamp was first seen. Observations of other
/// kinds are skipped.
pub fn encode_data_items(observations: &[Observation]) -> Vec<String> {
    let mut groups: IndexMap<(i64, Option<u64>), String> = IndexMap::new();
    for observation in observations {
        let ObservationValue::Value(value) = &observation.value else {
            continue;
        };
        let group_key = (observation.timestamp, observation.duration.map(f64::to_bits));
        let pair = format!("{}|{}", escape(&observation.qualified_key()), escape(value));
        groups
            .entry(group_key)
            .and_modify(|line| {
                line.push('|');
                line.push_str(&pair);
            })
            .or_insert_with(|| {
                format!(
                    "{}{}",
                    timestamp_prefix(observation.timestamp, observation.duration),
                    pair
                )
            });
    }
    groups.into_values().collect()
}

fn encode_fault_state(header: &str, state: &FaultState) -> String {
    if state.level == ConditionLevel::Unavailable {
        return format!("{}|{}||||", header, state.level);
    }
    format!(
        "{}|{}|{}|{}|{}|{}",
        header,
        state.level,
        escape(&state.native_code),
        escape(&state.native_severity),
        escape(&state.qualifier),
        escape(&state.message)
    )
}

/// Encode a single observation. Conditions produce one line per fault state.
pub fn encode_observation(observation: &Observation) -> Vec<String> {
    let header = header(observation);
    match &observation.value {
        ObservationValue::Value(_) => encode_data_items(std::slice::from_ref(observation)),
        ObservationValue::Condition(states) if states.is_empty() => {
            vec![encode_fault_state(&header, &FaultState::new(ConditionLevel::Normal))]
        }
        ObservationValue::Condition(states) => states
            .iter()
            .map(|state| encode_fault_state(&header, state))
            .collect(),
        ObservationValue::DataSet(DataSetValue::Entries(entries)) => {
            vec![format!("{}|{}", header, escape(&encode_data_set_entries(entries)))]
        }
        ObservationValue::Table(TableValue::Entries(rows)) => {
            vec![format!("{}|{}", header, escape(&encode_table_entries(rows)))]
        }
        ObservationValue::TimeSeries(TimeSeriesValue::Samples {
            sample_rate,
            samples,
        }) => {
            let rate = sample_rate.map(|rate| rate.to_string()).unwrap_or_default();
            let values = samples
                .iter()
                .map(f64::to_string)
                .collect::<Vec<_>>()
                .join(" ");
            vec![format!("{}|{}|{}|{}", header, samples.len(), rate, values)]
        }
        ObservationValue::DataSet(DataSetValue::Unavailable)
        | ObservationValue::Table(TableValue::Unavailable)
        | ObservationValue::TimeSeries(TimeSeriesValue::Unavailable) => {
            vec![format!("{}|{}", header, UNAVAILABLE)]
        }
    }
}

/// Encode a batch: data items coalesce by timestamp, every other observation
/// follows in input order.
pub fn encode_observations(observations: &[Observation]) -> Vec<String> {
    let mut lines = encode_data_items(observations);
    lines.extend(
        observations
            .iter()
            .filter(|observation| !matches!(observation.value, ObservationValue::Value(_)))
            .flat_map(encode_observation),
    );
    lines
}
