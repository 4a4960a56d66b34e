//! ---
//! shdr_section: "02-line-codec"
//! shdr_subsection: "module"
//! shdr_type: "source"
//! shdr_scope: "code"
//! shdr_description: "Observation model and SHDR line grammar."
//! shdr_version: "v0.0.0-prealpha"
//! shdr_owner: "tbd"
//! ---
use shdr_common::time::parse_timestamp;

use crate::entries::{decode_data_set_entries, decode_table_entries};
use crate::fields::{unescape, FieldReader, SEPARATOR};
use crate::types::{
    DataSetValue, FaultState, Observation, ObservationValue, TableValue, TimeSeriesValue,
    UNAVAILABLE,
};
use crate::{CodecError, Result};

/// Timestamp prefix split off a data line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineHeader<'a> {
    /// Epoch microseconds, 0 when the line carried no timestamp.
    pub timestamp: i64,
    /// `@` duration suffix in seconds.
    pub duration: Option<f64>,
    /// Everything after the timestamp field.
    pub body: &'a str,
}

fn parse_timestamp_token(token: &str) -> Option<(i64, Option<f64>)> {
    match token.split_once('@') {
        Some((stamp, duration)) => {
            let timestamp = parse_timestamp(stamp)?;
            let duration = duration.trim().parse::<f64>().ok()?;
            Some((timestamp, Some(duration)))
        }
        None => parse_timestamp(token).map(|timestamp| (timestamp, None)),
    }
}

/// Consume a leading ISO-8601 timestamp (with optional `@duration`) when present.
pub fn split_timestamp(line: &str) -> LineHeader<'_> {
    let line = line.trim_end_matches(['\r', '\n']);
    if let Some((token, body)) = line.split_once(SEPARATOR) {
        if let Some((timestamp, duration)) = parse_timestamp_token(token) {
            return LineHeader {
                timestamp,
                duration,
                body,
            };
        }
    }
    LineHeader {
        timestamp: 0,
        duration: None,
        body: line,
    }
}

/// Split a raw key token into device qualifier and key, unescaping both.
fn split_device(token: &str) -> (Option<String>, String) {
    match token.split_once(':') {
        Some((device, key)) if !device.is_empty() && !key.is_empty() => (
            Some(unescape(device).into_owned()),
            unescape(key).into_owned(),
        ),
        _ => (None, unescape(token).into_owned()),
    }
}

/// Device qualifier and key of the first observation on a data line.
pub fn leading_key(line: &str) -> Option<(Option<String>, String)> {
    let header = split_timestamp(line);
    let token = FieldReader::new(header.body).next_raw()?.trim();
    if token.is_empty() {
        return None;
    }
    Some(split_device(token))
}

struct Keyed<'a> {
    header: LineHeader<'a>,
    device: Option<String>,
    key: String,
    reader: FieldReader<'a>,
}

impl<'a> Keyed<'a> {
    fn open(line: &'a str) -> Result<Self> {
        let header = split_timestamp(line);
        if header.body.trim().is_empty() {
            return Err(CodecError::EmptyLine);
        }
        let mut reader = FieldReader::new(header.body);
        let token = reader.next_raw().map(str::trim).unwrap_or_default();
        if token.is_empty() {
            return Err(CodecError::MissingKey);
        }
        let (device, key) = split_device(token);
        Ok(Self {
            header,
            device,
            key,
            reader,
        })
    }

    fn required(&mut self, field: &'static str) -> Result<String> {
        self.reader.next_field().ok_or_else(|| CodecError::MissingField {
            key: self.key.clone(),
            field,
        })
    }

    fn remainder(&mut self, field: &'static str) -> Result<String> {
        self.reader
            .remainder()
            .map(|raw| unescape(raw).into_owned())
            .ok_or_else(|| CodecError::MissingField {
                key: self.key.clone(),
                field,
            })
    }

    fn finish(self, value: ObservationValue) -> Observation {
        Observation {
            key: self.key,
            device: self.device,
            timestamp: self.header.timestamp,
            duration: self.header.duration,
            value,
        }
    }
}

/// Decode a plain data item line, including batched `key|value|key|value` lines.
pub fn decode_data_items(line: &str) -> Result<Vec<Observation>> {
    let header = split_timestamp(line);
    if header.body.trim().is_empty() {
        return Err(CodecError::EmptyLine);
    }
    let mut reader = FieldReader::new(header.body);
    let mut observations = Vec::new();

    while let Some(token) = reader.next_raw() {
        let token = token.trim();
        if token.is_empty() {
            return Err(CodecError::MissingKey);
        }
        let (device, key) = split_device(token);
        let value = reader.next_field().ok_or_else(|| CodecError::MissingField {
            key: key.clone(),
            field: "value",
        })?;
        observations.push(Observation {
            key,
            device,
            timestamp: header.timestamp,
            duration: header.duration,
            value: ObservationValue::Value(value),
        });
    }

    Ok(observations)
}

/// Decode one condition fault state line.
///
/// Missing trailing fields decode as empty strings; the message keeps any
/// further separators.
pub fn decode_condition(line: &str) -> Result<Observation> {
    let mut keyed = Keyed::open(line)?;
    let level = keyed.required("level")?.parse()?;
    let mut state = FaultState::new(level);
    state.native_code = keyed.reader.next_field().unwrap_or_default();
    state.native_severity = keyed.reader.next_field().unwrap_or_default();
    state.qualifier = keyed.reader.next_field().unwrap_or_default();
    state.message = keyed
        .reader
        .remainder()
        .map(|raw| unescape(raw).into_owned())
        .unwrap_or_default();
    Ok(keyed.finish(ObservationValue::Condition(vec![state])))
}

/// Decode a data set line.
pub fn decode_data_set(line: &str) -> Result<Observation> {
    let mut keyed = Keyed::open(line)?;
    let text = keyed.remainder("entries")?;
    let value = if text.trim() == UNAVAILABLE {
        DataSetValue::Unavailable
    } else {
        DataSetValue::Entries(decode_data_set_entries(&text)?)
    };
    Ok(keyed.finish(ObservationValue::DataSet(value)))
}

/// Decode a table line.
pub fn decode_table(line: &str) -> Result<Observation> {
    let mut keyed = Keyed::open(line)?;
    let text = keyed.remainder("entries")?;
    let value = if text.trim() == UNAVAILABLE {
        TableValue::Unavailable
    } else {
        TableValue::Entries(decode_table_entries(&text)?)
    };
    Ok(keyed.finish(ObservationValue::Table(value)))
}

fn parse_number<T: std::str::FromStr>(field: &'static str, token: &str) -> Result<T> {
    token
        .trim()
        .parse::<T>()
        .map_err(|_| CodecError::InvalidNumber {
            field,
            value: token.to_owned(),
        })
}

/// Decode a time series line: `key|count|rate|samples`.
pub fn decode_time_series(line: &str) -> Result<Observation> {
    let mut keyed = Keyed::open(line)?;
    let count_token = keyed.required("sample count")?;
    if count_token.trim() == UNAVAILABLE {
        return Ok(keyed.finish(ObservationValue::TimeSeries(TimeSeriesValue::Unavailable)));
    }
    let declared: usize = parse_number("sample count", &count_token)?;
    let rate_token = keyed.required("sample rate")?;
    let sample_rate = if rate_token.trim().is_empty() {
        None
    } else {
        Some(parse_number::<f64>("sample rate", &rate_token)?)
    };
    let samples = keyed
        .reader
        .remainder()
        .unwrap_or_default()
        .split_whitespace()
        .map(|token| parse_number::<f64>("sample", token))
        .collect::<Result<Vec<_>>>()?;
    if samples.len() != declared {
        return Err(CodecError::SampleCountMismatch {
            declared,
            actual: samples.len(),
        });
    }
    Ok(keyed.finish(ObservationValue::TimeSeries(TimeSeriesValue::Samples {
        sample_rate,
        samples,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConditionLevel, DataSetEntry, TableEntry};

    const TS: &str = "2024-01-01T00:00:00.000000Z";
    const TS_MICROS: i64 = 1_704_067_200_000_000;

    #[test]
    fn timestamp_is_optional() {
        let header = split_timestamp("avail|AVAILABLE");
        assert_eq!(header.timestamp, 0);
        assert_eq!(header.body, "avail|AVAILABLE");

        let line = format!("{TS}|avail|AVAILABLE\r\n");
        let header = split_timestamp(&line);
        assert_eq!(header.timestamp, TS_MICROS);
        assert_eq!(header.body, "avail|AVAILABLE");
    }

    #[test]
    fn duration_suffix_is_parsed() {
        let line = format!("{TS}@12.5|load|3");
        let header = split_timestamp(&line);
        assert_eq!(header.timestamp, TS_MICROS);
        assert_eq!(header.duration, Some(12.5));
    }

    #[test]
    fn batched_items_share_the_header() {
        let items = decode_data_items(&format!("{TS}|avail|AVAILABLE|mill:exec|ACTIVE")).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], Observation::value("avail", "AVAILABLE").at(TS_MICROS));
        assert_eq!(
            items[1],
            Observation::value("exec", "ACTIVE")
                .at(TS_MICROS)
                .with_device("mill")
        );
    }

    #[test]
    fn batched_items_require_values() {
        assert_eq!(
            decode_data_items("avail|AVAILABLE|exec"),
            Err(CodecError::MissingField {
                key: "exec".into(),
                field: "value"
            })
        );
        assert_eq!(decode_data_items(&format!("{TS}|")), Err(CodecError::EmptyLine));
    }

    #[test]
    fn escaped_pipes_are_restored() {
        let items = decode_data_items("program|O1234\\|rev2").unwrap();
        assert_eq!(items[0].value, ObservationValue::Value("O1234|rev2".into()));

        let items = decode_data_items("odd\\|key|1|next|2").unwrap();
        assert_eq!(items[0].key, "odd|key");
        assert_eq!(items[1].key, "next");
        assert_eq!(
            leading_key("mill:odd\\|key|1"),
            Some((Some("mill".into()), "odd|key".into()))
        );
    }

    #[test]
    fn leading_key_skips_timestamp_and_device() {
        assert_eq!(
            leading_key(&format!("{TS}|mill:avail|AVAILABLE")),
            Some((Some("mill".into()), "avail".into()))
        );
        assert_eq!(leading_key("avail"), Some((None, "avail".into())));
        assert_eq!(leading_key(""), None);
    }

    #[test]
    fn condition_fields() {
        let observation =
            decode_condition("system|FAULT|E101|2|HIGH|Spindle \\| overload|extra").unwrap();
        let ObservationValue::Condition(states) = &observation.value else {
            panic!("expected condition");
        };
        assert_eq!(states[0].level, ConditionLevel::Fault);
        assert_eq!(states[0].native_code, "E101");
        assert_eq!(states[0].native_severity, "2");
        assert_eq!(states[0].qualifier, "HIGH");
        assert_eq!(states[0].message, "Spindle | overload|extra");
    }

    #[test]
    fn condition_with_short_fields_and_bad_level() {
        let observation = decode_condition("system|normal").unwrap();
        assert_eq!(
            observation,
            Observation::condition("system", FaultState::new(ConditionLevel::Normal))
        );
        assert!(matches!(
            decode_condition("system|BROKEN||||"),
            Err(CodecError::InvalidLevel(_))
        ));
        assert!(matches!(
            decode_condition("system"),
            Err(CodecError::MissingField { .. })
        ));
    }

    #[test]
    fn data_set_and_table() {
        assert_eq!(
            decode_data_set("vars|a=1 b='two words'").unwrap(),
            Observation::data_set(
                "vars",
                vec![
                    DataSetEntry::new("a", "1"),
                    DataSetEntry::new("b", "two words")
                ]
            )
        );
        assert_eq!(
            decode_data_set("vars|UNAVAILABLE").unwrap().value,
            ObservationValue::DataSet(DataSetValue::Unavailable)
        );
        assert_eq!(
            decode_table("tools|T1={len=1 dia=2}").unwrap(),
            Observation::table("tools", vec![TableEntry::new("T1", [("len", "1"), ("dia", "2")])])
        );
    }

    #[test]
    fn time_series() {
        assert_eq!(
            decode_time_series("amps|3|100|1 2.5 -3").unwrap(),
            Observation::time_series("amps", Some(100.0), vec![1.0, 2.5, -3.0])
        );
        assert_eq!(
            decode_time_series("amps|2||1 2").unwrap(),
            Observation::time_series("amps", None, vec![1.0, 2.0])
        );
        assert!(decode_time_series("amps|UNAVAILABLE").unwrap().is_unavailable());
        assert_eq!(
            decode_time_series("amps|3|100|1 2"),
            Err(CodecError::SampleCountMismatch {
                declared: 3,
                actual: 2
            })
        );
        assert!(matches!(
            decode_time_series("amps|x|100|1"),
            Err(CodecError::InvalidNumber { .. })
        ));
    }
}
