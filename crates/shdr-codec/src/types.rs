//! ---
//! shdr_section: "02-line-codec"
//! shdr_subsection: "module"
//! shdr_type: "source"
//! shdr_scope: "code"
//! shdr_description: "Observation model and SHDR line grammar."
//! shdr_version: "v0.0.0-prealpha"
//! shdr_owner: "tbd"
//! ---
use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::CodecError;

/// Token used on the wire for every unavailable value.
pub const UNAVAILABLE: &str = "UNAVAILABLE";

const FIELD_SEPARATOR: u8 = 0x1f;

/// Observation kinds in the order the adapter flushes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationKind {
    /// Plain SAMPLE/EVENT value.
    DataItem,
    /// Condition fault states.
    Condition,
    /// Time series samples.
    TimeSeries,
    /// Key/value data set.
    DataSet,
    /// Two-level key/value table.
    Table,
}

impl ObservationKind {
    /// Every kind in flush order.
    pub const ALL: [ObservationKind; 5] = [
        ObservationKind::DataItem,
        ObservationKind::Condition,
        ObservationKind::TimeSeries,
        ObservationKind::DataSet,
        ObservationKind::Table,
    ];

    /// Stable label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ObservationKind::DataItem => "data_item",
            ObservationKind::Condition => "condition",
            ObservationKind::TimeSeries => "time_series",
            ObservationKind::DataSet => "data_set",
            ObservationKind::Table => "table",
        }
    }
}

/// Digest identifying the value of a stored item, independent of its timestamp.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChangeId([u8; 32]);

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChangeId({})", &hex::encode(self.0)[..12])
    }
}

struct ChangeHasher(Sha256);

impl ChangeHasher {
    fn new() -> Self {
        Self(Sha256::new())
    }

    fn field(&mut self, value: &str) -> &mut Self {
        self.0.update(value.as_bytes());
        self.0.update([FIELD_SEPARATOR]);
        self
    }

    fn finish(self) -> ChangeId {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&self.0.finalize());
        ChangeId(bytes)
    }
}

/// Condition severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionLevel {
    /// No active fault.
    #[default]
    Normal,
    /// Warning state.
    Warning,
    /// Fault state.
    Fault,
    /// State is not known.
    Unavailable,
}

impl ConditionLevel {
    /// Wire token for the level.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionLevel::Normal => "NORMAL",
            ConditionLevel::Warning => "WARNING",
            ConditionLevel::Fault => "FAULT",
            ConditionLevel::Unavailable => UNAVAILABLE,
        }
    }
}

impl fmt::Display for ConditionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConditionLevel {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NORMAL" => Ok(ConditionLevel::Normal),
            "WARNING" => Ok(ConditionLevel::Warning),
            "FAULT" => Ok(ConditionLevel::Fault),
            "UNAVAILABLE" => Ok(ConditionLevel::Unavailable),
            _ => Err(CodecError::InvalidLevel(s.to_owned())),
        }
    }
}

/// A single active condition state.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct FaultState {
    /// Severity level.
    pub level: ConditionLevel,
    /// Controller specific code.
    pub native_code: String,
    /// Controller specific severity.
    pub native_severity: String,
    /// Qualifier such as `HIGH` or `LOW`.
    pub qualifier: String,
    /// Free text message.
    pub message: String,
}

impl FaultState {
    /// A fault state with only a level set.
    pub fn new(level: ConditionLevel) -> Self {
        Self {
            level,
            ..Self::default()
        }
    }

    /// The unavailable fault state.
    pub fn unavailable() -> Self {
        Self::new(ConditionLevel::Unavailable)
    }

    /// Attach a native code.
    pub fn with_native_code(mut self, code: impl Into<String>) -> Self {
        self.native_code = code.into();
        self
    }

    /// Attach a native severity.
    pub fn with_native_severity(mut self, severity: impl Into<String>) -> Self {
        self.native_severity = severity.into();
        self
    }

    /// Attach a qualifier.
    pub fn with_qualifier(mut self, qualifier: impl Into<String>) -> Self {
        self.qualifier = qualifier.into();
        self
    }

    /// Attach a message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

/// One `key=value` entry of a data set or table cell list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataSetEntry {
    /// Entry key.
    pub key: String,
    /// Entry value; empty when `removed` is set.
    pub value: String,
    /// Entry is being removed from the set.
    pub removed: bool,
}

impl DataSetEntry {
    /// A present entry.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            removed: false,
        }
    }

    /// A removal marker for `key`.
    pub fn removed(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: String::new(),
            removed: true,
        }
    }
}

/// Value of a DATA_SET observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "entries", rename_all = "snake_case")]
pub enum DataSetValue {
    /// Current entries.
    Entries(Vec<DataSetEntry>),
    /// Value unknown.
    Unavailable,
}

/// One entry of a TABLE observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableEntry {
    /// Row key.
    pub key: String,
    /// Cells of the row.
    pub cells: Vec<DataSetEntry>,
}

impl TableEntry {
    /// Build a row from `(cell, value)` pairs.
    pub fn new<K, V>(key: impl Into<String>, cells: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            key: key.into(),
            cells: cells
                .into_iter()
                .map(|(k, v)| DataSetEntry::new(k, v))
                .collect(),
        }
    }
}

/// Value of a TABLE observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "entries", rename_all = "snake_case")]
pub enum TableValue {
    /// Current rows.
    Entries(Vec<TableEntry>),
    /// Value unknown.
    Unavailable,
}

/// Value of a TIME_SERIES observation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TimeSeriesValue {
    /// Ordered samples.
    Samples {
        /// Samples per second, when the adapter reports one.
        sample_rate: Option<f64>,
        /// Sample values.
        samples: Vec<f64>,
    },
    /// Value unknown.
    Unavailable,
}

/// Kind-tagged value carried by an [`Observation`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ObservationValue {
    /// Plain value of a SAMPLE or EVENT.
    Value(String),
    /// Active fault states; each is sent on its own line.
    Condition(Vec<FaultState>),
    /// Data set entries.
    DataSet(DataSetValue),
    /// Table rows.
    Table(TableValue),
    /// Time series samples.
    TimeSeries(TimeSeriesValue),
}

impl ObservationValue {
    /// Kind-specific unavailable representation.
    pub fn unavailable(kind: ObservationKind) -> Self {
        match kind {
            ObservationKind::DataItem => ObservationValue::Value(UNAVAILABLE.to_owned()),
            ObservationKind::Condition => ObservationValue::Condition(vec![FaultState::unavailable()]),
            ObservationKind::TimeSeries => ObservationValue::TimeSeries(TimeSeriesValue::Unavailable),
            ObservationKind::DataSet => ObservationValue::DataSet(DataSetValue::Unavailable),
            ObservationKind::Table => ObservationValue::Table(TableValue::Unavailable),
        }
    }

    /// Kind tag of this value.
    pub fn kind(&self) -> ObservationKind {
        match self {
            ObservationValue::Value(_) => ObservationKind::DataItem,
            ObservationValue::Condition(_) => ObservationKind::Condition,
            ObservationValue::DataSet(_) => ObservationKind::DataSet,
            ObservationValue::Table(_) => ObservationKind::Table,
            ObservationValue::TimeSeries(_) => ObservationKind::TimeSeries,
        }
    }

    /// True when the value is the kind-specific unavailable representation.
    pub fn is_unavailable(&self) -> bool {
        match self {
            ObservationValue::Value(value) => value == UNAVAILABLE,
            ObservationValue::Condition(states) => states
                .iter()
                .any(|state| state.level == ConditionLevel::Unavailable),
            ObservationValue::DataSet(value) => matches!(value, DataSetValue::Unavailable),
            ObservationValue::Table(value) => matches!(value, TableValue::Unavailable),
            ObservationValue::TimeSeries(value) => matches!(value, TimeSeriesValue::Unavailable),
        }
    }

    fn feed(&self, hasher: &mut ChangeHasher) {
        hasher.field(self.kind().as_str());
        match self {
            ObservationValue::Value(value) => {
                hasher.field(value);
            }
            ObservationValue::Condition(states) => {
                for state in states {
                    hasher
                        .field(state.level.as_str())
                        .field(&state.native_code)
                        .field(&state.native_severity)
                        .field(&state.qualifier)
                        .field(&state.message);
                }
            }
            ObservationValue::DataSet(DataSetValue::Entries(entries)) => feed_entries(hasher, entries),
            ObservationValue::Table(TableValue::Entries(rows)) => {
                for row in rows {
                    hasher.field(&row.key);
                    feed_entries(hasher, &row.cells);
                    hasher.field("}");
                }
            }
            ObservationValue::TimeSeries(TimeSeriesValue::Samples {
                sample_rate,
                samples,
            }) => {
                hasher.field(&sample_rate.map(|rate| rate.to_string()).unwrap_or_default());
                for sample in samples {
                    hasher.field(&sample.to_string());
                }
            }
            ObservationValue::DataSet(DataSetValue::Unavailable)
            | ObservationValue::Table(TableValue::Unavailable)
            | ObservationValue::TimeSeries(TimeSeriesValue::Unavailable) => {
                hasher.field(UNAVAILABLE);
            }
        }
    }
}

fn feed_entries(hasher: &mut ChangeHasher, entries: &[DataSetEntry]) {
    for entry in entries {
        hasher
            .field(&entry.key)
            .field(&entry.value)
            .field(if entry.removed { "-" } else { "+" });
    }
}

/// A timestamped value keyed by data item key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    /// Data item key (id or name).
    pub key: String,
    /// Target device when it differs from the connection's default device.
    pub device: Option<String>,
    /// Unix epoch microseconds; 0 means "stamp at send time".
    pub timestamp: i64,
    /// Optional duration in seconds carried as an `@` suffix on the timestamp.
    pub duration: Option<f64>,
    /// Kind-tagged value.
    #[serde(flatten)]
    pub value: ObservationValue,
}

impl Observation {
    /// Build an observation with an unset timestamp.
    pub fn new(key: impl Into<String>, value: ObservationValue) -> Self {
        Self {
            key: key.into(),
            device: None,
            timestamp: 0,
            duration: None,
            value,
        }
    }

    /// Plain SAMPLE/EVENT value.
    pub fn value(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(key, ObservationValue::Value(value.into()))
    }

    /// Condition with a single fault state.
    pub fn condition(key: impl Into<String>, state: FaultState) -> Self {
        Self::new(key, ObservationValue::Condition(vec![state]))
    }

    /// Condition with several simultaneously active fault states.
    pub fn conditions(key: impl Into<String>, states: Vec<FaultState>) -> Self {
        Self::new(key, ObservationValue::Condition(states))
    }

    /// Data set with the given entries.
    pub fn data_set(key: impl Into<String>, entries: Vec<DataSetEntry>) -> Self {
        Self::new(key, ObservationValue::DataSet(DataSetValue::Entries(entries)))
    }

    /// Table with the given rows.
    pub fn table(key: impl Into<String>, rows: Vec<TableEntry>) -> Self {
        Self::new(key, ObservationValue::Table(TableValue::Entries(rows)))
    }

    /// Time series with the given samples.
    pub fn time_series(key: impl Into<String>, sample_rate: Option<f64>, samples: Vec<f64>) -> Self {
        Self::new(
            key,
            ObservationValue::TimeSeries(TimeSeriesValue::Samples {
                sample_rate,
                samples,
            }),
        )
    }

    /// Kind-specific unavailable observation.
    pub fn unavailable(key: impl Into<String>, kind: ObservationKind) -> Self {
        Self::new(key, ObservationValue::unavailable(kind))
    }

    /// Set the timestamp (epoch microseconds).
    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Qualify the key with a device name.
    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    /// Attach a duration in seconds.
    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Kind tag of the value.
    pub fn kind(&self) -> ObservationKind {
        self.value.kind()
    }

    /// Key as written on the wire: `<device>:<key>` or `<key>`.
    pub fn qualified_key(&self) -> String {
        match &self.device {
            Some(device) => format!("{}:{}", device, self.key),
            None => self.key.clone(),
        }
    }

    /// Same header with the kind-specific unavailable value.
    pub fn to_unavailable(&self) -> Observation {
        Observation {
            key: self.key.clone(),
            device: self.device.clone(),
            timestamp: self.timestamp,
            duration: None,
            value: ObservationValue::unavailable(self.kind()),
        }
    }

    /// True when the value is unavailable.
    pub fn is_unavailable(&self) -> bool {
        self.value.is_unavailable()
    }

    /// Value digest used to suppress resending unchanged values.
    pub fn change_id(&self) -> ChangeId {
        let mut hasher = ChangeHasher::new();
        hasher
            .field(self.device.as_deref().unwrap_or_default())
            .field(&self.key)
            .field(&self.duration.map(|d| d.to_string()).unwrap_or_default());
        self.value.feed(&mut hasher);
        hasher.finish()
    }
}

/// A self-contained asset document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Asset {
    /// Asset identifier.
    pub asset_id: String,
    /// Asset type, e.g. `CuttingTool`.
    pub asset_type: String,
    /// XML body.
    pub xml: String,
    /// Unix epoch microseconds; 0 means "stamp at send time".
    pub timestamp: i64,
    /// Owning device when it differs from the default device.
    pub device: Option<String>,
}

impl Asset {
    /// Build an asset with an unset timestamp.
    pub fn new(
        asset_id: impl Into<String>,
        asset_type: impl Into<String>,
        xml: impl Into<String>,
    ) -> Self {
        Self {
            asset_id: asset_id.into(),
            asset_type: asset_type.into(),
            xml: xml.into(),
            timestamp: 0,
            device: None,
        }
    }

    /// Set the timestamp (epoch microseconds).
    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Attach an owning device.
    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    /// Document digest used to suppress resending unchanged assets.
    pub fn change_id(&self) -> ChangeId {
        let mut hasher = ChangeHasher::new();
        hasher
            .field(self.device.as_deref().unwrap_or_default())
            .field(&self.asset_id)
            .field(&self.asset_type)
            .field(&self.xml);
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_id_ignores_timestamp() {
        let first = Observation::value("avail", "AVAILABLE").at(10);
        let second = Observation::value("avail", "AVAILABLE").at(20);
        assert_eq!(first.change_id(), second.change_id());
    }

    #[test]
    fn change_id_tracks_value_device_and_kind() {
        let base = Observation::value("avail", "AVAILABLE");
        assert_ne!(
            base.change_id(),
            Observation::value("avail", "UNAVAILABLE").change_id()
        );
        assert_ne!(
            base.change_id(),
            base.clone().with_device("mill").change_id()
        );
        assert_ne!(
            Observation::unavailable("x", ObservationKind::DataSet).change_id(),
            Observation::unavailable("x", ObservationKind::Table).change_id()
        );
    }

    #[test]
    fn unavailable_forms_are_kind_specific() {
        for kind in ObservationKind::ALL {
            let observation = Observation::unavailable("k", kind);
            assert_eq!(observation.kind(), kind);
            assert!(observation.is_unavailable());
        }
        assert!(!Observation::data_set("k", vec![]).is_unavailable());
    }

    #[test]
    fn condition_level_parsing() {
        assert_eq!("fault".parse::<ConditionLevel>(), Ok(ConditionLevel::Fault));
        assert!(matches!(
            "BROKEN".parse::<ConditionLevel>(),
            Err(CodecError::InvalidLevel(_))
        ));
    }

    #[test]
    fn serializes_with_kind_tag() {
        let observation = Observation::value("avail", "AVAILABLE").at(1);
        let json = serde_json::to_value(&observation).expect("serialize");
        assert_eq!(json["kind"], "value");
        assert_eq!(json["value"], "AVAILABLE");
        assert_eq!(json["key"], "avail");
    }
}
