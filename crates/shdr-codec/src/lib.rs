//! ---
//! shdr_section: "02-line-codec"
//! shdr_subsection: "module"
//! shdr_type: "source"
//! shdr_scope: "code"
//! shdr_description: "Observation model and SHDR line grammar."
//! shdr_version: "v0.0.0-prealpha"
//! shdr_owner: "tbd"
//! ---
#![warn(missing_docs)]

pub mod asset;
pub mod control;
pub mod decode;
pub mod encode;
pub mod entries;
pub mod fields;
pub mod types;

/// Shared result type for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;

/// Reasons a line could not be decoded.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    /// The line carried no payload after the optional timestamp.
    #[error("line has no payload")]
    EmptyLine,
    /// A key field was empty.
    #[error("missing data item key")]
    MissingKey,
    /// A required field after the key was absent.
    #[error("missing {field} for key '{key}'")]
    MissingField {
        /// Key of the observation being decoded.
        key: String,
        /// Name of the absent field.
        field: &'static str,
    },
    /// The condition level token is not a known level.
    #[error("unknown condition level '{0}'")]
    InvalidLevel(String),
    /// A numeric field failed to parse.
    #[error("invalid {field} '{value}'")]
    InvalidNumber {
        /// Name of the field.
        field: &'static str,
        /// Raw token.
        value: String,
    },
    /// A time series declared a different number of samples than it carried.
    #[error("time series declared {declared} samples but carried {actual}")]
    SampleCountMismatch {
        /// Count field value.
        declared: usize,
        /// Number of parsed samples.
        actual: usize,
    },
    /// A quoted entry value was never closed.
    #[error("unterminated quoted value for entry '{0}'")]
    UnterminatedQuote(String),
    /// An entry started with `=` and had no key.
    #[error("entry without a key")]
    EmptyEntryKey,
    /// The line is not an asset line.
    #[error("line is not an asset line")]
    NotAnAsset,
}

pub use asset::{decode_asset_line, encode_asset, is_asset_line, AssetLine, MultilineAsset};
pub use control::{parse_control, ControlLine};
pub use decode::{
    decode_condition, decode_data_items, decode_data_set, decode_table, decode_time_series,
    leading_key, split_timestamp, LineHeader,
};
pub use encode::{encode_data_items, encode_observation, encode_observations};
pub use types::{
    Asset, ChangeId, ConditionLevel, DataSetEntry, DataSetValue, FaultState, Observation,
    ObservationKind, ObservationValue, TableEntry, TableValue, TimeSeriesValue, UNAVAILABLE,
};
