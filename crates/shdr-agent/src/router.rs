//! ---
//! shdr_section: "04-agent-client"
//! shdr_subsection: "module"
//! shdr_type: "source"
//! shdr_scope: "code"
//! shdr_description: "Agent-side SHDR client and line routing."
//! shdr_version: "v0.0.0-prealpha"
//! shdr_owner: "tbd"
//! ---
//! Classifies incoming lines and picks a decoder from the target data item's
//! category and representation.

use std::sync::Arc;

use shdr_codec::{
    decode_asset_line, decode_condition, decode_data_items, decode_data_set, decode_table,
    decode_time_series, is_asset_line, leading_key, parse_control, Asset, AssetLine, CodecError,
    ControlLine, MultilineAsset, Observation, ObservationKind,
};

use crate::device::{observation_kind, DeviceModel};

/// Outcome of routing one line.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    /// A `*` control line.
    Control(ControlLine),
    /// Decoded observations, keyed by data item id.
    Observations(Vec<Observation>),
    /// A complete asset.
    Asset(Asset),
    /// The line belongs to a multiline asset still being read.
    Pending,
    /// The line was discarded.
    Dropped(DropReason),
}

/// Why a line was discarded.
#[derive(Debug, Clone, PartialEq)]
pub enum DropReason {
    /// Blank line.
    Empty,
    /// The key does not resolve on the target device.
    UnknownKey(String),
    /// The line did not match the decoder's grammar.
    Malformed(CodecError),
}

/// Stateful line classifier for one connection.
pub struct LineRouter {
    device: Arc<dyn DeviceModel>,
    multiline: Option<MultilineAsset>,
}

impl LineRouter {
    /// Route lines against `device`.
    pub fn new(device: Arc<dyn DeviceModel>) -> Self {
        Self {
            device,
            multiline: None,
        }
    }

    /// Classify and decode one line. Observations and assets without a
    /// timestamp are stamped with `received_at`.
    pub fn route(&mut self, line: &str, received_at: i64) -> Routed {
        let line = line.trim_end_matches(['\r', '\n']);

        if let Some(mut pending) = self.multiline.take() {
            if pending.is_terminator(line) {
                return Routed::Asset(stamp_asset(pending.finish(), received_at));
            }
            pending.push(line);
            self.multiline = Some(pending);
            return Routed::Pending;
        }

        if line.trim().is_empty() {
            return Routed::Dropped(DropReason::Empty);
        }
        if let Some(control) = parse_control(line) {
            return Routed::Control(control);
        }
        if is_asset_line(line) {
            return match decode_asset_line(line) {
                Ok(AssetLine::Complete(asset)) => Routed::Asset(stamp_asset(asset, received_at)),
                Ok(AssetLine::Multiline(pending)) => {
                    self.multiline = Some(pending);
                    Routed::Pending
                }
                Err(err) => Routed::Dropped(DropReason::Malformed(err)),
            };
        }

        let Some((qualifier, key)) = leading_key(line) else {
            return Routed::Dropped(DropReason::Malformed(CodecError::MissingKey));
        };
        let Some(kind) = self.resolve(qualifier.as_deref(), &key).map(|(_, kind)| kind) else {
            return Routed::Dropped(DropReason::UnknownKey(key));
        };

        let decoded = match kind {
            ObservationKind::Condition => decode_condition(line).map(|o| vec![o]),
            ObservationKind::Table => decode_table(line).map(|o| vec![o]),
            ObservationKind::DataSet => decode_data_set(line).map(|o| vec![o]),
            ObservationKind::TimeSeries => decode_time_series(line).map(|o| vec![o]),
            ObservationKind::DataItem => decode_data_items(line),
        };

        match decoded {
            Ok(observations) => {
                let observations: Vec<_> = observations
                    .into_iter()
                    .filter_map(|observation| self.canonicalize(observation, kind, received_at))
                    .collect();
                Routed::Observations(observations)
            }
            Err(err) => Routed::Dropped(DropReason::Malformed(err)),
        }
    }

    fn resolve(&self, qualifier: Option<&str>, key: &str) -> Option<(String, ObservationKind)> {
        if qualifier.is_some_and(|device| device != self.device.name()) {
            return None;
        }
        self.device
            .lookup(key)
            .map(|descriptor| (descriptor.id.clone(), observation_kind(descriptor)))
    }

    /// Rewrite the key to the data item id. Batched items whose key is unknown,
    /// or is not a plain value item, are dropped.
    fn canonicalize(
        &self,
        mut observation: Observation,
        expected: ObservationKind,
        received_at: i64,
    ) -> Option<Observation> {
        let (id, kind) = self.resolve(observation.device.as_deref(), &observation.key)?;
        if kind != expected {
            return None;
        }
        observation.key = id;
        observation.device = None;
        if observation.timestamp == 0 {
            observation.timestamp = received_at;
        }
        Some(observation)
    }
}

fn stamp_asset(mut asset: Asset, received_at: i64) -> Asset {
    if asset.timestamp == 0 {
        asset.timestamp = received_at;
    }
    asset
}
