//! ---
//! shdr_section: "04-agent-client"
//! shdr_subsection: "module"
//! shdr_type: "source"
//! shdr_scope: "code"
//! shdr_description: "Agent-side SHDR client and line routing."
//! shdr_version: "v0.0.0-prealpha"
//! shdr_owner: "tbd"
//! ---
use std::collections::HashMap;

use shdr_codec::ObservationKind;
use shdr_common::device::{Category, DataItemDescriptor, DeviceConfig, Representation};

/// The slice of a device model the client needs to route lines.
pub trait DeviceModel: Send + Sync {
    /// Device name, matched against `<device>:` key qualifiers.
    fn name(&self) -> &str;

    /// Resolve a wire key by data item id, then by name.
    fn lookup(&self, key: &str) -> Option<&DataItemDescriptor>;

    /// Every data item of the device.
    fn data_items(&self) -> &[DataItemDescriptor];
}

/// Observation kind a data item's lines decode into.
pub fn observation_kind(descriptor: &DataItemDescriptor) -> ObservationKind {
    if descriptor.category == Category::Condition {
        return ObservationKind::Condition;
    }
    match descriptor.representation {
        Representation::Value => ObservationKind::DataItem,
        Representation::DataSet => ObservationKind::DataSet,
        Representation::Table => ObservationKind::Table,
        Representation::TimeSeries => ObservationKind::TimeSeries,
    }
}

/// Device model built once from configuration.
#[derive(Debug, Clone)]
pub struct StaticDevice {
    name: String,
    items: Vec<DataItemDescriptor>,
    by_id: HashMap<String, usize>,
    by_name: HashMap<String, usize>,
}

impl StaticDevice {
    /// Index `items` for lookup. Later duplicates of an id or name are ignored.
    pub fn new(name: impl Into<String>, items: Vec<DataItemDescriptor>) -> Self {
        let mut by_id = HashMap::with_capacity(items.len());
        let mut by_name = HashMap::new();
        for (index, item) in items.iter().enumerate() {
            by_id.entry(item.id.clone()).or_insert(index);
            if let Some(name) = &item.name {
                by_name.entry(name.clone()).or_insert(index);
            }
        }
        Self {
            name: name.into(),
            items,
            by_id,
            by_name,
        }
    }

    /// Build from the `[agent.device]` configuration section.
    pub fn from_config(config: &DeviceConfig) -> Self {
        Self::new(config.name.clone(), config.data_items.clone())
    }
}

impl DeviceModel for StaticDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn lookup(&self, key: &str) -> Option<&DataItemDescriptor> {
        self.by_id
            .get(key)
            .or_else(|| self.by_name.get(key))
            .map(|index| &self.items[*index])
    }

    fn data_items(&self) -> &[DataItemDescriptor] {
        &self.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> StaticDevice {
        StaticDevice::new(
            "mill",
            vec![
                DataItemDescriptor::new("d1", Category::Event, Representation::Value)
                    .with_name("avail"),
                DataItemDescriptor::new("avail", Category::Sample, Representation::Value),
                DataItemDescriptor::new("c1", Category::Condition, Representation::Value)
                    .with_name("system"),
            ],
        )
    }

    #[test]
    fn id_wins_over_name() {
        let device = device();
        assert_eq!(device.lookup("avail").map(|d| d.id.as_str()), Some("avail"));
        assert_eq!(device.lookup("system").map(|d| d.id.as_str()), Some("c1"));
        assert!(device.lookup("missing").is_none());
    }

    #[test]
    fn kinds_follow_category_then_representation() {
        let condition =
            DataItemDescriptor::new("c", Category::Condition, Representation::DataSet);
        assert_eq!(observation_kind(&condition), ObservationKind::Condition);
        let table = DataItemDescriptor::new("t", Category::Event, Representation::Table);
        assert_eq!(observation_kind(&table), ObservationKind::Table);
        let series = DataItemDescriptor::new("s", Category::Sample, Representation::TimeSeries);
        assert_eq!(observation_kind(&series), ObservationKind::TimeSeries);
    }
}
