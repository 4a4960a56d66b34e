//! ---
//! shdr_section: "01-core-functionality"
//! shdr_subsection: "module"
//! shdr_type: "source"
//! shdr_scope: "code"
//! shdr_description: "Shared primitives and utilities for the SHDR runtime."
//! shdr_version: "v0.0.0-prealpha"
//! shdr_owner: "tbd"
//! ---
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// MTConnect data item category.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    Sample,
    #[default]
    Event,
    Condition,
}

/// MTConnect data item representation.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Representation {
    #[default]
    Value,
    DataSet,
    Table,
    TimeSeries,
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SAMPLE" => Ok(Category::Sample),
            "EVENT" => Ok(Category::Event),
            "CONDITION" => Ok(Category::Condition),
            other => Err(format!("unknown category: {}", other)),
        }
    }
}

impl FromStr for Representation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "VALUE" => Ok(Representation::Value),
            "DATA_SET" => Ok(Representation::DataSet),
            "TABLE" => Ok(Representation::Table),
            "TIME_SERIES" => Ok(Representation::TimeSeries),
            other => Err(format!("unknown representation: {}", other)),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Category::Sample => "SAMPLE",
            Category::Event => "EVENT",
            Category::Condition => "CONDITION",
        };
        f.write_str(label)
    }
}

/// The slice of a device data item the protocol engine cares about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataItemDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub category: Category,
    #[serde(default)]
    pub representation: Representation,
}

impl DataItemDescriptor {
    pub fn new(id: impl Into<String>, category: Category, representation: Representation) -> Self {
        Self {
            id: id.into(),
            name: None,
            category,
            representation,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Device declaration used by the agent-side client to route lines.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeviceConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub data_items: Vec<DataItemDescriptor>,
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("device name must not be empty"));
        }
        let mut seen = std::collections::HashSet::new();
        for item in &self.data_items {
            if item.id.trim().is_empty() {
                return Err(anyhow!(
                    "device '{}' declares a data item with an empty id",
                    self.name
                ));
            }
            if !seen.insert(item.id.as_str()) {
                return Err(anyhow!(
                    "device '{}' declares data item '{}' more than once",
                    self.name,
                    item.id
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_and_representation_parse_case_insensitively() {
        assert_eq!("condition".parse::<Category>(), Ok(Category::Condition));
        assert_eq!(
            "Time_Series".parse::<Representation>(),
            Ok(Representation::TimeSeries)
        );
        assert!("BOGUS".parse::<Category>().is_err());
    }

    #[test]
    fn duplicate_data_item_ids_are_rejected() {
        let device = DeviceConfig {
            name: "mill".into(),
            data_items: vec![
                DataItemDescriptor::new("avail", Category::Event, Representation::Value),
                DataItemDescriptor::new("avail", Category::Event, Representation::Value),
            ],
        };
        assert!(device.validate().is_err());
    }
}
