//! ---
//! shdr_section: "02-line-codec"
//! shdr_subsection: "module"
//! shdr_type: "source"
//! shdr_scope: "code"
//! shdr_description: "Observation model and SHDR line grammar."
//! shdr_version: "v0.0.0-prealpha"
//! shdr_owner: "tbd"
//! ---
//! Asset lines: `[<ts>|]@ASSET@|<id>|<type>|<xml>`.
//!
//! Documents containing newlines use the multiline form: the xml field is a
//! `--multiline--<TAG>` marker, the body follows on its own lines and a line
//! holding the same marker ends it.

use crate::decode::split_timestamp;
use crate::encode::timestamp_prefix;
use crate::fields::{escape, FieldReader};
use crate::types::Asset;
use crate::{CodecError, Result};

/// Command token that introduces an asset line.
pub const ASSET_MARKER: &str = "@ASSET@";

const MULTILINE_PREFIX: &str = "--multiline--";

fn split_marker(token: &str) -> Option<Option<&str>> {
    let token = token.trim();
    if token == ASSET_MARKER {
        return Some(None);
    }
    match token.split_once(':') {
        Some((device, ASSET_MARKER)) if !device.is_empty() => Some(Some(device)),
        _ => None,
    }
}

/// True when the line carries an asset command.
pub fn is_asset_line(line: &str) -> bool {
    let header = split_timestamp(line);
    FieldReader::new(header.body)
        .next_raw()
        .and_then(split_marker)
        .is_some()
}

/// Encode an asset as one line, or as a multiline block when the body spans lines.
pub fn encode_asset(asset: &Asset) -> Vec<String> {
    let command = match &asset.device {
        Some(device) => format!("{}:{}", device, ASSET_MARKER),
        None => ASSET_MARKER.to_owned(),
    };
    let head = format!(
        "{}{}|{}|{}|",
        timestamp_prefix(asset.timestamp, None),
        command,
        escape(&asset.asset_id),
        escape(&asset.asset_type)
    );

    if !asset.xml.contains('\n') {
        return vec![format!("{}{}", head, asset.xml)];
    }

    let tag = asset.change_id().to_string()[..8].to_ascii_uppercase();
    let marker = format!("{}{}", MULTILINE_PREFIX, tag);
    let mut lines = Vec::with_capacity(asset.xml.lines().count() + 2);
    lines.push(format!("{}{}", head, marker));
    lines.extend(asset.xml.lines().map(str::to_owned));
    lines.push(marker);
    lines
}

/// A decoded asset line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetLine {
    /// The whole document was on the line.
    Complete(Asset),
    /// The document follows on subsequent lines.
    Multiline(MultilineAsset),
}

/// Accumulator for a multiline asset body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultilineAsset {
    asset: Asset,
    terminator: String,
    body: Vec<String>,
}

impl MultilineAsset {
    /// Line that closes the body.
    pub fn terminator(&self) -> &str {
        &self.terminator
    }

    /// True when `line` closes the body.
    pub fn is_terminator(&self, line: &str) -> bool {
        line.trim_end_matches('\r') == self.terminator
    }

    /// Append one body line.
    pub fn push(&mut self, line: &str) {
        self.body.push(line.trim_end_matches('\r').to_owned());
    }

    /// Assemble the finished asset.
    pub fn finish(mut self) -> Asset {
        self.asset.xml = self.body.join("\n");
        self.asset
    }
}

/// Decode an asset line.
pub fn decode_asset_line(line: &str) -> Result<AssetLine> {
    let header = split_timestamp(line);
    let mut reader = FieldReader::new(header.body);
    let device = reader
        .next_raw()
        .and_then(split_marker)
        .ok_or(CodecError::NotAnAsset)?;

    let asset_id = reader
        .next_field()
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| CodecError::MissingField {
            key: ASSET_MARKER.to_owned(),
            field: "asset id",
        })?;
    let asset_type = reader.next_field().ok_or_else(|| CodecError::MissingField {
        key: asset_id.clone(),
        field: "asset type",
    })?;
    let xml = reader.remainder().unwrap_or_default();

    let mut asset = Asset::new(asset_id, asset_type, "").at(header.timestamp);
    asset.device = device.map(str::to_owned);

    let trimmed = xml.trim();
    if trimmed.starts_with(MULTILINE_PREFIX) {
        return Ok(AssetLine::Multiline(MultilineAsset {
            asset,
            terminator: trimmed.to_owned(),
            body: Vec::new(),
        }));
    }

    asset.xml = xml.to_owned();
    Ok(AssetLine::Complete(asset))
}

#[cfg(test)]
mod tests {
    use super::*;

    const XML: &str = "<CuttingTool assetId=\"T1\"/>";

    #[test]
    fn single_line_asset() {
        let asset = Asset::new("T1", "CuttingTool", XML).at(1_704_067_200_000_000);
        let lines = encode_asset(&asset);
        assert_eq!(
            lines,
            vec![format!(
                "2024-01-01T00:00:00.000000Z|@ASSET@|T1|CuttingTool|{}",
                XML
            )]
        );
        assert!(is_asset_line(&lines[0]));
        assert_eq!(
            decode_asset_line(&lines[0]).unwrap(),
            AssetLine::Complete(asset)
        );
    }

    #[test]
    fn device_qualified_asset() {
        let asset = Asset::new("T1", "CuttingTool", XML).with_device("mill");
        let lines = encode_asset(&asset);
        assert!(lines[0].starts_with("mill:@ASSET@|T1|"));
        assert_eq!(
            decode_asset_line(&lines[0]).unwrap(),
            AssetLine::Complete(asset)
        );
    }

    #[test]
    fn multiline_asset_reassembles() {
        let asset = Asset::new("T2", "CuttingTool", "<A>\n  <B/>\n</A>");
        let lines = encode_asset(&asset);
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[1], "<A>");

        let AssetLine::Multiline(mut pending) = decode_asset_line(&lines[0]).unwrap() else {
            panic!("expected multiline asset");
        };
        assert_eq!(pending.terminator(), lines[4]);
        for line in &lines[1..] {
            if pending.is_terminator(line) {
                break;
            }
            pending.push(line);
        }
        assert_eq!(pending.finish(), asset);
    }

    #[test]
    fn asset_id_and_type_are_escaped() {
        let asset = Asset::new("T|1", "Cutting|Tool", XML);
        let lines = encode_asset(&asset);
        assert!(lines[0].starts_with("@ASSET@|T\\|1|Cutting\\|Tool|"));
        assert_eq!(
            decode_asset_line(&lines[0]).unwrap(),
            AssetLine::Complete(asset)
        );
    }

    #[test]
    fn rejects_other_lines() {
        assert!(!is_asset_line("avail|AVAILABLE"));
        assert_eq!(
            decode_asset_line("avail|AVAILABLE"),
            Err(CodecError::NotAnAsset)
        );
        assert!(matches!(
            decode_asset_line("@ASSET@||CuttingTool|<x/>"),
            Err(CodecError::MissingField { .. })
        ));
    }
}
