//! ---
//! shdr_section: "02-line-codec"
//! shdr_subsection: "module"
//! shdr_type: "source"
//! shdr_scope: "code"
//! shdr_description: "Observation model and SHDR line grammar."
//! shdr_version: "v0.0.0-prealpha"
//! shdr_owner: "tbd"
//! ---
//! Sub-grammars for data set entries (`k=v k='v w'`) and table rows
//! (`row={c=v c=v} row={...}`).

use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::{DataSetEntry, TableEntry};
use crate::{CodecError, Result};

// Non-greedy: a row ends at the first closing brace, so cell values cannot contain braces.
static TABLE_ROW: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?P<key>[^\s=\{\}]+)=\{(?P<cells>.*?)\}").expect("table row pattern is valid")
});

fn needs_quoting(value: &str) -> bool {
    value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '\'' | '"' | '{' | '}'))
}

fn quote(value: &str, allow_braces: bool) -> String {
    if !needs_quoting(value) {
        return value.to_owned();
    }
    if !value.contains('\'') {
        format!("'{}'", value)
    } else if !value.contains('"') || !allow_braces {
        format!("\"{}\"", value)
    } else {
        format!("{{{}}}", value)
    }
}

fn encode_entries(entries: &[DataSetEntry], allow_braces: bool) -> String {
    entries
        .iter()
        .map(|entry| {
            if entry.removed {
                format!("{}=", entry.key)
            } else {
                format!("{}={}", entry.key, quote(&entry.value, allow_braces))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Encode data set entries as space separated `key=value` pairs.
pub fn encode_data_set_entries(entries: &[DataSetEntry]) -> String {
    encode_entries(entries, true)
}

/// Encode table rows as space separated `key={cells}` blocks.
pub fn encode_table_entries(rows: &[TableEntry]) -> String {
    rows.iter()
        .map(|row| format!("{}={{{}}}", row.key, encode_entries(&row.cells, false)))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse space separated `key=value` pairs.
///
/// Values may be wrapped in `'`, `"` or `{}`; `key=` and a bare `key` mark removals.
pub fn decode_data_set_entries(text: &str) -> Result<Vec<DataSetEntry>> {
    let mut entries = Vec::new();
    let mut rest = text.trim_start();

    while !rest.is_empty() {
        let key_end = rest
            .find(|c: char| c == '=' || c.is_whitespace())
            .unwrap_or(rest.len());
        let key = &rest[..key_end];
        if key.is_empty() {
            return Err(CodecError::EmptyEntryKey);
        }
        rest = &rest[key_end..];

        let Some(after_equals) = rest.strip_prefix('=') else {
            entries.push(DataSetEntry::removed(key));
            rest = rest.trim_start();
            continue;
        };
        rest = after_equals;

        let closer = match rest.chars().next() {
            None => {
                entries.push(DataSetEntry::removed(key));
                break;
            }
            Some(c) if c.is_whitespace() => {
                entries.push(DataSetEntry::removed(key));
                rest = rest.trim_start();
                continue;
            }
            Some('\'') => Some('\''),
            Some('"') => Some('"'),
            Some('{') => Some('}'),
            Some(_) => None,
        };

        match closer {
            Some(closer) => {
                let body = &rest[1..];
                let end = body
                    .find(closer)
                    .ok_or_else(|| CodecError::UnterminatedQuote(key.to_owned()))?;
                entries.push(DataSetEntry::new(key, &body[..end]));
                rest = body[end + closer.len_utf8()..].trim_start();
            }
            None => {
                let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
                entries.push(DataSetEntry::new(key, &rest[..end]));
                rest = rest[end..].trim_start();
            }
        }
    }

    Ok(entries)
}

/// Parse `key={cells}` table rows. Text outside brace blocks is ignored.
pub fn decode_table_entries(text: &str) -> Result<Vec<TableEntry>> {
    TABLE_ROW
        .captures_iter(text)
        .map(|captures| {
            let cells = decode_data_set_entries(&captures["cells"])?;
            Ok(TableEntry {
                key: captures["key"].to_owned(),
                cells,
            })
        })
        .collect()
}
