//! ---
//! shdr_section: "02-line-codec"
//! shdr_subsection: "module"
//! shdr_type: "source"
//! shdr_scope: "code"
//! shdr_description: "Observation model and SHDR line grammar."
//! shdr_version: "v0.0.0-prealpha"
//! shdr_owner: "tbd"
//! ---
//! Pipe-delimited field handling shared by the encoders and decoders.

use std::borrow::Cow;

/// Field separator.
pub const SEPARATOR: char = '|';

/// Escape literal `|` characters in a free-text field.
pub fn escape(value: &str) -> Cow<'_, str> {
    if value.contains(SEPARATOR) {
        Cow::Owned(value.replace(SEPARATOR, "\\|"))
    } else {
        Cow::Borrowed(value)
    }
}

/// Reverse [`escape`].
pub fn unescape(value: &str) -> Cow<'_, str> {
    if value.contains("\\|") {
        Cow::Owned(value.replace("\\|", "|"))
    } else {
        Cow::Borrowed(value)
    }
}

/// Byte offset of the first `|` not preceded by a backslash.
fn find_separator(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut index = 0;
    while index < bytes.len() {
        match bytes[index] {
            b'\\' if bytes.get(index + 1) == Some(&b'|') => index += 2,
            b'|' => return Some(index),
            _ => index += 1,
        }
    }
    None
}

/// Left-to-right field reader that consumes one field per call.
#[derive(Debug, Clone)]
pub struct FieldReader<'a> {
    rest: Option<&'a str>,
}

impl<'a> FieldReader<'a> {
    /// Start reading `text`.
    pub fn new(text: &'a str) -> Self {
        Self { rest: Some(text) }
    }

    /// Raw next field, escapes left intact.
    pub fn next_raw(&mut self) -> Option<&'a str> {
        let rest = self.rest?;
        match find_separator(rest) {
            Some(at) => {
                self.rest = Some(&rest[at + 1..]);
                Some(&rest[..at])
            }
            None => {
                self.rest = None;
                Some(rest)
            }
        }
    }

    /// Next field with `\|` unescaped.
    pub fn next_field(&mut self) -> Option<String> {
        self.next_raw().map(|raw| unescape(raw).into_owned())
    }

    /// Everything not yet consumed, escapes left intact.
    pub fn remainder(&mut self) -> Option<&'a str> {
        self.rest.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_and_unescape_pipes() {
        assert_eq!(escape("a|b"), "a\\|b");
        assert_eq!(escape("plain"), "plain");
        assert_eq!(unescape("a\\|b"), "a|b");
    }

    #[test]
    fn reader_splits_on_unescaped_separators() {
        let mut reader = FieldReader::new("key|a\\|b||tail|end");
        assert_eq!(reader.next_field().as_deref(), Some("key"));
        assert_eq!(reader.next_field().as_deref(), Some("a|b"));
        assert_eq!(reader.next_field().as_deref(), Some(""));
        assert_eq!(reader.remainder(), Some("tail|end"));
        assert_eq!(reader.next_field(), None);
    }

    #[test]
    fn trailing_separator_yields_empty_field() {
        let mut reader = FieldReader::new("key|");
        assert_eq!(reader.next_raw(), Some("key"));
        assert_eq!(reader.next_raw(), Some(""));
        assert_eq!(reader.next_raw(), None);
    }
}
