//! Wire format for [`FieldMap`] payloads.
//!
//! A payload is a single `<xml>` root with one child element per field and the value as
//! character data:
//!
//! ```text
//! <xml><appid>wx123</appid><total_fee>100</total_fee></xml>
//! ```
//!
//! No attributes and no nesting. Values are escaped with standard markup escaping only, so
//! newlines and other control characters survive a round trip. On decode both plain text and
//! CDATA sections are accepted.
//!
//! Repeated records travel in the same flat map using the indexed-list convention: a count
//! field `N` plus sibling fields `<field>_<i>` for `i` in `0..N`. See [`IndexedList`].

use std::collections::BTreeSet;

use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};

use crate::errors::{Error, Result};
use crate::fields::FieldMap;

/// Name of the root element
pub const ROOT: &str = "xml";

fn decode_error(message: impl Into<String>) -> Error {
    Error::Decode { message: message.into() }
}

fn write_failed(e: impl std::fmt::Display) -> Error {
    decode_error(format!("write failed: {e}"))
}

/// Serialize a payload. Fields are written in byte-lexicographic key order.
pub fn encode(fields: &FieldMap) -> Result<Vec<u8>> {
    let mut writer = Writer::new(Vec::new());

    writer.write_event(Event::Start(BytesStart::new(ROOT))).map_err(write_failed)?;
    for (key, value) in fields.iter() {
        if !is_valid_name(key) {
            return Err(Error::invalid(key, None, value, "field name is not a valid element name"));
        }
        writer.write_event(Event::Start(BytesStart::new(key))).map_err(write_failed)?;
        if !value.is_empty() {
            writer.write_event(Event::Text(BytesText::new(value))).map_err(write_failed)?;
        }
        writer.write_event(Event::End(BytesEnd::new(key))).map_err(write_failed)?;
    }
    writer.write_event(Event::End(BytesEnd::new(ROOT))).map_err(write_failed)?;

    Ok(writer.into_inner())
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// Parse a payload into a flat map.
///
/// The first element is the root, whatever its name. Everything after the root closes is
/// ignored. Nested elements and duplicate field names are rejected.
pub fn decode(body: &[u8]) -> Result<FieldMap> {
    let mut reader = Reader::from_reader(body);
    let mut fields = FieldMap::new();

    // (name, accumulated value) of the field currently open
    let mut current: Option<(String, String)> = None;
    let mut in_root = false;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| decode_error(format!("at byte {}: {e}", reader.buffer_position())))?;

        match event {
            Event::Start(start) => {
                let name = String::from_utf8(start.name().as_ref().to_vec()).map_err(|e| decode_error(e.to_string()))?;
                if !in_root {
                    in_root = true;
                } else if let Some((parent, _)) = &current {
                    return Err(decode_error(format!("nested element <{name}> inside <{parent}>")));
                } else {
                    current = Some((name, String::new()));
                }
            }
            Event::Empty(empty) => {
                let name = String::from_utf8(empty.name().as_ref().to_vec()).map_err(|e| decode_error(e.to_string()))?;
                if !in_root {
                    // <xml/> is an empty payload
                    return Ok(fields);
                }
                if let Some((parent, _)) = &current {
                    return Err(decode_error(format!("nested element <{name}/> inside <{parent}>")));
                }
                insert_unique(&mut fields, name, String::new())?;
            }
            Event::Text(text) => {
                let value = text.unescape().map_err(|e| decode_error(e.to_string()))?;
                match current.as_mut() {
                    Some((_, buffer)) => buffer.push_str(&value),
                    None if value.trim().is_empty() => {}
                    None => return Err(decode_error(format!("unexpected text {:?} outside a field", value.trim()))),
                }
            }
            Event::CData(cdata) => {
                let value = String::from_utf8(cdata.into_inner().into_owned()).map_err(|e| decode_error(e.to_string()))?;
                match current.as_mut() {
                    Some((_, buffer)) => buffer.push_str(&value),
                    None => return Err(decode_error("unexpected CDATA outside a field")),
                }
            }
            Event::End(_) => match current.take() {
                Some((name, value)) => insert_unique(&mut fields, name, value)?,
                // Root closed
                None => return Ok(fields),
            },
            Event::Eof => {
                return if in_root {
                    Err(decode_error("unexpected end of document"))
                } else {
                    Err(decode_error("empty document"))
                };
            }
            // Declaration, comments, processing instructions, doctype
            _ => {}
        }
    }
}

fn insert_unique(fields: &mut FieldMap, name: String, value: String) -> Result<()> {
    if fields.contains_key(&name) {
        return Err(decode_error(format!("duplicate field <{name}>")));
    }
    fields.insert(name, value);
    Ok(())
}

/// Flatten `records` into `fields` using the indexed-list convention.
///
/// Writes `count_field = records.len()` and `<key>_<i>` for every field of record `i`.
/// Empty values are skipped, so every record should carry at least one non-empty field for
/// the list to decode again.
pub fn push_indexed(fields: &mut FieldMap, count_field: &str, records: &[FieldMap]) {
    fields.insert(count_field, records.len().to_string());
    for (index, record) in records.iter().enumerate() {
        for (key, value) in record.iter() {
            fields.insert_non_empty(format!("{key}_{index}"), value);
        }
    }
}

/// A view of the records flattened into a map under one count field.
///
/// `shape` lists the per-record field names. On construction the declared count is checked
/// against the indices actually present for those names: every index in `0..count` must carry
/// at least one field and no index at or beyond `count` may appear.
#[derive(Debug, Clone, Copy)]
pub struct IndexedList<'a> {
    fields: &'a FieldMap,
    len: usize,
}

impl<'a> IndexedList<'a> {
    /// Locate the list announced by `count_field`. An absent count means no records.
    pub fn new(fields: &'a FieldMap, count_field: &str, shape: &[&str]) -> Result<Self> {
        let len = match fields.get(count_field) {
            None | Some("") => 0,
            Some(raw) => raw.parse::<usize>().map_err(|e| Error::invalid(count_field, None, raw, e))?,
        };

        let present = present_indices(fields, shape);
        if let Some(&extra) = present.range(len..).next() {
            return Err(Error::invalid(
                count_field,
                None,
                len.to_string(),
                format!("record index {extra} is present beyond the declared count"),
            ));
        }
        if let Some(missing) = (0..len).find(|i| !present.contains(i)) {
            return Err(Error::invalid(
                count_field,
                None,
                len.to_string(),
                format!("declared count includes record {missing}, which has no fields"),
            ));
        }

        Ok(Self { fields, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Records in index order `0..len`.
    pub fn records(&self) -> impl Iterator<Item = IndexedRecord<'a>> + 'a {
        let fields = self.fields;
        (0..self.len).map(move |index| IndexedRecord { fields, index })
    }

    /// Convert every record, stopping at the first failure.
    pub fn decode_with<T>(&self, f: impl FnMut(IndexedRecord<'a>) -> Result<T>) -> Result<Vec<T>> {
        self.records().map(f).collect()
    }
}

/// Indices `i` for which some `<name>_<i>` with `name` in `shape` is present.
fn present_indices(fields: &FieldMap, shape: &[&str]) -> BTreeSet<usize> {
    let mut indices = BTreeSet::new();
    for key in fields.keys() {
        for name in shape {
            let Some(suffix) = key.strip_prefix(name).and_then(|rest| rest.strip_prefix('_')) else {
                continue;
            };
            // Only canonical decimal suffixes: "01" is not index 1
            if let Ok(index) = suffix.parse::<usize>()
                && index.to_string() == suffix
            {
                indices.insert(index);
            }
        }
    }
    indices
}

/// One record of an [`IndexedList`]: reads `<name>_<index>` from the underlying map.
#[derive(Debug, Clone, Copy)]
pub struct IndexedRecord<'a> {
    fields: &'a FieldMap,
    index: usize,
}

impl<'a> IndexedRecord<'a> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn get(&self, name: &str) -> Option<&'a str> {
        self.fields.get(&format!("{name}_{}", self.index))
    }

    /// Optional string sub-field; absent decodes to `""`.
    pub fn string(&self, name: &str) -> String {
        self.get(name).unwrap_or_default().to_string()
    }

    /// Required string sub-field.
    pub fn required(&self, name: &str) -> Result<String> {
        match self.get(name) {
            Some(value) if !value.is_empty() => Ok(value.to_string()),
            _ => Err(Error::MissingField {
                field: name.to_string(),
                index: Some(self.index),
            }),
        }
    }

    /// Optional integer sub-field; absent decodes to `0`, non-numeric is an error naming the
    /// field and index.
    pub fn int(&self, name: &str) -> Result<i64> {
        Ok(self.parse_int(name)?.unwrap_or_default())
    }

    /// Required integer sub-field.
    pub fn required_int(&self, name: &str) -> Result<i64> {
        self.parse_int(name)?.ok_or_else(|| Error::MissingField {
            field: name.to_string(),
            index: Some(self.index),
        })
    }

    fn parse_int(&self, name: &str) -> Result<Option<i64>> {
        match self.get(name) {
            None | Some("") => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|e| Error::invalid(name, Some(self.index), raw, e)),
        }
    }
}
