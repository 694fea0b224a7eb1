//! The flat string-to-string payload shared by every protocol operation.
//!
//! A [`FieldMap`] is what the signing engine canonicalizes, what the wire codec encodes, and what
//! typed request/response structs convert to and from. Keys iterate in byte-lexicographic order,
//! so encoding is deterministic. An absent key means "not present", which is distinct from an
//! empty value.

use std::collections::BTreeMap;

use crate::errors::{Error, Result};

/// Signature field, never part of its own computation
pub const SIGN: &str = "sign";
pub const SIGN_TYPE: &str = "sign_type";
pub const NONCE_STR: &str = "nonce_str";
pub const APPID: &str = "appid";
pub const MCH_ID: &str = "mch_id";

/// Communication status: whether the provider accepted the call at all
pub const RETURN_CODE: &str = "return_code";
pub const RETURN_MSG: &str = "return_msg";
/// Business status: only meaningful when `return_code` is [`SUCCESS`]
pub const RESULT_CODE: &str = "result_code";
pub const ERR_CODE: &str = "err_code";
pub const ERR_CODE_DES: &str = "err_code_des";

pub const SUCCESS: &str = "SUCCESS";
pub const FAIL: &str = "FAIL";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldMap(BTreeMap<String, String>);

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a field, returning the previous value if there was one.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    /// Insert only when `value` is non-empty; optional fields are omitted rather than sent blank.
    pub fn insert_non_empty(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let value = value.into();
        if !value.is_empty() {
            self.0.insert(key.into(), value);
        }
    }

    /// Insert `value()` only when `key` is absent or empty.
    pub fn insert_default_with(&mut self, key: &str, value: impl FnOnce() -> String) {
        if self.get(key).is_none_or(str::is_empty) {
            self.0.insert(key.to_string(), value());
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// The value of `key`, or `""` when absent.
    pub fn get_or_empty(&self, key: &str) -> &str {
        self.get(key).unwrap_or_default()
    }

    /// The value of a required field; absent or empty is an error.
    pub fn require(&self, key: &str) -> Result<&str> {
        match self.get(key) {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(Error::missing(key)),
        }
    }

    /// Parse an optional base-10 integer field. Absent or empty yields `None`.
    pub fn parse_i64(&self, key: &str) -> Result<Option<i64>> {
        match self.get(key) {
            None | Some("") => Ok(None),
            Some(value) => value.parse().map(Some).map_err(|e| Error::invalid(key, None, value, e)),
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate fields in byte-lexicographic key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// `return_code == SUCCESS`
    pub fn is_return_success(&self) -> bool {
        self.get(RETURN_CODE) == Some(SUCCESS)
    }

    /// `return_code == SUCCESS && result_code == SUCCESS`
    pub fn is_result_success(&self) -> bool {
        self.is_return_success() && self.get(RESULT_CODE) == Some(SUCCESS)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for FieldMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl<K: Into<String>, V: Into<String>> Extend<(K, V)> for FieldMap {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        self.0.extend(iter.into_iter().map(|(k, v)| (k.into(), v.into())));
    }
}

impl IntoIterator for FieldMap {
    type Item = (String, String);
    type IntoIter = std::collections::btree_map::IntoIter<String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl From<BTreeMap<String, String>> for FieldMap {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

impl From<FieldMap> for BTreeMap<String, String> {
    fn from(fields: FieldMap) -> Self {
        fields.0
    }
}
