//! Flat, dotted-key settings and the list formats stored in them.
//!
//! Settings map keys such as `anvil.client.middlewares` to a text blob, a
//! list of strings or a boolean. Blocks of configuration are written as one
//! entry per line and decoded with [`parse_list`]:
//!
//! ```text
//! anvil.client.proxies =
//!     http://  http://proxy:8080/
//!     https:// http://proxy:8443/
//! ```

use std::collections::BTreeMap;
use std::collections::HashMap;

use crate::ConfigurationError;

/// Raw value of a setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingValue {
    /// Text blob, possibly spanning several lines.
    Text(String),
    /// Already split entries.
    List(Vec<String>),
    /// Boolean flag.
    Bool(bool),
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<String>> for SettingValue {
    fn from(value: Vec<String>) -> Self {
        Self::List(value)
    }
}

impl From<Vec<&str>> for SettingValue {
    fn from(value: Vec<&str>) -> Self {
        Self::List(value.into_iter().map(ToString::to_string).collect())
    }
}

impl From<bool> for SettingValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Ordered mapping of dotted keys to values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    values: BTreeMap<String, SettingValue>,
}

impl Settings {
    /// Create empty settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load settings from a TOML document.
    ///
    /// Nested tables are flattened into dotted keys, so these two documents
    /// are equivalent:
    ///
    /// ```toml
    /// [anvil.client]
    /// service_discovery = "static"
    /// ```
    ///
    /// ```toml
    /// "anvil.client.service_discovery" = "static"
    /// ```
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid TOML.
    pub fn from_toml_str(document: &str) -> Result<Self, ConfigurationError> {
        let table: toml::Table = document.parse()?;
        let mut settings = Self::new();
        flatten("", &table, &mut settings);
        Ok(settings)
    }

    /// Set a value, replacing the previous one.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<SettingValue>) {
        self.values.insert(key.into(), value.into());
    }

    /// Set a value, builder style.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<SettingValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Raw value of a key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&SettingValue> {
        self.values.get(key)
    }

    /// Trimmed text of a key; empty text counts as absent.
    #[must_use]
    pub fn text(&self, key: &str) -> Option<&str> {
        match self.values.get(key)? {
            SettingValue::Text(text) => Some(text.trim()).filter(|text| !text.is_empty()),
            SettingValue::List(_) | SettingValue::Bool(_) => None,
        }
    }

    /// Unsigned integer value of a key.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not an unsigned integer.
    pub fn integer(&self, key: &str) -> Result<Option<u64>, ConfigurationError> {
        self.text(key).map(|value| parse_integer(value, key)).transpose()
    }

    /// Whether a key is set.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// All keys, in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

impl<K, V> FromIterator<(K, V)> for Settings
where
    K: Into<String>,
    V: Into<SettingValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}

fn flatten(prefix: &str, table: &toml::Table, settings: &mut Settings) {
    for (key, value) in table {
        let key = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            toml::Value::Table(table) => flatten(&key, table, settings),
            toml::Value::String(text) => settings.insert(key, text.as_str()),
            toml::Value::Boolean(flag) => settings.insert(key, *flag),
            toml::Value::Array(items) => {
                let items: Vec<String> = items
                    .iter()
                    .map(|item| match item {
                        toml::Value::String(text) => text.clone(),
                        other => other.to_string(),
                    })
                    .collect();
                settings.insert(key, items);
            }
            other => settings.insert(key, other.to_string()),
        }
    }
}

pub(crate) fn parse_integer(value: &str, setting: &str) -> Result<u64, ConfigurationError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigurationError::InvalidInteger {
            value: value.to_string(),
            setting: setting.to_string(),
        })
}

pub(crate) fn parse_numbers(value: &str, setting: &str) -> Result<Vec<f64>, ConfigurationError> {
    value
        .split_whitespace()
        .map(|number| {
            number
                .parse()
                .map_err(|_| ConfigurationError::InvalidNumber {
                    value: number.to_string(),
                    setting: setting.to_string(),
                })
        })
        .collect()
}

/// Words of a value, split on whitespace.
///
/// Used for plain name lists such as `anvil.clients`.
#[must_use]
pub fn as_list(value: &SettingValue) -> Vec<String> {
    match value {
        SettingValue::Text(text) => text.split_whitespace().map(ToString::to_string).collect(),
        SettingValue::List(items) => items
            .iter()
            .flat_map(|item| item.split_whitespace())
            .map(ToString::to_string)
            .collect(),
        SettingValue::Bool(flag) => vec![flag.to_string()],
    }
}

/// Whether a value is truthy: `t`, `true`, `y`, `yes`, `on` or `1`, ignoring case.
#[must_use]
pub fn as_bool(value: &SettingValue) -> bool {
    match value {
        SettingValue::Bool(flag) => *flag,
        SettingValue::Text(text) => matches!(
            text.trim().to_ascii_lowercase().as_str(),
            "t" | "true" | "y" | "yes" | "on" | "1"
        ),
        SettingValue::List(_) => false,
    }
}

/// Entries of a list setting: non-blank lines of a text, or the list items.
fn entries(value: &SettingValue) -> Vec<String> {
    match value {
        SettingValue::Text(text) => text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToString::to_string)
            .collect(),
        SettingValue::List(items) => items.iter().map(|item| item.trim().to_string()).collect(),
        SettingValue::Bool(flag) => vec![flag.to_string()],
    }
}

/// How [`parse_list`] splits an entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ListMode {
    /// `key value`, split on the first whitespace run; a bare key is an error.
    #[default]
    Pairs,
    /// Like `Pairs`, but a bare key is a flag.
    Flags,
    /// `key<sep>value`, both sides trimmed; a missing separator is an error.
    Separator(char),
}

/// Value of a parsed list entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListValue {
    /// Text after the key.
    Text(String),
    /// Bare key in [`ListMode::Flags`].
    Flag,
}

impl ListValue {
    /// The text, if any.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Flag => None,
        }
    }
}

/// Entries of a list setting, in declaration order.
///
/// Lookups by key return the last occurrence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedList {
    entries: Vec<(String, ListValue)>,
}

impl ParsedList {
    /// Whether the list has no entry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries, duplicates included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Entries in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ListValue)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }

    /// Distinct keys, in order of first appearance.
    #[must_use]
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = Vec::with_capacity(self.entries.len());
        for (key, _) in &self.entries {
            if !keys.contains(&key.as_str()) {
                keys.push(key.as_str());
            }
        }
        keys
    }

    /// Value of the last entry with `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&ListValue> {
        self.entries
            .iter()
            .rev()
            .find(|(entry, _)| entry == key)
            .map(|(_, value)| value)
    }

    /// Text of the last entry with `key`.
    #[must_use]
    pub fn text(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(ListValue::as_text)
    }

    /// Text entries as a map, last occurrence winning.
    #[must_use]
    pub fn to_map(&self) -> HashMap<String, String> {
        self.entries
            .iter()
            .filter_map(|(key, value)| value.as_text().map(|text| (key.clone(), text.to_string())))
            .collect()
    }
}

impl FromIterator<(String, ListValue)> for ParsedList {
    fn from_iter<I: IntoIterator<Item = (String, ListValue)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Decode the list stored under `key`. A missing key is an empty list.
///
/// # Errors
///
/// Returns [`ConfigurationError::InvalidEntry`] for an entry that cannot be
/// split according to `mode`.
pub fn parse_list(
    settings: &Settings,
    key: &str,
    mode: ListMode,
) -> Result<ParsedList, ConfigurationError> {
    let Some(value) = settings.get(key) else {
        return Ok(ParsedList::default());
    };

    entries(value)
        .into_iter()
        .enumerate()
        .map(|(index, entry)| {
            let split = match mode {
                ListMode::Pairs | ListMode::Flags => entry
                    .split_once(char::is_whitespace)
                    .map(|(name, value)| (name.to_string(), value.trim_start().to_string())),
                ListMode::Separator(sep) => entry
                    .split_once(sep)
                    .map(|(name, value)| (name.trim().to_string(), value.trim().to_string())),
            };
            match (split, mode) {
                (Some((name, value)), _) => Ok((name, ListValue::Text(value))),
                (None, ListMode::Flags) => Ok((entry, ListValue::Flag)),
                (None, _) => Err(ConfigurationError::InvalidEntry {
                    entry,
                    setting: key.to_string(),
                    index,
                }),
            }
        })
        .collect()
}
