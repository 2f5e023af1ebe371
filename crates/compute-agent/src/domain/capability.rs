//! Host capability descriptor
//!
//! Parses the `key:value` entries an operator configures for a host into the map of
//! capabilities the host advertises to the scheduler (`cpu_arch`, `xpu_arch`,
//! `gpus`, `ib_bus`, custom tags, ...).

use std::collections::BTreeMap;
use std::str::FromStr;

use thiserror::Error;

/// Errors raised while parsing capability entries or values derived from them.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("capability entry `{entry}` is not of the form key:value")]
    MissingSeparator { entry: String },

    #[error("capability entry `{entry}` has an empty key")]
    EmptyKey { entry: String },

    #[error("capability `{key}` is required but not configured")]
    MissingKey { key: String },

    #[error("capability `{key}` has invalid value `{value}`: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

/// Immutable key/value capabilities advertised by this host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityDescriptor {
    entries: BTreeMap<String, String>,
}

impl CapabilityDescriptor {
    /// Parse `key:value` entries.
    ///
    /// The first colon separates key from value, so values may contain colons.
    /// Both sides are trimmed and the last occurrence of a duplicate key wins.
    ///
    /// # Errors
    ///
    /// - [`CapabilityError::MissingSeparator`] if an entry has no colon
    /// - [`CapabilityError::EmptyKey`] if an entry has nothing before the colon
    pub fn parse<I, S>(entries: I) -> Result<Self, CapabilityError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parsed = BTreeMap::new();
        for entry in entries {
            let entry = entry.as_ref();
            if entry.trim().is_empty() {
                continue;
            }
            let (key, value) =
                entry
                    .split_once(':')
                    .ok_or_else(|| CapabilityError::MissingSeparator {
                        entry: entry.to_string(),
                    })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(CapabilityError::EmptyKey {
                    entry: entry.to_string(),
                });
            }
            parsed.insert(key.to_string(), value.trim().to_string());
        }
        Ok(Self { entries: parsed })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Parse the value under `key`, `None` when the key is absent.
    pub fn parse_value<T>(&self, key: &str) -> Result<Option<T>, CapabilityError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|value| {
                value
                    .parse::<T>()
                    .map_err(|e| CapabilityError::InvalidValue {
                        key: key.to_string(),
                        value: value.to_string(),
                        reason: e.to_string(),
                    })
            })
            .transpose()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
