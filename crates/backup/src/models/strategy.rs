//! Download strategy: how eagerly downloaded messages reach the disk

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// When the body log and metadata index are written during a download
///
/// The atomicity contract is the same for all strategies; they only differ
/// in how much is written per flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStrategy {
    /// Write straight to disk, one commit per message
    Direct,
    /// Write bodies immediately, index once per fetched batch
    #[default]
    DelayMetadata,
    /// Buffer bodies and index in memory, write both once per batch
    DelayAll,
}

impl DownloadStrategy {
    pub const ALL: [DownloadStrategy; 3] = [Self::Direct, Self::DelayMetadata, Self::DelayAll];

    /// Configuration file key
    pub fn key(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::DelayMetadata => "delay_metadata",
            Self::DelayAll => "delay_all",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Direct => "write straight to disk",
            Self::DelayMetadata => "delay writing metadata",
            Self::DelayAll => "delay all writes",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.key() == key)
    }

    /// Interpret a raw configuration value
    ///
    /// Unknown strings, legacy `true` and missing values all become the default.
    pub fn from_config_value(value: &serde_json::Value) -> Self {
        value.as_str().and_then(Self::from_key).unwrap_or_default()
    }

    /// Deserialize an optional override, ignoring unrecognised values
    pub(crate) fn deserialize_lenient<'de, D>(deserializer: D) -> Result<Option<Self>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(value.as_str().and_then(Self::from_key))
    }
}

impl fmt::Display for DownloadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}
