//! Bounded, schema-checked metadata attached to each indexed document.
//!
//! The remote store accepts at most 20 custom metadata entries per document,
//! each either a string or a number. One slot is reserved for
//! [`SOURCE_KEY`], which ties a remote document back to its local file.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Maximum entries the remote accepts per document.
pub const MAX_ENTRIES: usize = 20;
/// Maximum entries a caller may supply (one is reserved).
pub const MAX_USER_ENTRIES: usize = MAX_ENTRIES - 1;
pub const MAX_KEY_LEN: usize = 64;
pub const MAX_STRING_LEN: usize = 256;
const SOURCE_KEY_DIGEST_LEN: usize = 16;
/// Reserved key carrying the stable local file id.
pub const SOURCE_KEY: &str = "uph_source_key";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataValue {
    String(String),
    Numeric(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub key: String,
    pub value: MetadataValue,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MetadataError {
    #[error("too many metadata entries: {0} (max {MAX_USER_ENTRIES})")]
    TooManyEntries(usize),
    #[error("invalid metadata key '{0}'")]
    InvalidKey(String),
    #[error("duplicate metadata key '{0}'")]
    DuplicateKey(String),
    #[error("metadata key '{0}' is reserved")]
    ReservedKey(String),
    #[error("string value for '{0}' exceeds {MAX_STRING_LEN} characters")]
    ValueTooLong(String),
    #[error("numeric value for '{0}' is not finite")]
    NonFinite(String),
}

/// An ordered, validated metadata payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata {
    entries: Vec<MetadataEntry>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from entries, validating the whole payload.
    pub fn from_entries(entries: Vec<MetadataEntry>) -> Result<Self, MetadataError> {
        let metadata = Self { entries };
        metadata.validate()?;
        Ok(metadata)
    }

    pub fn insert_string(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), MetadataError> {
        self.insert(key.into(), MetadataValue::String(value.into()))
    }

    pub fn insert_numeric(&mut self, key: impl Into<String>, value: f64) -> Result<(), MetadataError> {
        self.insert(key.into(), MetadataValue::Numeric(value))
    }

    fn insert(&mut self, key: String, value: MetadataValue) -> Result<(), MetadataError> {
        validate_entry(&key, &value)?;
        if self.entries.iter().any(|e| e.key == key) {
            return Err(MetadataError::DuplicateKey(key));
        }
        if self.entries.len() >= MAX_USER_ENTRIES {
            return Err(MetadataError::TooManyEntries(self.entries.len() + 1));
        }
        self.entries.push(MetadataEntry { key, value });
        Ok(())
    }

    pub fn entries(&self) -> &[MetadataEntry] {
        &self.entries
    }

    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.entries.iter().find(|e| e.key == key).map(|e| &e.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check every schema rule. Payloads read back from storage or built
    /// through `serde` are re-validated before they reach the remote client.
    pub fn validate(&self) -> Result<(), MetadataError> {
        if self.entries.len() > MAX_USER_ENTRIES {
            return Err(MetadataError::TooManyEntries(self.entries.len()));
        }
        for (i, entry) in self.entries.iter().enumerate() {
            validate_entry(&entry.key, &entry.value)?;
            if self.entries[..i].iter().any(|e| e.key == entry.key) {
                return Err(MetadataError::DuplicateKey(entry.key.clone()));
            }
        }
        Ok(())
    }

    /// The payload sent to the remote: user entries plus the reserved
    /// source key.
    pub fn with_source_key(&self, file_id: &str) -> Vec<MetadataEntry> {
        let mut out = self.entries.clone();
        out.push(MetadataEntry {
            key: SOURCE_KEY.to_string(),
            value: MetadataValue::String(source_key_value(file_id)),
        });
        out
    }
}

fn validate_entry(key: &str, value: &MetadataValue) -> Result<(), MetadataError> {
    if key == SOURCE_KEY {
        return Err(MetadataError::ReservedKey(key.to_string()));
    }
    let key_ok = !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if !key_ok {
        return Err(MetadataError::InvalidKey(key.to_string()));
    }
    match value {
        MetadataValue::String(s) if s.chars().count() > MAX_STRING_LEN => {
            Err(MetadataError::ValueTooLong(key.to_string()))
        }
        MetadataValue::Numeric(n) if !n.is_finite() => Err(MetadataError::NonFinite(key.to_string())),
        _ => Ok(()),
    }
}

/// The value stored under [`SOURCE_KEY`] for a given file id.
///
/// Ids that fit are stored verbatim. Longer ids keep their tail behind a
/// digest of the full id, so two paths sharing a long tail stay distinct.
pub fn source_key_value(file_id: &str) -> String {
    let count = file_id.chars().count();
    if count <= MAX_STRING_LEN {
        return file_id.to_string();
    }
    let digest = hex::encode(Sha256::digest(file_id.as_bytes()));
    let prefix = &digest[..SOURCE_KEY_DIGEST_LEN];
    let keep = MAX_STRING_LEN - SOURCE_KEY_DIGEST_LEN - 1;
    let tail: String = file_id.chars().skip(count - keep).collect();
    format!("{}:{}", prefix, tail)
}
