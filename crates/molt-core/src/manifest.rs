//! Inheritance manifest codec.
//!
//! The manifest is a JSON array of `{"name", "kind", "addr"}` objects carried
//! in a single environment variable of the spawned process. Descriptor
//! numbers are never encoded: record `i` is always at slot `3 + i`.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{MoltError, Result};
use crate::record::ResourceRecord;
use crate::types::{ResourceKind, slot_for_index};

/// Default name of the environment variable carrying the manifest.
pub const DEFAULT_MANIFEST_VAR: &str = "ENDLESS";

/// Ordered sequence of resource records handed to one successor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    records: Vec<ResourceRecord>,
}

impl Manifest {
    /// Creates a manifest from records in slot order.
    #[must_use]
    pub fn new(records: Vec<ResourceRecord>) -> Self {
        Self { records }
    }

    /// Returns the records in slot order.
    #[must_use]
    pub fn records(&self) -> &[ResourceRecord] {
        &self.records
    }

    /// Iterates `(slot, record)` pairs.
    pub fn slots(&self) -> impl Iterator<Item = (i32, &ResourceRecord)> {
        self.records
            .iter()
            .enumerate()
            .map(|(index, record)| (slot_for_index(index), record))
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the manifest holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Encodes the manifest for the successor's environment.
    ///
    /// # Errors
    /// Returns `ManifestCorrupt` if the records violate the key invariants.
    pub fn encode(&self) -> Result<String> {
        self.validate()?;
        serde_json::to_string(&self.records)
            .map_err(|e| MoltError::corrupt(format!("failed to encode manifest: {e}")))
    }

    /// Decodes a manifest read from the environment.
    ///
    /// # Errors
    /// Returns `ManifestCorrupt` on malformed input or violated invariants.
    pub fn decode(text: &str) -> Result<Self> {
        let records: Vec<ResourceRecord> = serde_json::from_str(text)
            .map_err(|e| MoltError::corrupt(format!("failed to parse manifest: {e}")))?;
        let manifest = Self { records };
        manifest.validate()?;
        Ok(manifest)
    }

    /// Checks that listener addresses and file names are unique and that
    /// every listener has an address.
    ///
    /// # Errors
    /// Returns `ManifestCorrupt` describing the first violation.
    pub fn validate(&self) -> Result<()> {
        let mut addresses = HashSet::new();
        let mut names = HashSet::new();

        for (slot, record) in self.slots() {
            match record.kind {
                ResourceKind::NetworkListener => {
                    let address = record.address.as_deref().unwrap_or_default();
                    if address.is_empty() {
                        return Err(MoltError::corrupt(format!(
                            "listener at slot {slot} has no address"
                        )));
                    }
                    if !addresses.insert(address) {
                        return Err(MoltError::corrupt(format!(
                            "duplicate listener address {address}"
                        )));
                    }
                }
                ResourceKind::PlainFile => {
                    if !names.insert(record.name.as_str()) {
                        return Err(MoltError::corrupt(format!(
                            "duplicate file name {}",
                            record.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}
