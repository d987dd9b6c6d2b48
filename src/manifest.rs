use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Archive metadata, emitted as `<archive>.metadata`. Canonical form:
/// UTF-8 JSON with sorted keys, so load → emit round-trips byte-identically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub archive_path: String,
    pub archive_size: u64,
    pub sha256: String,
    pub created_at: String,
    pub compression_type: String,
    pub compression_level: u32,
    pub compression_mode: String,
    pub proxmox_type: String,
    pub proxmox_targets: Vec<String>,
    pub proxmox_version: String,
    pub hostname: String,
    pub script_version: String,
    pub encryption_mode: String,
    pub categories_present: Vec<String>,
    pub supports_selective_restore: bool,
}

impl Manifest {
    /// Canonical form requires sorted keys. Serializing the struct
    /// directly would emit fields in declaration order, so go through
    /// `serde_json::Value` first: its object type is a BTreeMap, which
    /// reorders the keys alphabetically. A single trailing newline, no
    /// other trailing whitespace.
    pub fn to_canonical_json(&self) -> Result<String> {
        let value = serde_json::to_value(self).context("serialize manifest")?;
        let mut s = serde_json::to_string_pretty(&value).context("render manifest")?;
        s.push('\n');
        Ok(s)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("parse manifest json")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read manifest {}", path.display()))?;
        Self::from_json(&text)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_canonical_json()?)
            .with_context(|| format!("write manifest {}", path.display()))
    }
}
