//! Artifact references and the merged manifest

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Location of one produced artifact plus optional integrity metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Path or URI where the artifact was written
    pub location: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,

    /// Hex-encoded SHA-256 of the artifact content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl ArtifactRef {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            size_bytes: None,
            checksum: None,
        }
    }

    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = Some(size_bytes);
        self
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    /// Describe a file on disk, computing its size and SHA-256 checksum
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        let mut file = File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 8192];
        let mut size = 0u64;

        loop {
            let bytes_read = file.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            size += bytes_read as u64;
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(Self {
            location: path.display().to_string(),
            size_bytes: Some(size),
            checksum: Some(hex::encode(hasher.finalize())),
        })
    }
}

/// One manifest row: the artifact key, the stage that produced it, and where it lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub key: String,
    pub stage: String,
    pub artifact: ArtifactRef,
}

/// A key produced by more than one stage
///
/// The first producer keeps the canonical key; the later one is stored
/// under `resolved_key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestConflict {
    pub key: String,
    pub original_stage: String,
    pub conflicting_stage: String,
    pub resolved_key: String,
}

/// Flat, ordered index of every artifact a job produced
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Entries in generator execution order
    pub entries: Vec<ManifestEntry>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<ManifestConflict>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|entry| entry.key == key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Keys in execution order
    pub fn keys(&self) -> Vec<&str> {
        self.entries.iter().map(|entry| entry.key.as_str()).collect()
    }

    /// Entries produced by one stage
    pub fn stage_entries<'a>(&'a self, stage: &'a str) -> impl Iterator<Item = &'a ManifestEntry> + 'a {
        self.entries.iter().filter(move |entry| entry.stage == stage)
    }
}
