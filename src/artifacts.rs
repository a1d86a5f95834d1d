//! Canonical artifact resolution.
//!
//! Backends describe run outputs inconsistently: some key the artifact map by filename,
//! others by an opaque id with the filename in a `name` field. This module folds both
//! shapes into four fixed slots.
//!
//! Resolution order per slot:
//! 1. a key equal to the canonical filename (null, false, 0 and "" values do not count);
//! 2. otherwise the first record (in document order) whose `name` equals the filename.
//!
//! Duplicate `name` matches are not disambiguated; the first one encountered wins.

use crate::model::{ArtifactRecord, Run};
use serde::ser::{SerializeMap, SerializeStruct};
use serde::{Serialize, Serializer};

/// The four files every run is expected to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CanonicalArtifact {
    Preview,
    Change,
    Mesh,
    Summary,
}

impl CanonicalArtifact {
    pub const ALL: [CanonicalArtifact; 4] = [
        CanonicalArtifact::Preview,
        CanonicalArtifact::Change,
        CanonicalArtifact::Mesh,
        CanonicalArtifact::Summary,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            CanonicalArtifact::Preview => "preview.png",
            CanonicalArtifact::Change => "change.geojson",
            CanonicalArtifact::Mesh => "mesh.ply",
            CanonicalArtifact::Summary => "run_summary.json",
        }
    }

    fn index(self) -> usize {
        match self {
            CanonicalArtifact::Preview => 0,
            CanonicalArtifact::Change => 1,
            CanonicalArtifact::Mesh => 2,
            CanonicalArtifact::Summary => 3,
        }
    }
}

/// Resolution result for one canonical file.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactSlot {
    pub artifact: CanonicalArtifact,
    /// Whether the run describes this file at all.
    pub present: bool,
    /// Download link, if the record carries one yet.
    pub url: Option<String>,
    /// The record the slot was resolved from, kept for display.
    pub record: Option<ArtifactRecord>,
}

impl ArtifactSlot {
    fn absent(artifact: CanonicalArtifact) -> Self {
        Self {
            artifact,
            present: false,
            url: None,
            record: None,
        }
    }

    fn from_record(artifact: CanonicalArtifact, record: &ArtifactRecord) -> Self {
        Self {
            artifact,
            present: true,
            url: record.download_url().map(str::to_string),
            record: Some(record.clone()),
        }
    }

    pub fn is_downloadable(&self) -> bool {
        self.url.is_some()
    }
}

impl Serialize for ArtifactSlot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("ArtifactSlot", 2)?;
        s.serialize_field("present", &self.present)?;
        s.serialize_field("url", &self.url)?;
        s.end()
    }
}

/// Exactly one slot per canonical file, always.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalArtifacts {
    slots: [ArtifactSlot; 4],
}

impl CanonicalArtifacts {
    pub fn get(&self, artifact: CanonicalArtifact) -> &ArtifactSlot {
        &self.slots[artifact.index()]
    }

    pub fn url(&self, artifact: CanonicalArtifact) -> Option<&str> {
        self.get(artifact).url.as_deref()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ArtifactSlot> {
        self.slots.iter()
    }
}

impl Serialize for CanonicalArtifacts {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.slots.len()))?;
        for slot in &self.slots {
            map.serialize_entry(slot.artifact.file_name(), slot)?;
        }
        map.end()
    }
}

/// Fold a run's artifact map into the four canonical slots. Never fails.
pub fn normalize(run: &Run) -> CanonicalArtifacts {
    let resolve = |artifact: CanonicalArtifact| {
        let name = artifact.file_name();
        run.artifacts
            .iter()
            .find(|e| e.key == name)
            .or_else(|| {
                run.artifacts
                    .iter()
                    .find(|e| e.record.name.as_deref() == Some(name))
            })
            .map(|e| ArtifactSlot::from_record(artifact, &e.record))
            .unwrap_or_else(|| ArtifactSlot::absent(artifact))
    };

    CanonicalArtifacts {
        slots: CanonicalArtifact::ALL.map(resolve),
    }
}
