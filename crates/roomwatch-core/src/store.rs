//! Known-face encoding store.
//!
//! An ordered mapping from person name to one or more face encodings,
//! persisted as a versioned JSON document. The whole file is read at
//! session start and rewritten in full on every change; there is no
//! concurrent-writer protection (last writer wins).

use crate::types::Encoding;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Current on-disk format version.
pub const STORE_FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("encoding store not found: {0}")]
    NotFound(PathBuf),
    #[error("failed to access encoding store {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed encoding store: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unsupported encoding store version {found}")]
    UnsupportedVersion { found: u32 },
    #[error("encoding for '{name}' has {actual} dimensions, store uses {expected}")]
    DimensionMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("store encodings have {stored} dimensions but the recognizer produces {encoder}")]
    EncoderMismatch { stored: usize, encoder: usize },
    #[error("'{0}' has no encodings")]
    EmptyPerson(String),
    #[error("the name '{0}' already exists in the store")]
    DuplicateName(String),
}

/// One enrolled person and their encodings, in enrollment order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownPerson {
    pub name: String,
    pub enrolled_at: DateTime<Utc>,
    pub encodings: Vec<Encoding>,
}

impl KnownPerson {
    pub fn new(name: impl Into<String>, encodings: Vec<Encoding>) -> Self {
        Self {
            name: name.into(),
            enrolled_at: Utc::now(),
            encodings,
        }
    }
}

/// Serialized form of the store.
#[derive(Debug, Serialize, Deserialize)]
struct StoreDocument {
    version: u32,
    /// Dimensionality shared by every encoding; absent for an empty store.
    dimensions: Option<usize>,
    people: Vec<KnownPerson>,
}

/// In-memory known-face store. Iteration order is insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KnownStore {
    people: Vec<KnownPerson>,
}

impl KnownStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a store file, failing with [`StoreError::NotFound`] if it is absent.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(path.to_path_buf()));
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let doc: StoreDocument = serde_json::from_str(&raw)?;
        if doc.version != STORE_FORMAT_VERSION {
            return Err(StoreError::UnsupportedVersion { found: doc.version });
        }

        let mut store = Self::new();
        for person in doc.people {
            store.insert(person)?;
        }

        if let (Some(declared), Some(actual)) = (doc.dimensions, store.dimensions()) {
            if declared != actual {
                return Err(StoreError::DimensionMismatch {
                    name: store.people[0].name.clone(),
                    expected: declared,
                    actual,
                });
            }
        }

        tracing::debug!(
            path = %path.display(),
            people = store.len(),
            encodings = store.encoding_count(),
            "loaded encoding store"
        );
        Ok(store)
    }

    /// Read a store file, treating a missing file as an empty store.
    pub fn load_or_empty(path: &Path) -> Result<Self, StoreError> {
        match Self::load(path) {
            Err(StoreError::NotFound(_)) => {
                tracing::info!(path = %path.display(), "no encoding store found; starting empty");
                Ok(Self::new())
            }
            other => other,
        }
    }

    /// Write the whole store, replacing the file atomically via a sibling temp file.
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let io_err = |source: std::io::Error| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        let doc = StoreDocument {
            version: STORE_FORMAT_VERSION,
            dimensions: self.dimensions(),
            people: self.people.clone(),
        };
        let json = serde_json::to_string_pretty(&doc)?;

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(io_err)?;
        std::fs::rename(&tmp, path).map_err(io_err)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.people.len()
    }

    pub fn is_empty(&self) -> bool {
        self.people.is_empty()
    }

    /// Total number of encodings across all people.
    pub fn encoding_count(&self) -> usize {
        self.people.iter().map(|p| p.encodings.len()).sum()
    }

    /// Dimensionality of the stored encodings, if any are stored.
    pub fn dimensions(&self) -> Option<usize> {
        self.flattened().next().map(|(_, e)| e.dimensions())
    }

    /// Fail unless the stored encodings are `encoder_dims` wide. An empty
    /// store is compatible with any recognizer.
    pub fn check_dimensions(&self, encoder_dims: usize) -> Result<(), StoreError> {
        match self.dimensions() {
            Some(stored) if stored != encoder_dims => Err(StoreError::EncoderMismatch {
                stored,
                encoder: encoder_dims,
            }),
            _ => Ok(()),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.people.iter().any(|p| p.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&KnownPerson> {
        self.people.iter().find(|p| p.name == name)
    }

    pub fn people(&self) -> impl Iterator<Item = &KnownPerson> {
        self.people.iter()
    }

    /// Every (name, encoding) pair: people in store order, then each
    /// person's encodings in enrollment order.
    pub fn flattened(&self) -> impl Iterator<Item = (&str, &Encoding)> {
        self.people
            .iter()
            .flat_map(|p| p.encodings.iter().map(move |e| (p.name.as_str(), e)))
    }

    /// Append a new person. Existing names are never overwritten.
    pub fn insert(&mut self, person: KnownPerson) -> Result<(), StoreError> {
        if self.contains(&person.name) {
            return Err(StoreError::DuplicateName(person.name));
        }
        if person.encodings.is_empty() {
            return Err(StoreError::EmptyPerson(person.name));
        }

        let expected = self
            .dimensions()
            .unwrap_or_else(|| person.encodings[0].dimensions());
        if let Some(bad) = person.encodings.iter().find(|e| e.dimensions() != expected) {
            return Err(StoreError::DimensionMismatch {
                name: person.name.clone(),
                expected,
                actual: bad.dimensions(),
            });
        }

        self.people.push(person);
        Ok(())
    }

    /// Remove a person by name, returning their record if present.
    pub fn remove(&mut self, name: &str) -> Option<KnownPerson> {
        let idx = self.people.iter().position(|p| p.name == name)?;
        Some(self.people.remove(idx))
    }
}

/// Outcome of [`add_known_person`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollOutcome {
    Added,
    AlreadyExists,
    NoFaceDetected,
}

/// Outcome of [`delete_person`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Removed,
    NotFound,
    NoStore,
}

/// Enroll `name` with the encoding produced by `capture`.
///
/// The store is checked for the name before `capture` runs, so a duplicate
/// never costs a camera session. `capture` returns `Ok(None)` when no face
/// was found. The store file is only written on [`EnrollOutcome::Added`].
pub fn add_known_person<F, E>(path: &Path, name: &str, capture: F) -> Result<EnrollOutcome, E>
where
    F: FnOnce() -> Result<Option<Encoding>, E>,
    E: From<StoreError>,
{
    let mut store = KnownStore::load_or_empty(path)?;
    if store.contains(name) {
        tracing::info!(name, "enroll refused: name already exists");
        return Ok(EnrollOutcome::AlreadyExists);
    }

    let Some(encoding) = capture()? else {
        tracing::info!(name, "enroll aborted: no face detected");
        return Ok(EnrollOutcome::NoFaceDetected);
    };

    store.insert(KnownPerson::new(name, vec![encoding]))?;
    store.save(path)?;
    tracing::info!(name, path = %path.display(), "person enrolled");
    Ok(EnrollOutcome::Added)
}

/// Remove `name` from the store file. Nothing is written unless a person was removed.
pub fn delete_person(path: &Path, name: &str) -> Result<DeleteOutcome, StoreError> {
    let mut store = match KnownStore::load(path) {
        Ok(store) => store,
        Err(StoreError::NotFound(_)) => return Ok(DeleteOutcome::NoStore),
        Err(e) => return Err(e),
    };

    if store.remove(name).is_none() {
        return Ok(DeleteOutcome::NotFound);
    }

    store.save(path)?;
    tracing::info!(name, path = %path.display(), "person removed");
    Ok(DeleteOutcome::Removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn enc(values: &[f32]) -> Encoding {
        Encoding::new(values.to_vec())
    }

    fn store_path(dir: &TempDir) -> PathBuf {
        dir.path().join("encodings.json")
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = KnownStore::load(&store_path(&dir)).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(KnownStore::load_or_empty(&store_path(&dir)).unwrap().is_empty());
    }

    #[test]
    fn test_save_load_preserves_order() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);

        let mut store = KnownStore::new();
        store.insert(KnownPerson::new("Zed", vec![enc(&[1.0, 0.0])])).unwrap();
        store
            .insert(KnownPerson::new("Amy", vec![enc(&[0.0, 1.0]), enc(&[0.5, 0.5])]))
            .unwrap();
        store.save(&path).unwrap();

        let loaded = KnownStore::load(&path).unwrap();
        assert_eq!(loaded, store);
        let names: Vec<&str> = loaded.flattened().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["Zed", "Amy", "Amy"]);
        assert_eq!(loaded.dimensions(), Some(2));
        assert_eq!(loaded.encoding_count(), 3);
    }

    #[test]
    fn test_insert_rejects_duplicate_and_mismatched_dimensions() {
        let mut store = KnownStore::new();
        store.insert(KnownPerson::new("Alice", vec![enc(&[1.0, 0.0])])).unwrap();

        let dup = store.insert(KnownPerson::new("Alice", vec![enc(&[0.0, 1.0])]));
        assert!(matches!(dup, Err(StoreError::DuplicateName(_))));

        let wide = store.insert(KnownPerson::new("Bob", vec![enc(&[1.0, 0.0, 0.0])]));
        assert!(matches!(
            wide,
            Err(StoreError::DimensionMismatch { expected: 2, actual: 3, .. })
        ));

        let empty = store.insert(KnownPerson::new("Carol", vec![]));
        assert!(matches!(empty, Err(StoreError::EmptyPerson(_))));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_load_rejects_unknown_version() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);
        std::fs::write(&path, r#"{"version": 9, "dimensions": null, "people": []}"#).unwrap();
        let err = KnownStore::load(&path).unwrap_err();
        assert!(matches!(err, StoreError::UnsupportedVersion { found: 9 }));
    }

    #[test]
    fn test_load_rejects_mixed_dimensions() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);
        let json = r#"{
            "version": 1,
            "dimensions": 2,
            "people": [
                {"name": "A", "enrolled_at": "2026-01-01T00:00:00Z", "encodings": [[1.0, 0.0]]},
                {"name": "B", "enrolled_at": "2026-01-01T00:00:00Z", "encodings": [[1.0, 0.0, 0.0]]}
            ]
        }"#;
        std::fs::write(&path, json).unwrap();
        let err = KnownStore::load(&path).unwrap_err();
        assert!(matches!(err, StoreError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_load_rejects_wrong_declared_dimensions() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);
        let json = r#"{
            "version": 1,
            "dimensions": 128,
            "people": [
                {"name": "A", "enrolled_at": "2026-01-01T00:00:00Z", "encodings": [[1.0, 0.0]]}
            ]
        }"#;
        std::fs::write(&path, json).unwrap();
        assert!(matches!(
            KnownStore::load(&path),
            Err(StoreError::DimensionMismatch { expected: 128, actual: 2, .. })
        ));
    }

    #[test]
    fn test_check_dimensions_against_recognizer() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);
        let json = r#"{
            "version": 1,
            "dimensions": 2,
            "people": [
                {"name": "Alice", "enrolled_at": "2026-01-01T00:00:00Z", "encodings": [[1.0, 0.0]]}
            ]
        }"#;
        std::fs::write(&path, json).unwrap();

        let store = KnownStore::load(&path).unwrap();
        assert!(store.check_dimensions(2).is_ok());
        assert!(matches!(
            store.check_dimensions(512),
            Err(StoreError::EncoderMismatch { stored: 2, encoder: 512 })
        ));
        assert!(KnownStore::new().check_dimensions(512).is_ok());
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(KnownStore::load(&path), Err(StoreError::Malformed(_))));
    }

    #[test]
    fn test_enroll_adds_then_refuses_duplicate() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);

        let first =
            add_known_person::<_, StoreError>(&path, "Alice", || Ok(Some(enc(&[1.0, 0.0]))));
        assert_eq!(first.unwrap(), EnrollOutcome::Added);
        let before = std::fs::read_to_string(&path).unwrap();

        let mut captured = false;
        let second = add_known_person::<_, StoreError>(&path, "Alice", || {
            captured = true;
            Ok(Some(enc(&[0.0, 1.0])))
        });
        assert_eq!(second.unwrap(), EnrollOutcome::AlreadyExists);
        assert!(!captured, "capture must not run for a duplicate name");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
    }

    #[test]
    fn test_enroll_without_face_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);
        let outcome = add_known_person::<_, StoreError>(&path, "Alice", || Ok(None)).unwrap();
        assert_eq!(outcome, EnrollOutcome::NoFaceDetected);
        assert!(!path.exists());
    }

    #[test]
    fn test_delete_outcomes() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);

        assert_eq!(delete_person(&path, "Alice").unwrap(), DeleteOutcome::NoStore);
        assert!(!path.exists());

        add_known_person::<_, StoreError>(&path, "Alice", || Ok(Some(enc(&[1.0, 0.0])))).unwrap();
        add_known_person::<_, StoreError>(&path, "Bob", || Ok(Some(enc(&[0.0, 1.0])))).unwrap();

        let before = std::fs::read_to_string(&path).unwrap();
        assert_eq!(delete_person(&path, "Mallory").unwrap(), DeleteOutcome::NotFound);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);

        assert_eq!(delete_person(&path, "Alice").unwrap(), DeleteOutcome::Removed);
        let store = KnownStore::load(&path).unwrap();
        assert!(!store.contains("Alice"));
        assert!(store.contains("Bob"));
    }

    #[test]
    fn test_delete_last_person_keeps_empty_store() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);
        add_known_person::<_, StoreError>(&path, "Alice", || Ok(Some(enc(&[1.0, 0.0])))).unwrap();
        assert_eq!(delete_person(&path, "Alice").unwrap(), DeleteOutcome::Removed);
        let store = KnownStore::load(&path).unwrap();
        assert!(store.is_empty());
        assert_eq!(store.dimensions(), None);
    }
}
