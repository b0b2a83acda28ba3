//! Core value types: bounding boxes, encodings, labels and the tolerance matcher.

use crate::store::KnownStore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Label reported for a face that matches no enrolled person.
pub const INTRUDER_LABEL: &str = "Intruder";

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Return a copy with every coordinate (box and landmarks) multiplied by `factor`.
    ///
    /// Used to move detections between the downscaled detection frame and the
    /// source frame.
    pub fn scaled(&self, factor: f32) -> Self {
        Self {
            x: self.x * factor,
            y: self.y * factor,
            width: self.width * factor,
            height: self.height * factor,
            confidence: self.confidence,
            landmarks: self
                .landmarks
                .map(|lms| lms.map(|(lx, ly)| (lx * factor, ly * factor))),
        }
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }
}

/// Face encoding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Encoding {
    pub values: Vec<f32>,
}

impl Encoding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dimensions(&self) -> usize {
        self.values.len()
    }

    pub fn comparable(&self, other: &Encoding) -> bool {
        self.values.len() == other.values.len()
    }

    /// Euclidean distance between two encodings of equal length.
    ///
    /// Encodings of different lengths are not comparable; use
    /// [`Encoding::comparable`] first.
    pub fn distance(&self, other: &Encoding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// Identity assigned to a detected face.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Label {
    Known(String),
    Intruder,
}

impl Label {
    pub fn is_intruder(&self) -> bool {
        matches!(self, Label::Intruder)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Label::Known(name) => name,
            Label::Intruder => INTRUDER_LABEL,
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One located face within a processed frame, paired with its encoding.
#[derive(Debug, Clone)]
pub struct Detection {
    /// Box in source-frame coordinates.
    pub bbox: BoundingBox,
    pub encoding: Encoding,
}

/// What a [`Matcher`] concluded about a single observed encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct Identification {
    pub label: Label,
    /// Distance to the selected encoding for a known person, or to the
    /// nearest stored encoding for an intruder. `None` for an empty store.
    pub distance: Option<f32>,
}

/// Result of matching one detection against the known store.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub detection: Detection,
    pub label: Label,
    pub distance: Option<f32>,
}

impl MatchResult {
    pub fn new(detection: Detection, identification: Identification) -> Self {
        Self {
            detection,
            label: identification.label,
            distance: identification.distance,
        }
    }

    pub fn is_intruder(&self) -> bool {
        self.label.is_intruder()
    }
}

/// Strategy for deciding which known person (if any) an observed encoding belongs to.
pub trait Matcher {
    fn identify(&self, observed: &Encoding, store: &KnownStore) -> Identification;
}

/// Distance at or below which two encodings are considered the same face.
///
/// ArcFace encodings are L2-normalized, so a Euclidean distance of 1.10
/// corresponds to a cosine similarity of roughly 0.40.
pub const DEFAULT_MATCH_TOLERANCE: f32 = 1.10;

/// Tolerance matcher with a positional tie-break.
///
/// The store is flattened into (name, encoding) pairs in store order, each
/// person's encodings in enrollment order. Every pair within `tolerance` is a
/// match and the FIRST match in that order wins, even when a later pair is
/// closer. Stored encodings of a different length never match.
#[derive(Debug, Clone, Copy)]
pub struct FirstMatch {
    pub tolerance: f32,
}

impl Default for FirstMatch {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_MATCH_TOLERANCE,
        }
    }
}

impl Matcher for FirstMatch {
    fn identify(&self, observed: &Encoding, store: &KnownStore) -> Identification {
        let mut nearest: Option<f32> = None;

        for (name, known) in store.flattened() {
            if !observed.comparable(known) {
                continue;
            }
            let distance = observed.distance(known);
            if distance <= self.tolerance {
                return Identification {
                    label: Label::Known(name.to_string()),
                    distance: Some(distance),
                };
            }
            nearest = Some(nearest.map_or(distance, |d| d.min(distance)));
        }

        Identification {
            label: Label::Intruder,
            distance: nearest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::KnownPerson;

    fn enc(values: &[f32]) -> Encoding {
        Encoding::new(values.to_vec())
    }

    fn store(people: Vec<(&str, Vec<Vec<f32>>)>) -> KnownStore {
        let mut store = KnownStore::new();
        for (name, encodings) in people {
            let encodings = encodings.into_iter().map(Encoding::new).collect();
            store.insert(KnownPerson::new(name, encodings)).unwrap();
        }
        store
    }

    #[test]
    fn test_distance_identical_is_zero() {
        let a = enc(&[0.3, 0.4, 0.5]);
        assert_eq!(a.distance(&a), 0.0);
    }

    #[test]
    fn test_distance_known_value() {
        let a = enc(&[0.0, 0.0]);
        let b = enc(&[3.0, 4.0]);
        assert!((a.distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_exact_encoding_matches_owner() {
        let store = store(vec![
            ("Alice", vec![vec![1.0, 0.0, 0.0]]),
            ("Bob", vec![vec![0.0, 1.0, 0.0]]),
        ]);
        let result = FirstMatch { tolerance: 0.6 }.identify(&enc(&[0.0, 1.0, 0.0]), &store);
        assert_eq!(result.label, Label::Known("Bob".into()));
        assert_eq!(result.distance, Some(0.0));
    }

    #[test]
    fn test_far_encoding_is_intruder() {
        let store = store(vec![("Alice", vec![vec![1.0, 0.0, 0.0]])]);
        let result = FirstMatch { tolerance: 0.6 }.identify(&enc(&[-1.0, 0.0, 0.0]), &store);
        assert!(result.label.is_intruder());
        assert!((result.distance.unwrap() - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_tolerance_is_inclusive() {
        let store = store(vec![("Alice", vec![vec![0.0, 0.0]])]);
        let result = FirstMatch { tolerance: 0.5 }.identify(&enc(&[0.5, 0.0]), &store);
        assert_eq!(result.label, Label::Known("Alice".into()));
    }

    #[test]
    fn test_empty_store_is_intruder() {
        let result = FirstMatch::default().identify(&enc(&[1.0, 0.0]), &KnownStore::new());
        assert_eq!(result.label, Label::Intruder);
        assert_eq!(result.distance, None);
    }

    #[test]
    fn test_first_match_wins_over_closest() {
        // Carol is an exact match but Alice's second encoding comes first in
        // flattened order and is still within tolerance.
        let store = store(vec![
            ("Alice", vec![vec![5.0, 5.0], vec![0.4, 0.0]]),
            ("Carol", vec![vec![0.0, 0.0]]),
        ]);
        let result = FirstMatch { tolerance: 0.6 }.identify(&enc(&[0.0, 0.0]), &store);
        assert_eq!(result.label, Label::Known("Alice".into()));
        assert!((result.distance.unwrap() - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_later_encoding_of_same_person_matches() {
        let store = store(vec![
            ("Alice", vec![vec![9.0, 9.0]]),
            ("Bob", vec![vec![5.0, 5.0], vec![1.0, 1.0]]),
        ]);
        let result = FirstMatch { tolerance: 0.6 }.identify(&enc(&[1.0, 1.0]), &store);
        assert_eq!(result.label, Label::Known("Bob".into()));
    }

    #[test]
    fn test_intruder_reports_nearest_distance() {
        let store = store(vec![("Alice", vec![vec![3.0, 0.0]]), ("Bob", vec![vec![2.0, 0.0]])]);
        let result = FirstMatch { tolerance: 0.6 }.identify(&enc(&[0.0, 0.0]), &store);
        assert!(result.label.is_intruder());
        assert!((result.distance.unwrap() - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_length_mismatch_never_matches() {
        // The first two values agree exactly; the full vectors are far apart.
        let store = store(vec![("Alice", vec![vec![1.0, 0.0]])]);
        let result = FirstMatch { tolerance: 0.6 }.identify(&enc(&[1.0, 0.0, 9.0, -9.0]), &store);
        assert_eq!(result.label, Label::Intruder);
        assert_eq!(result.distance, None);
    }

    #[test]
    fn test_scaled_roundtrip() {
        let original = BoundingBox {
            x: 101.0,
            y: 57.0,
            width: 80.0,
            height: 96.0,
            confidence: 0.9,
            landmarks: Some([
                (120.0, 90.0),
                (160.0, 90.0),
                (140.0, 110.0),
                (125.0, 130.0),
                (155.0, 130.0),
            ]),
        };
        let factor = 0.8;
        let back = original.scaled(factor).scaled(1.0 / factor);
        assert!((back.x - original.x).abs() < 1e-3);
        assert!((back.y - original.y).abs() < 1e-3);
        assert!((back.right() - original.right()).abs() < 1e-3);
        assert!((back.bottom() - original.bottom()).abs() < 1e-3);
        let (lx, ly) = back.landmarks.unwrap()[2];
        assert!((lx - 140.0).abs() < 1e-3 && (ly - 110.0).abs() < 1e-3);
        assert_eq!(back.confidence, original.confidence);
    }

    #[test]
    fn test_label_display() {
        assert_eq!(Label::Intruder.to_string(), "Intruder");
        assert_eq!(Label::Known("Alice".into()).to_string(), "Alice");
    }
}
