//! ArcFace face recognizer via ONNX Runtime.
//!
//! Turns an aligned 112×112 face crop into an L2-normalized 512-dimensional
//! encoding using the w600k_r50 ArcFace model.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::types::{BoundingBox, Encoding};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric, unlike SCRFD
/// Length of every encoding [`FaceRecognizer`] produces.
pub const ARCFACE_ENCODING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} (download from insightface and place it in the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face has no landmarks; the detector must return landmarks for alignment")]
    NoLandmarks,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Anything that can turn a detected face into an identity encoding.
pub trait FaceEncode {
    /// `face` must be in the coordinates of `image`.
    fn encode(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Encoding, RecognizerError>;
}

/// ArcFace-based face recognizer.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    /// Load an ArcFace ONNX model (e.g. `w600k_r50.onnx`).
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Aligned RGB crop → NCHW float tensor.
    fn preprocess(aligned: &RgbImage) -> Array4<f32> {
        let size = ALIGNED_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in aligned.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] =
                    (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            }
        }
        tensor
    }
}

/// Scale to unit length; a zero vector is returned unchanged.
fn l2_normalize(mut values: Vec<f32>) -> Vec<f32> {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.iter_mut().for_each(|v| *v /= norm);
    }
    values
}

impl FaceEncode for FaceRecognizer {
    fn encode(
        &mut self,
        image: &RgbImage,
        face: &BoundingBox,
    ) -> Result<Encoding, RecognizerError> {
        let landmarks = face.landmarks.as_ref().ok_or(RecognizerError::NoLandmarks)?;
        let aligned = alignment::align_face(image, landmarks);
        let input = Self::preprocess(&aligned);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("encoding extraction: {e}")))?;

        if raw.len() != ARCFACE_ENCODING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_ENCODING_DIM}-dim encoding, got {}",
                raw.len()
            )));
        }

        Ok(Encoding::new(l2_normalize(raw.to_vec())))
    }
}
