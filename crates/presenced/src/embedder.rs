//! MobileFaceNet embedding extraction via ONNX Runtime.
//!
//! Turns a preprocessed 112×112×3 face tensor into a raw 192-dimensional
//! embedding. The output is NOT normalized here — the core normalizes every
//! model output itself and never trusts the model to have done so.

use ndarray::Axis;
use ort::session::Session;
use ort::value::TensorRef;
use presence_core::types::EMBEDDING_DIM;
use presence_core::FaceTensor;
use std::path::Path;
use thiserror::Error;

const MODEL_VERSION: &str = "mobilefacenet";

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0} — place the MobileFaceNet ONNX export there")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

// Session-builder calls return `ort::Error<SessionBuilder>` (the builder is
// handed back on failure); bridge it to the plain `ort::Error` the enum stores.
impl From<ort::Error<ort::session::builder::SessionBuilder>> for EmbedderError {
    fn from(e: ort::Error<ort::session::builder::SessionBuilder>) -> Self {
        EmbedderError::Ort(e.into())
    }
}

/// The embedding-model collaborator. The engine is generic over this so
/// tests can substitute a deterministic fake.
pub trait Embedder: Send {
    fn infer(&mut self, tensor: &FaceTensor) -> Result<Vec<f32>, EmbedderError>;
}

/// MobileFaceNet ONNX session.
pub struct OnnxEmbedder {
    session: Session,
}

impl OnnxEmbedder {
    /// Load the MobileFaceNet ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, EmbedderError> {
        if !Path::new(model_path).exists() {
            return Err(EmbedderError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            version = MODEL_VERSION,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded embedding model"
        );

        Ok(Self { session })
    }
}

impl Embedder for OnnxEmbedder {
    /// Run inference on a preprocessed face tensor.
    ///
    /// The tensor gains a batch axis (NHWC, 1×112×112×3) before the session
    /// runs. Returns the raw embedding; a wrong-dimension output is an error.
    fn infer(&mut self, tensor: &FaceTensor) -> Result<Vec<f32>, EmbedderError> {
        let input = tensor.clone().insert_axis(Axis(0));

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        let raw: Vec<f32> = raw_data.to_vec();

        if raw.len() != EMBEDDING_DIM {
            return Err(EmbedderError::InferenceFailed(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(raw)
    }
}
