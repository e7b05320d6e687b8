//! ONNX Runtime integration: session construction and the network-backed denoiser.

pub mod backend;
mod denoiser;

pub use backend::{build_session, InferenceBackend, SessionConfig};
pub use denoiser::OnnxDenoiser;
