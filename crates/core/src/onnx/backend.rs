//! Execution-provider selection and session construction.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use tracing::{debug, error, info, warn};

/// Inference backend selection.
///
/// `Tensorrt` registers CUDA as a fallback provider, so a missing TensorRT
/// runtime degrades to CUDA instead of failing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InferenceBackend {
    #[default]
    Cuda,
    Tensorrt,
}

impl InferenceBackend {
    /// Parse from string (case-insensitive). Returns `Cuda` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "tensorrt" | "trt" => Self::Tensorrt,
            _ => Self::Cuda,
        }
    }
}

impl fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub backend: InferenceBackend,
    /// Engine cache directory; only used by TensorRT.
    pub trt_cache_dir: Option<&'a Path>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct CacheStats {
    file_count: u64,
    total_bytes: u64,
}

fn cache_stats(root: &Path) -> CacheStats {
    let mut stats = CacheStats::default();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if let Ok(meta) = entry.metadata() {
                stats.file_count += 1;
                stats.total_bytes += meta.len();
            }
        }
    }

    stats
}

/// Engines are specific to the model and its input resolution.
pub fn trt_cache_key(model_path: &Path, input_h: usize, input_w: usize) -> String {
    let stem = model_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "model".to_string());
    format!("{stem}_{input_h}x{input_w}")
}

pub fn resolve_trt_cache_dir(base_dir: &Path, cache_key: Option<&str>) -> PathBuf {
    match cache_key {
        Some(key) => base_dir.join(key),
        None => base_dir.to_path_buf(),
    }
}

/// Log every 15 s while `work` runs; TensorRT engine builds can take minutes.
fn with_progress_log<T>(label: &'static str, work: impl FnOnce() -> T) -> T {
    let (stop_tx, stop_rx) = channel::<()>();
    let ticker = thread::spawn(move || {
        let tick = Duration::from_secs(15);
        let mut elapsed = 15_u64;
        loop {
            match stop_rx.recv_timeout(tick) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    info!(elapsed_secs = elapsed, "{label} still in progress");
                    elapsed += 15;
                }
            }
        }
    });

    let result = work();
    let _ = stop_tx.send(());
    let _ = ticker.join();
    result
}

/// Build an `ort::Session` for the requested backend.
///
/// TensorRT registers the TRT provider with FP16 engines cached under
/// `trt_cache_dir`, followed by CUDA. CUDA registers only the CUDA provider;
/// if it is unavailable ORT runs on CPU.
pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    let model_path = config.model_path;

    match config.backend {
        InferenceBackend::Tensorrt => {
            let cache_dir = config.trt_cache_dir.unwrap_or_else(|| Path::new("trt_cache"));
            if let Err(e) = std::fs::create_dir_all(cache_dir) {
                warn!(dir = %cache_dir.display(), error = %e, "Failed to create TRT cache directory");
            }

            let before = cache_stats(cache_dir);
            let started = Instant::now();
            info!(
                cache_dir = %cache_dir.display(),
                cache_files = before.file_count,
                cache_bytes = before.total_bytes,
                "Initializing TensorRT session (first run may take several minutes)"
            );

            let cache_path = cache_dir.to_string_lossy().to_string();
            let result = with_progress_log("TensorRT session initialization", || -> Result<Session> {
                builder
                    .with_execution_providers([
                        TensorRTExecutionProvider::default()
                            .with_engine_cache(true)
                            .with_engine_cache_path(&cache_path)
                            .with_fp16(true)
                            .with_device_id(0)
                            .build(),
                        CUDAExecutionProvider::default().build(),
                    ])?
                    .commit_from_file(model_path)
                    .with_context(|| format!("Failed to load ONNX model: {}", model_path.display()))
            });

            let elapsed_secs = started.elapsed().as_secs_f64();
            let after = cache_stats(cache_dir);
            match result {
                Ok(session) => {
                    let cache_updated = after != before;
                    info!(
                        elapsed_secs,
                        cache_files = after.file_count,
                        cache_bytes = after.total_bytes,
                        cache_updated,
                        "TensorRT session ready"
                    );
                    Ok(session)
                }
                Err(e) => {
                    error!(elapsed_secs, error = %e, "TensorRT session initialization failed");
                    Err(e)
                }
            }
        }
        InferenceBackend::Cuda => {
            let cuda = CUDAExecutionProvider::default();
            if !cuda.is_available().unwrap_or(false) {
                warn!("CUDA EP is not available; inference will fall back to CPU");
            }
            debug!(backend = "cuda", model = %model_path.display(), "Building session with CUDA EP");

            builder
                .with_execution_providers([cuda.build()])?
                .commit_from_file(model_path)
                .with_context(|| format!("Failed to load ONNX model: {}", model_path.display()))
        }
    }
}
