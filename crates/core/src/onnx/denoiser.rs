//! [`Denoiser`] backed by an exported ONNX network.

use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use half::f16;
use ndarray::{Array4, ArrayD, ArrayViewD, Ix4};
use ort::session::{Session, SessionInputValue};
use ort::tensor::TensorElementType;
use ort::value::{DynValue, Tensor, ValueType};
use tracing::{debug, info};

use super::backend::{
    build_session, resolve_trt_cache_dir, trt_cache_key, InferenceBackend, SessionConfig,
};
use crate::config::{InferenceConfig, OnnxInputNames};
use crate::denoiser::{Denoiser, DenoiserInput};
use crate::geometry::Shape2;

pub struct OnnxDenoiser {
    session: Session,
    names: OnnxInputNames,
    output_name: String,
    output_fp16: bool,
    /// Element type of every input the graph declares.
    declared: HashMap<String, TensorElementType>,
    sigma_min: f64,
}

fn tensor_type(ty: &ValueType) -> Option<TensorElementType> {
    match ty {
        ValueType::Tensor { ty, .. } => Some(*ty),
        _ => None,
    }
}

/// A float input converted to the element type the graph declares.
#[derive(Debug, PartialEq)]
enum FloatArray {
    F16(ArrayD<f16>),
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
}

impl FloatArray {
    /// Anything other than FP16 or FP64 is fed as FP32.
    fn convert(view: ArrayViewD<'_, f64>, ty: TensorElementType) -> Self {
        match ty {
            TensorElementType::Float16 => Self::F16(view.mapv(f16::from_f64)),
            TensorElementType::Float64 => Self::F64(view.to_owned()),
            _ => Self::F32(view.mapv(|v| v as f32)),
        }
    }

    fn into_value(self) -> Result<DynValue> {
        let value = match self {
            Self::F16(array) => Tensor::from_array(array)?.into_dyn(),
            Self::F32(array) => Tensor::from_array(array)?.into_dyn(),
            Self::F64(array) => Tensor::from_array(array)?.into_dyn(),
        };
        Ok(value)
    }
}

/// An integer input; narrowed only when the graph asks for int32.
#[derive(Debug, PartialEq)]
enum IndexArray {
    I32(ArrayD<i32>),
    I64(ArrayD<i64>),
}

impl IndexArray {
    fn convert(view: ArrayViewD<'_, i64>, ty: TensorElementType) -> Result<Self> {
        match ty {
            TensorElementType::Int32 => {
                let narrowed = view
                    .iter()
                    .map(|&v| i32::try_from(v))
                    .collect::<Result<Vec<_>, _>>()
                    .context("index input does not fit in int32")?;
                Ok(Self::I32(ArrayD::from_shape_vec(view.raw_dim(), narrowed)?))
            }
            _ => Ok(Self::I64(view.to_owned())),
        }
    }

    fn into_value(self) -> Result<DynValue> {
        let value = match self {
            Self::I32(array) => Tensor::from_array(array)?.into_dyn(),
            Self::I64(array) => Tensor::from_array(array)?.into_dyn(),
        };
        Ok(value)
    }
}

fn check_required(
    declared: &HashMap<String, TensorElementType>,
    names: &OnnxInputNames,
) -> Result<()> {
    for required in [&names.x, &names.x_lr, &names.sigma] {
        if !declared.contains_key(required) {
            let mut known: Vec<_> = declared.keys().collect();
            known.sort();
            bail!("model does not declare required input '{required}' (declared: {known:?})");
        }
    }
    Ok(())
}

/// Pair an optional input with its declared type. Inputs the graph does not
/// declare are dropped; a declared input with no value is an error.
fn optional_input<T>(
    declared: &HashMap<String, TensorElementType>,
    name: &str,
    provided: Option<T>,
) -> Result<Option<(T, TensorElementType)>> {
    let Some(&ty) = declared.get(name) else {
        return Ok(None);
    };
    match provided {
        Some(value) => Ok(Some((value, ty))),
        None => bail!("model declares input '{name}' but none was provided"),
    }
}

impl OnnxDenoiser {
    /// Build a session for `model_path`. `patch_shape` keys the TensorRT
    /// engine cache, `data_dir` anchors a relative cache directory.
    pub fn load(
        model_path: &Path,
        inference: &InferenceConfig,
        patch_shape: Shape2,
        data_dir: &Path,
    ) -> Result<Self> {
        let backend = InferenceBackend::from_str_lossy(&inference.backend);
        let cache_base = crate::config::resolve_relative_to(data_dir, &inference.trt_cache_dir);
        let cache_key = trt_cache_key(model_path, patch_shape.height, patch_shape.width);
        let cache_dir = resolve_trt_cache_dir(&cache_base, Some(&cache_key));

        debug!(
            model = %model_path.display(),
            %backend,
            patch = %patch_shape,
            "Loading ONNX denoiser"
        );

        let session = build_session(&SessionConfig {
            model_path,
            backend,
            trt_cache_dir: Some(&cache_dir),
        })?;

        Self::from_session(session, inference)
    }

    pub fn from_session(session: Session, inference: &InferenceConfig) -> Result<Self> {
        let declared: HashMap<String, TensorElementType> = session
            .inputs()
            .iter()
            .filter_map(|input| Some((input.name().to_string(), tensor_type(input.dtype())?)))
            .collect();

        let names = inference.input_names.clone();
        check_required(&declared, &names)?;

        let output = session
            .outputs()
            .iter()
            .find(|output| output.name() == inference.output_name)
            .or_else(|| session.outputs().first())
            .context("model declares no outputs")?;
        let output_name = output.name().to_string();
        let output_fp16 = tensor_type(output.dtype()) == Some(TensorElementType::Float16);

        info!(
            inputs = ?declared.keys().collect::<Vec<_>>(),
            %output_name,
            output_fp16,
            "Detected denoiser IO"
        );

        Ok(Self {
            session,
            names,
            output_name,
            output_fp16,
            declared,
            sigma_min: inference.net_sigma_min,
        })
    }
}

impl Denoiser for OnnxDenoiser {
    fn sigma_min(&self) -> f64 {
        self.sigma_min
    }

    fn denoise(&mut self, input: &DenoiserInput<'_>) -> Result<Array4<f64>> {
        let mut inputs: Vec<(Cow<'static, str>, SessionInputValue<'static>)> = Vec::new();
        let names = &self.names;

        for (name, view) in [
            (&names.x, input.x.view().into_dyn()),
            (&names.x_lr, input.x_lr.view().into_dyn()),
            (&names.sigma, input.sigma.view().into_dyn()),
        ] {
            let ty = self.declared.get(name).copied().unwrap_or(TensorElementType::Float32);
            let value = FloatArray::convert(view, ty).into_value()?;
            inputs.push((Cow::Owned(name.clone()), value.into()));
        }

        if let Some((labels, ty)) =
            optional_input(&self.declared, &names.class_labels, input.class_labels)?
        {
            let value = FloatArray::convert(labels.view().into_dyn(), ty).into_value()?;
            inputs.push((Cow::Owned(names.class_labels.clone()), value.into()));
        }
        for (name, provided) in [
            (&names.lead_time_label, input.lead_time_label.map(|l| l.view().into_dyn())),
            (&names.global_index, input.global_index.as_ref().map(|g| g.view().into_dyn())),
        ] {
            if let Some((view, ty)) = optional_input(&self.declared, name, provided)? {
                let value = IndexArray::convert(view, ty)?.into_value()?;
                inputs.push((Cow::Owned(name.clone()), value.into()));
            }
        }

        let outputs = self.session.run(inputs)?;
        let output = &outputs[self.output_name.as_str()];
        let denoised = if self.output_fp16 {
            output
                .try_extract_array::<f16>()?
                .mapv(f16::to_f64)
                .into_dimensionality::<Ix4>()?
        } else {
            output
                .try_extract_array::<f32>()?
                .mapv(f64::from)
                .into_dimensionality::<Ix4>()?
        };

        Ok(denoised)
    }
}
