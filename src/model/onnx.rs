// 该文件是 Liuguang （流光） 项目的一部分。
// src/model/onnx.rs - ONNX Runtime 推理后端
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::Path;

use ort::session::Session;
use ort::value::{DynValue, Tensor as OrtTensor};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{InferenceEngine, InputShape, InputTensor, Tensor, TensorOutputSet};

#[derive(Error, Debug)]
pub enum OnnxEngineError {
  #[error("模型文件不存在: {0}")]
  ModelNotFound(String),
  #[error("不支持的模型格式: {0}，仅支持 .onnx")]
  UnsupportedFormat(String),
  #[error("模型没有输入")]
  NoInput,
  #[error("ONNX Runtime 错误: {0}")]
  OrtError(#[from] ort::Error),
}

/// ONNX Runtime 会话
pub struct OnnxEngine {
  session: Session,
  input_name: String,
  output_names: Vec<String>,
  input_shape: InputShape,
}

impl OnnxEngine {
  /// 加载模型
  ///
  /// 输入尺寸与布局取自模型声明的固定维度；模型输入为动态轴时使用 `fallback`。
  pub fn load<P: AsRef<Path>>(model_path: P, fallback: InputShape) -> Result<Self, OnnxEngineError> {
    let model_path = model_path.as_ref();
    check_model_path(model_path)?;

    info!("加载模型文件: {}", model_path.display());
    let session = Session::builder()?.commit_from_file(model_path)?;

    let input = session.inputs.first().ok_or(OnnxEngineError::NoInput)?;
    let input_name = input.name.clone();
    let dims: Vec<i64> = input
      .input_type
      .tensor_shape()
      .map(|shape| shape.iter().copied().collect())
      .unwrap_or_default();
    let input_shape = match InputShape::from_model_dims(&dims) {
      Some(shape) => {
        if shape != fallback {
          debug!("使用模型声明的输入 {:?}，忽略 {:?}", shape, fallback);
        }
        shape
      }
      None => {
        warn!("模型输入维度 {:?} 不固定，使用 {:?}", dims, fallback);
        fallback
      }
    };

    let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
    debug!("模型输入: {} {:?}", input_name, input_shape);
    debug!("模型输出: {:?}", output_names);
    info!("模型加载完成");

    Ok(Self {
      session,
      input_name,
      output_names,
      input_shape,
    })
  }
}

/// 模型文件必须存在且为 `.onnx`
fn check_model_path(model_path: &Path) -> Result<(), OnnxEngineError> {
  let is_onnx = model_path
    .extension()
    .is_some_and(|ext| ext.eq_ignore_ascii_case("onnx"));
  if !is_onnx {
    return Err(OnnxEngineError::UnsupportedFormat(
      model_path.display().to_string(),
    ));
  }
  if !model_path.is_file() {
    return Err(OnnxEngineError::ModelNotFound(
      model_path.display().to_string(),
    ));
  }
  Ok(())
}

fn extract_f32(value: &DynValue) -> Result<(Vec<usize>, Vec<f32>), ort::Error> {
  if let Ok((shape, data)) = value.try_extract_tensor::<f32>() {
    let shape = shape.iter().map(|&d| d.max(0) as usize).collect();
    return Ok((shape, data.to_vec()));
  }
  // 部分导出模型的类别输出为 int64
  let (shape, data) = value.try_extract_tensor::<i64>()?;
  let shape = shape.iter().map(|&d| d.max(0) as usize).collect();
  Ok((shape, data.iter().map(|&v| v as f32).collect()))
}

impl InferenceEngine for OnnxEngine {
  type Error = OnnxEngineError;

  fn input_shape(&self) -> InputShape {
    self.input_shape
  }

  fn invoke(&mut self, input: &InputTensor) -> Result<TensorOutputSet, Self::Error> {
    let tensor = OrtTensor::from_array((input.shape, input.data.clone().into_boxed_slice()))?;
    let outputs = self
      .session
      .run(ort::inputs![self.input_name.as_str() => tensor])?;

    let mut tensors = Vec::with_capacity(self.output_names.len());
    for name in &self.output_names {
      let (shape, data) = extract_f32(&outputs[name.as_str()])?;
      tensors.push(Tensor {
        name: Some(name.clone()),
        shape,
        data,
      });
    }
    Ok(TensorOutputSet::new(tensors))
  }
}
