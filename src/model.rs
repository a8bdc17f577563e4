// 该文件是 Liuguang （流光） 项目的一部分。
// src/model.rs - 推理引擎接口与检测结果
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::fmt;

/// 输入张量布局
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TensorLayout {
  /// `[1, H, W, C]`
  #[default]
  Nhwc,
  /// `[1, C, H, W]`
  Nchw,
}

/// 引擎要求的输入尺寸与布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputShape {
  pub width: u32,
  pub height: u32,
  pub layout: TensorLayout,
}

impl InputShape {
  pub fn dims(&self) -> [usize; 4] {
    let (w, h) = (self.width as usize, self.height as usize);
    match self.layout {
      TensorLayout::Nhwc => [1, h, w, 3],
      TensorLayout::Nchw => [1, 3, h, w],
    }
  }

  /// 从模型声明的输入维度推断尺寸与布局
  ///
  /// 只接受四维、三通道且高宽固定的输入；动态轴（非正值）或无法识别的
  /// 形状返回 `None`，由调用者给出尺寸。通道维在末尾时视为 NHWC。
  pub fn from_model_dims(dims: &[i64]) -> Option<Self> {
    let [_, d1, d2, d3] = *dims else {
      return None;
    };
    let (height, width, layout) = if d3 == 3 {
      (d1, d2, TensorLayout::Nhwc)
    } else if d1 == 3 {
      (d2, d3, TensorLayout::Nchw)
    } else {
      return None;
    };
    if height <= 0 || width <= 0 {
      return None;
    }
    Some(Self {
      width: u32::try_from(width).ok()?,
      height: u32::try_from(height).ok()?,
      layout,
    })
  }
}

/// 归一化后的浮点输入张量
#[derive(Debug, Clone)]
pub struct InputTensor {
  pub shape: [usize; 4],
  pub data: Vec<f32>,
}

/// 输出标识：名称或声明顺序中的位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputId<'a> {
  Name(&'a str),
  Index(usize),
}

impl fmt::Display for OutputId<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      OutputId::Name(name) => write!(f, "'{}'", name),
      OutputId::Index(index) => write!(f, "#{}", index),
    }
  }
}

/// 一个输出张量
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
  /// 后端声明的名称，可能为空
  pub name: Option<String>,
  pub shape: Vec<usize>,
  pub data: Vec<f32>,
}

impl Tensor {
  pub fn named(name: &str, shape: Vec<usize>, data: Vec<f32>) -> Self {
    Self {
      name: Some(name.to_string()),
      shape,
      data,
    }
  }

  pub fn unnamed(shape: Vec<usize>, data: Vec<f32>) -> Self {
    Self {
      name: None,
      shape,
      data,
    }
  }
}

/// 一次推理的全部输出，按后端声明顺序排列
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TensorOutputSet {
  tensors: Vec<Tensor>,
}

impl TensorOutputSet {
  pub fn new(tensors: Vec<Tensor>) -> Self {
    Self { tensors }
  }

  pub fn len(&self) -> usize {
    self.tensors.len()
  }

  pub fn is_empty(&self) -> bool {
    self.tensors.is_empty()
  }

  /// 按名称或位置取一个输出
  pub fn output(&self, id: &OutputId<'_>) -> Option<&Tensor> {
    match id {
      OutputId::Name(name) => self
        .tensors
        .iter()
        .find(|t| t.name.as_deref() == Some(*name)),
      OutputId::Index(index) => self.tensors.get(*index),
    }
  }
}

/// 推理引擎能力边界
///
/// 加载由各后端的构造函数完成，路径无效时失败。`invoke` 是同步阻塞调用。
pub trait InferenceEngine {
  type Error: std::error::Error + Send + Sync + 'static;

  fn input_shape(&self) -> InputShape;
  fn invoke(&mut self, input: &InputTensor) -> Result<TensorOutputSet, Self::Error>;
}

impl<E: InferenceEngine + ?Sized> InferenceEngine for Box<E> {
  type Error = E::Error;

  fn input_shape(&self) -> InputShape {
    (**self).input_shape()
  }

  fn invoke(&mut self, input: &InputTensor) -> Result<TensorOutputSet, Self::Error> {
    (**self).invoke(input)
  }
}

/// 单个检测结果
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
  pub score: f32,
  pub class_id: i32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]
}

impl fmt::Display for Detection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "score={:.2} class={} box=({:.4}, {:.4}, {:.4}, {:.4})",
      self.score, self.class_id, self.bbox[0], self.bbox[1], self.bbox[2], self.bbox[3]
    )
  }
}

/// 一帧中通过阈值的检测，按张量索引顺序
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionSet {
  pub items: Vec<Detection>,
}

impl DetectionSet {
  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }
}

#[cfg(feature = "onnx")]
mod onnx;
#[cfg(feature = "onnx")]
pub use self::onnx::{OnnxEngine, OnnxEngineError};
