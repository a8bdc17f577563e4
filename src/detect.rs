// 该文件是 Liuguang （流光） 项目的一部分。
// src/detect.rs - 检测流水线：预处理、输出解析、筛选
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::fmt;
use std::time::{Duration, Instant};

use image::{RgbImage, imageops::FilterType};
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::{
  Detection, DetectionSet, InferenceEngine, InputShape, InputTensor, OutputId, Tensor,
  TensorLayout, TensorOutputSet,
};

/// 默认吞吐量统计窗口（周期数）
pub const DEFAULT_THROUGHPUT_WINDOW: u32 = 30;

/// 检测输出的语义角色
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputRole {
  Boxes,
  Classes,
  Scores,
}

impl OutputRole {
  pub const ALL: [OutputRole; 3] = [OutputRole::Boxes, OutputRole::Classes, OutputRole::Scores];

  /// 已知的输出命名
  pub fn known_names(self) -> &'static [&'static str] {
    match self {
      OutputRole::Boxes => &["StatefulPartitionedCall:1", "detection_boxes"],
      OutputRole::Classes => &["StatefulPartitionedCall:3", "detection_classes"],
      OutputRole::Scores => &["StatefulPartitionedCall:0", "detection_scores"],
    }
  }

  /// 按位置回退时的序号
  pub fn position(self) -> usize {
    match self {
      OutputRole::Boxes => 0,
      OutputRole::Classes => 1,
      OutputRole::Scores => 2,
    }
  }
}

impl fmt::Display for OutputRole {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      OutputRole::Boxes => "boxes",
      OutputRole::Classes => "classes",
      OutputRole::Scores => "scores",
    };
    f.write_str(name)
  }
}

/// 输出是如何被解析的
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
  ByName,
  ByPosition,
}

impl fmt::Display for Resolution {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Resolution::ByName => f.write_str("名称"),
      Resolution::ByPosition => f.write_str("位置"),
    }
  }
}

/// 解析出的三个检测输出
#[derive(Debug)]
pub struct ResolvedOutputs<'a> {
  pub boxes: &'a Tensor,
  pub classes: &'a Tensor,
  pub scores: &'a Tensor,
  pub resolution: Resolution,
}

#[derive(Error, Debug, PartialEq)]
pub enum DetectError {
  #[error("无法解析检测输出: {missing:?}")]
  Unresolved { missing: Vec<OutputRole> },
  #[error("输出 {role} 大小不匹配: 期望至少 {expected} 个值, 实际 {actual}")]
  ShapeMismatch {
    role: OutputRole,
    expected: usize,
    actual: usize,
  },
  #[error("推理失败: {0}")]
  Inference(String),
}

fn lookup_by_name<'a>(outputs: &'a TensorOutputSet, role: OutputRole) -> Option<&'a Tensor> {
  role
    .known_names()
    .iter()
    .find_map(|name| outputs.output(&OutputId::Name(name)))
}

/// 两阶段解析：先查已知名称，任一角色缺失则整体按位置 (0, 1, 2) 回退
///
/// 只支持这一种输出约定；位置也不足时返回缺失的角色。
pub fn resolve_outputs(outputs: &TensorOutputSet) -> Result<ResolvedOutputs<'_>, DetectError> {
  let named = OutputRole::ALL.map(|role| lookup_by_name(outputs, role));
  if let [Some(boxes), Some(classes), Some(scores)] = named {
    return Ok(ResolvedOutputs {
      boxes,
      classes,
      scores,
      resolution: Resolution::ByName,
    });
  }

  let positional = OutputRole::ALL.map(|role| outputs.output(&OutputId::Index(role.position())));
  match positional {
    [Some(boxes), Some(classes), Some(scores)] => {
      debug!("输出名称无法识别，按位置解析 (共 {} 个输出)", outputs.len());
      Ok(ResolvedOutputs {
        boxes,
        classes,
        scores,
        resolution: Resolution::ByPosition,
      })
    }
    _ => {
      if outputs.is_empty() {
        warn!("推理没有产生任何输出");
      }
      let missing = OutputRole::ALL
        .into_iter()
        .zip(positional)
        .filter(|(_, tensor)| tensor.is_none())
        .map(|(role, _)| role)
        .collect();
      Err(DetectError::Unresolved { missing })
    }
  }
}

/// 将输出解码为候选检测并按阈值筛选
///
/// 张量视为压平后的一维数据。候选数等于分数个数，框从模型的
/// `(ymin, xmin, ymax, xmax)` 重排为 `(xmin, ymin, xmax, ymax)`。
pub fn decode_detections(
  outputs: &ResolvedOutputs<'_>,
  threshold: f32,
) -> Result<DetectionSet, DetectError> {
  let scores = &outputs.scores.data;
  let count = scores.len();

  let check = |role, tensor: &Tensor, expected: usize| {
    if tensor.data.len() < expected {
      Err(DetectError::ShapeMismatch {
        role,
        expected,
        actual: tensor.data.len(),
      })
    } else {
      Ok(())
    }
  };
  check(OutputRole::Boxes, outputs.boxes, count * 4)?;
  check(OutputRole::Classes, outputs.classes, count)?;

  let items = scores
    .iter()
    .enumerate()
    .filter(|(_, score)| **score >= threshold)
    .map(|(i, &score)| {
      let b = &outputs.boxes.data[i * 4..i * 4 + 4];
      let (ymin, xmin, ymax, xmax) = (b[0], b[1], b[2], b[3]);
      Detection {
        score,
        class_id: outputs.classes.data[i] as i32,
        bbox: [xmin, ymin, xmax, ymax],
      }
    })
    .collect();

  Ok(DetectionSet { items })
}

/// 选出分数最高的检测，分数相同时取索引最靠前的
pub fn select_best(detections: &DetectionSet) -> Option<&Detection> {
  detections.items.iter().fold(None, |best: Option<&Detection>, d| match best {
    Some(b) if b.score >= d.score => Some(b),
    _ => Some(d),
  })
}

/// 颜色通道顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelOrder {
  #[default]
  Rgb,
  Bgr,
}

/// 转换通道顺序、缩放到引擎输入尺寸并归一化到 [0, 1]
pub fn preprocess(image: &RgbImage, shape: &InputShape, order: ChannelOrder) -> InputTensor {
  let resized = image::imageops::resize(image, shape.width, shape.height, FilterType::Triangle);
  let channel_map: [usize; 3] = match order {
    ChannelOrder::Rgb => [0, 1, 2],
    ChannelOrder::Bgr => [2, 1, 0],
  };

  let raw = resized.as_raw();
  let plane = (shape.width * shape.height) as usize;
  let mut data = vec![0f32; plane * 3];

  match shape.layout {
    TensorLayout::Nhwc => {
      for idx in 0..plane {
        for (c, &src) in channel_map.iter().enumerate() {
          data[idx * 3 + c] = raw[idx * 3 + src] as f32 / 255.0;
        }
      }
    }
    TensorLayout::Nchw => {
      for idx in 0..plane {
        for (c, &src) in channel_map.iter().enumerate() {
          data[c * plane + idx] = raw[idx * 3 + src] as f32 / 255.0;
        }
      }
    }
  }

  InputTensor {
    shape: shape.dims(),
    data,
  }
}

/// 每 `window` 个周期计算一次吞吐量，然后重置
#[derive(Debug)]
pub struct ThroughputMeter {
  window: u32,
  cycles: u32,
  started: Instant,
}

impl ThroughputMeter {
  pub fn new(window: u32) -> Self {
    Self {
      window: window.max(1),
      cycles: 0,
      started: Instant::now(),
    }
  }

  /// 记录一个周期，窗口满时返回每秒周期数
  pub fn tick(&mut self) -> Option<f64> {
    self.tick_at(Instant::now())
  }

  fn tick_at(&mut self, now: Instant) -> Option<f64> {
    self.cycles += 1;
    if self.cycles < self.window {
      return None;
    }
    let elapsed = now.duration_since(self.started).max(Duration::from_micros(1));
    let rate = f64::from(self.cycles) / elapsed.as_secs_f64();
    self.cycles = 0;
    self.started = now;
    Some(rate)
  }
}

/// 流水线参数
#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
  pub threshold: f32,
  pub channel_order: ChannelOrder,
  pub throughput_window: u32,
}

impl Default for PipelineOptions {
  fn default() -> Self {
    Self {
      threshold: 0.5,
      channel_order: ChannelOrder::Rgb,
      throughput_window: DEFAULT_THROUGHPUT_WINDOW,
    }
  }
}

/// 单个周期的结果
#[derive(Debug, Clone, PartialEq)]
pub struct CycleOutcome {
  pub detections: DetectionSet,
  pub resolution: Resolution,
}

impl CycleOutcome {
  pub fn best(&self) -> Option<&Detection> {
    select_best(&self.detections)
  }
}

/// 检测流水线：单线程顺序执行，无内部并发
pub struct DetectionPipeline<E> {
  engine: E,
  options: PipelineOptions,
  meter: ThroughputMeter,
}

impl<E: InferenceEngine> DetectionPipeline<E> {
  pub fn new(engine: E, options: PipelineOptions) -> Self {
    Self {
      engine,
      meter: ThroughputMeter::new(options.throughput_window),
      options,
    }
  }

  /// 对一张图像执行完整的检测周期
  pub fn process(&mut self, image: &RgbImage) -> Result<CycleOutcome, DetectError> {
    let shape = self.engine.input_shape();
    let input = preprocess(image, &shape, self.options.channel_order);
    let outputs = self
      .engine
      .invoke(&input)
      .map_err(|e| DetectError::Inference(e.to_string()))?;
    let resolved = resolve_outputs(&outputs)?;
    let detections = decode_detections(&resolved, self.options.threshold)?;
    Ok(CycleOutcome {
      detections,
      resolution: resolved.resolution,
    })
  }

  /// 记录一个周期，窗口满时返回吞吐量
  pub fn record_cycle(&mut self) -> Option<f64> {
    self.meter.tick()
  }
}
