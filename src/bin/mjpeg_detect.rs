// 该文件是 Liuguang （流光） 项目的一部分。
// src/bin/mjpeg_detect.rs - 读取 MJPEG 流并执行目标检测
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::info;
use url::Url;

use liuguang::{
  FromUrl,
  client::ReconnectingStream,
  detect::{ChannelOrder, DEFAULT_THROUGHPUT_WINDOW, DetectionPipeline, PipelineOptions},
  model::{InputShape, OnnxEngine, TensorLayout},
  report::ReportWrapper,
  task::{ContinuousTask, Task, install_ctrlc_handler},
};

#[derive(ValueEnum, Debug, Clone, Copy)]
enum Layout {
  Nhwc,
  Nchw,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum Channels {
  Rgb,
  Bgr,
}

/// 从 MJPEG 流逐帧检测并报告分数最高的目标
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
  /// MJPEG 流地址
  #[arg(long, env = "MJPEG_URL", default_value = "http://127.0.0.1:8080/mjpeg")]
  stream_url: Url,
  /// 检测模型文件路径（ONNX）
  #[arg(long, env = "MODEL_PATH", default_value = "/app/models/detect.onnx")]
  model: PathBuf,
  /// 分数阈值，范围 [0, 1]
  #[arg(long, env = "SCORE_THRESHOLD", default_value_t = 0.5, value_parser = parse_threshold)]
  threshold: f32,
  /// 模型输入尺寸，格式 WxH；仅在模型输入维度不固定时使用
  #[arg(long, default_value = "300x300", value_parser = parse_size)]
  input_size: (u32, u32),
  /// 输入张量布局；仅在模型输入维度不固定时使用
  #[arg(long, value_enum, default_value_t = Layout::Nhwc)]
  layout: Layout,
  /// 输入通道顺序
  #[arg(long, value_enum, default_value_t = Channels::Rgb)]
  channel_order: Channels,
  /// 结果输出，支持 log: 与 jsonl:///path
  #[arg(long, value_name = "OUTPUT", default_value = "log:")]
  report: Url,
  /// 处理的帧数，0 表示不限
  #[arg(long, value_name = "FRAME_NUMBER", default_value_t = 0)]
  frame_number: usize,
  /// 流结束后的重连间隔（毫秒），不设置则流结束即退出
  #[arg(long, value_name = "MS")]
  reconnect_delay_ms: Option<u64>,
}

fn parse_threshold(value: &str) -> Result<f32, String> {
  let threshold: f32 = value
    .parse()
    .map_err(|e| format!("无效的阈值 '{}': {}", value, e))?;
  if !(0.0..=1.0).contains(&threshold) {
    return Err(format!("阈值必须在 [0, 1] 范围内: {}", threshold));
  }
  Ok(threshold)
}

fn parse_size(value: &str) -> Result<(u32, u32), String> {
  let (w, h) = value
    .split_once(['x', 'X'])
    .ok_or_else(|| format!("尺寸格式应为 WxH: {}", value))?;
  let w: u32 = w.trim().parse().map_err(|e| format!("无效的宽度: {}", e))?;
  let h: u32 = h.trim().parse().map_err(|e| format!("无效的高度: {}", e))?;
  if w == 0 || h == 0 {
    return Err(format!("尺寸不能为 0: {}", value));
  }
  Ok((w, h))
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("流地址: {}", args.stream_url);
  info!("模型文件路径: {}", args.model.display());
  info!("分数阈值: {}", args.threshold);
  info!("结果输出: {}", args.report);

  let input_shape = InputShape {
    width: args.input_size.0,
    height: args.input_size.1,
    layout: match args.layout {
      Layout::Nhwc => TensorLayout::Nhwc,
      Layout::Nchw => TensorLayout::Nchw,
    },
  };
  let engine = OnnxEngine::load(&args.model, input_shape)
    .with_context(|| format!("无法加载模型 {}", args.model.display()))?;

  let options = PipelineOptions {
    threshold: args.threshold,
    channel_order: match args.channel_order {
      Channels::Rgb => ChannelOrder::Rgb,
      Channels::Bgr => ChannelOrder::Bgr,
    },
    throughput_window: DEFAULT_THROUGHPUT_WINDOW,
  };
  let mut pipeline = DetectionPipeline::new(engine, options);
  let report = ReportWrapper::from_url(&args.report)?;

  let stop = Arc::new(AtomicBool::new(false));
  install_ctrlc_handler(stop.clone())?;

  let frames = ReconnectingStream::connect(
    args.stream_url.as_str(),
    args.reconnect_delay_ms.map(Duration::from_millis),
    stop.clone(),
  )
  .with_context(|| format!("无法连接 {}", args.stream_url))?;

  ContinuousTask::default()
    .with_frame_number(Some(args.frame_number))
    .with_stop_flag(stop)
    .run_task(frames, &mut pipeline, &report)?;

  Ok(())
}
