// 该文件是 Liuguang （流光） 项目的一部分。
// src/capture/v4l2_device.rs - V4L2 摄像头设备
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::pin::Pin;

use image::RgbImage;
use tracing::{info, warn};
use v4l::FourCC;
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::video::capture::Parameters;

use super::{CaptureError, DeviceConfig, VideoDevice};

const V4L2_BUFFER_COUNT: u32 = 4;

/// V4L2 摄像头
///
/// v4l 的 Stream 需要引用 Device，这里用 Pin<Box<Device>> 固定设备的地址，
/// 使得同一结构体中的 Stream 可以安全地引用它。
pub struct V4l2Device {
  /// V4L2 设备（使用 Pin<Box> 固定内存位置）
  device: Pin<Box<Device>>,
  /// 捕获流（生命周期与 device 关联）
  stream: Option<Stream<'static>>,
  width: u32,
  height: u32,
}

impl std::fmt::Debug for V4l2Device {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("V4l2Device")
      .field("width", &self.width)
      .field("height", &self.height)
      .finish()
  }
}

impl V4l2Device {
  /// 设备 URL 方案，格式 `v4l:///dev/videoN`
  pub const SCHEME: &'static str = "v4l";

  /// 打开设备并请求 YUYV 格式、分辨率与帧率，驱动可能不接受这些请求
  pub fn open(device_path: &str, config: &DeviceConfig) -> Result<Self, CaptureError> {
    let device_path = if device_path.is_empty() {
      "/dev/video0"
    } else {
      device_path
    };
    info!("打开 V4L2 设备: {}", device_path);
    let device = Box::pin(Device::with_path(device_path)?);

    let mut format = device.format()?;
    format.width = config.width;
    format.height = config.height;
    format.fourcc = FourCC::new(b"YUYV");
    let format = device.set_format(&format)?;
    if format.fourcc != FourCC::new(b"YUYV") {
      warn!("设备未接受 YUYV 格式，实际为 {}", format.fourcc);
    }
    if format.width != config.width || format.height != config.height {
      warn!(
        "设备未接受请求的分辨率 {}x{}，实际为 {}x{}",
        config.width, config.height, format.width, format.height
      );
    }

    if let Err(e) = device.set_params(&Parameters::with_fps(config.fps.max(1))) {
      warn!("设置帧率失败: {}", e);
    }

    let width = format.width;
    let height = format.height;

    let mut source = Self {
      device,
      stream: None,
      width,
      height,
    };

    // SAFETY: device 被 Pin<Box> 固定，不会移动，所以引用始终有效。
    // stream 在 Drop 中先于 device 释放。
    let device_ref: &Device = &source.device;
    let stream = unsafe {
      let device_static: &'static Device = std::mem::transmute(device_ref);
      Stream::with_buffers(device_static, Type::VideoCapture, V4L2_BUFFER_COUNT)?
    };

    source.stream = Some(stream);
    info!("V4L2 设备已打开: {}x{}", width, height);
    Ok(source)
  }
}

/// 将 YUYV 格式转换为 RGB
pub(crate) fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Vec<u8> {
  let mut rgb = Vec::with_capacity((width * height * 3) as usize);

  for chunk in yuyv.chunks_exact(4) {
    let y0 = chunk[0] as f32;
    let u = chunk[1] as f32 - 128.0;
    let y1 = chunk[2] as f32;
    let v = chunk[3] as f32 - 128.0;

    for y in [y0, y1] {
      let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
      let g = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
      let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
      rgb.extend_from_slice(&[r, g, b]);
    }
  }

  rgb
}

impl Drop for V4l2Device {
  fn drop(&mut self) {
    // 确保 stream 在 device 之前被 drop
    self.stream.take();
  }
}

impl VideoDevice for V4l2Device {
  fn read_frame(&mut self) -> Result<RgbImage, CaptureError> {
    let stream = self
      .stream
      .as_mut()
      .ok_or_else(|| CaptureError::IoError(std::io::Error::other("捕获流未初始化")))?;

    let (buffer, _meta) = stream.next()?;
    let rgb = yuyv_to_rgb(buffer, self.width, self.height);
    let expected = (self.width * self.height * 3) as usize;
    let actual = rgb.len();
    RgbImage::from_raw(self.width, self.height, rgb)
      .ok_or(CaptureError::FrameSizeMismatch { expected, actual })
  }
}
