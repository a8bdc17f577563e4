// 该文件是 Liuguang （流光） 项目的一部分。
// src/capture.rs - 视频设备与采集循环
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

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use image::RgbImage;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::frame::{Frame, FrameSlot};

mod pattern;
mod still_image;
#[cfg(feature = "v4l_capture")]
mod v4l2_device;

pub use self::pattern::PatternDevice;
pub use self::still_image::StillImageDevice;
#[cfg(feature = "v4l_capture")]
pub use self::v4l2_device::V4l2Device;

#[derive(Error, Debug)]
pub enum CaptureError {
  #[error("设备 URL 无效: {0}")]
  InvalidUrl(String),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("帧数据大小不匹配: 期望 {expected}, 实际 {actual}")]
  FrameSizeMismatch { expected: usize, actual: usize },
  #[error("采集线程意外退出")]
  ThreadExited,
}

/// 视频设备
///
/// 打开在构造时完成，之后每次调用读取一帧。读取失败被视为暂时性的。
pub trait VideoDevice {
  fn read_frame(&mut self) -> Result<RgbImage, CaptureError>;
}

impl<D: VideoDevice + ?Sized> VideoDevice for Box<D> {
  fn read_frame(&mut self) -> Result<RgbImage, CaptureError> {
    (**self).read_frame()
  }
}

/// 期望的采集参数，设备可能会忽略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
  pub width: u32,
  pub height: u32,
  pub fps: u32,
}

impl Default for DeviceConfig {
  fn default() -> Self {
    Self {
      width: 1280,
      height: 720,
      fps: 15,
    }
  }
}

impl DeviceConfig {
  /// 采集周期 `1 / max(1, fps)`
  pub fn period(&self) -> Duration {
    Duration::from_secs_f64(1.0 / f64::from(self.fps.max(1)))
  }
}

/// 解析设备参数，裸设备路径视为 `v4l://`
pub fn parse_device_url(source: &str) -> Result<Url, CaptureError> {
  if source.starts_with('/') {
    return Url::parse(&format!("v4l://{}", source))
      .map_err(|e| CaptureError::InvalidUrl(e.to_string()));
  }
  Url::parse(source).map_err(|e| CaptureError::InvalidUrl(e.to_string()))
}

pub enum DeviceWrapper {
  #[cfg(feature = "v4l_capture")]
  V4l2(V4l2Device),
  StillImage(StillImageDevice),
  Pattern(PatternDevice),
}

impl DeviceWrapper {
  /// 按 URL 方案打开设备
  #[cfg_attr(not(feature = "v4l_capture"), allow(unused_variables))]
  pub fn open(url: &Url, config: &DeviceConfig) -> Result<Self, CaptureError> {
    use crate::{FromUrl, FromUrlWithScheme};

    match url.scheme() {
      #[cfg(feature = "v4l_capture")]
      V4l2Device::SCHEME => Ok(DeviceWrapper::V4l2(V4l2Device::open(url.path(), config)?)),
      StillImageDevice::SCHEME => Ok(DeviceWrapper::StillImage(StillImageDevice::from_url(url)?)),
      PatternDevice::SCHEME => Ok(DeviceWrapper::Pattern(PatternDevice::from_url(url)?)),
      other => {
        error!("不支持的设备方案: {}", other);
        Err(CaptureError::SchemeMismatch(other.to_string()))
      }
    }
  }
}

impl VideoDevice for DeviceWrapper {
  fn read_frame(&mut self) -> Result<RgbImage, CaptureError> {
    match self {
      #[cfg(feature = "v4l_capture")]
      DeviceWrapper::V4l2(device) => device.read_frame(),
      DeviceWrapper::StillImage(device) => device.read_frame(),
      DeviceWrapper::Pattern(device) => device.read_frame(),
    }
  }
}

/// 单次采集的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
  Published,
  Skipped,
}

/// 采集循环：按固定周期读设备并发布到帧槽
pub struct CaptureLoop<D> {
  device: D,
  slot: Arc<FrameSlot>,
  period: Duration,
  frame_index: u64,
  start_time: Instant,
}

impl<D: VideoDevice> CaptureLoop<D> {
  pub fn new(device: D, slot: Arc<FrameSlot>, period: Duration) -> Self {
    Self {
      device,
      slot,
      period,
      frame_index: 0,
      start_time: Instant::now(),
    }
  }

  /// 读一帧；失败时跳过本周期，不发布也不退出
  pub fn tick(&mut self) -> TickOutcome {
    match self.device.read_frame() {
      Ok(image) => {
        let frame = Frame {
          image,
          index: self.frame_index,
          timestamp_ms: self.start_time.elapsed().as_millis() as u64,
        };
        debug!("发布第 {} 帧 ({} ms)", frame.index, frame.timestamp_ms);
        self.frame_index += 1;
        self.slot.publish(frame);
        TickOutcome::Published
      }
      Err(e) => {
        warn!("读取帧失败，跳过本周期: {}", e);
        TickOutcome::Skipped
      }
    }
  }

  /// 运行直到 `stop` 被置位，每个周期检查一次
  pub fn run(mut self, stop: &AtomicBool) {
    info!("采集循环启动，周期 {:.2?}", self.period);
    while !stop.load(Ordering::Relaxed) {
      let started = Instant::now();
      self.tick();
      thread::sleep(self.period.saturating_sub(started.elapsed()));
    }
    info!("采集循环退出，共发布 {} 帧", self.frame_index);
  }
}

/// 后台采集线程的句柄
pub struct CaptureHandle {
  stop: Arc<AtomicBool>,
  handle: Option<JoinHandle<()>>,
}

impl CaptureHandle {
  /// 通知采集线程退出并等待
  pub fn stop(mut self) {
    self.stop.store(true, Ordering::Relaxed);
    if let Some(handle) = self.handle.take() {
      if handle.join().is_err() {
        error!("采集线程 panic");
      }
    }
  }
}

/// 在专用线程上打开设备并启动采集循环
///
/// 设备在采集线程内打开，打开结果同步返回给调用者。打开失败时返回错误，
/// 调用者应在暴露任何服务之前终止。
pub fn spawn_capture<D, F>(
  open: F,
  slot: Arc<FrameSlot>,
  period: Duration,
) -> Result<CaptureHandle, CaptureError>
where
  D: VideoDevice,
  F: FnOnce() -> Result<D, CaptureError> + Send + 'static,
{
  let stop = Arc::new(AtomicBool::new(false));
  let (ready_tx, ready_rx) = mpsc::channel();

  let thread_stop = stop.clone();
  let handle = thread::Builder::new()
    .name("capture".into())
    .spawn(move || {
      let device = match open() {
        Ok(device) => {
          let _ = ready_tx.send(Ok(()));
          device
        }
        Err(e) => {
          let _ = ready_tx.send(Err(e));
          return;
        }
      };
      CaptureLoop::new(device, slot, period).run(&thread_stop);
    })?;

  match ready_rx.recv() {
    Ok(Ok(())) => Ok(CaptureHandle {
      stop,
      handle: Some(handle),
    }),
    Ok(Err(e)) => {
      let _ = handle.join();
      Err(e)
    }
    Err(_) => {
      let _ = handle.join();
      Err(CaptureError::ThreadExited)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::Rgb;

  /// 按脚本返回成功或失败的设备
  struct ScriptedDevice {
    script: Vec<bool>,
    cursor: usize,
  }

  impl VideoDevice for ScriptedDevice {
    fn read_frame(&mut self) -> Result<RgbImage, CaptureError> {
      let ok = self.script.get(self.cursor).copied().unwrap_or(true);
      self.cursor += 1;
      if ok {
        Ok(RgbImage::from_pixel(2, 2, Rgb([self.cursor as u8, 0, 0])))
      } else {
        Err(CaptureError::IoError(std::io::Error::other("transient")))
      }
    }
  }

  #[test]
  fn failed_reads_are_skipped_without_publishing() {
    let slot = Arc::new(FrameSlot::new());
    let device = ScriptedDevice {
      script: vec![false, true, false, true],
      cursor: 0,
    };
    let mut capture = CaptureLoop::new(device, slot.clone(), Duration::from_millis(1));

    assert_eq!(capture.tick(), TickOutcome::Skipped);
    assert!(slot.read().is_none());

    assert_eq!(capture.tick(), TickOutcome::Published);
    let first = slot.read().unwrap();
    assert_eq!(first.index, 0);

    assert_eq!(capture.tick(), TickOutcome::Skipped);
    assert_eq!(slot.read().unwrap().index, 0);

    assert_eq!(capture.tick(), TickOutcome::Published);
    let second = slot.read().unwrap();
    assert_eq!(second.index, 1);
    assert!(second.timestamp_ms >= first.timestamp_ms);
    assert_eq!(second.image.get_pixel(0, 0), &Rgb([4, 0, 0]));
  }

  #[test]
  fn period_follows_fps_with_floor_of_one() {
    let config = DeviceConfig {
      fps: 20,
      ..DeviceConfig::default()
    };
    assert_eq!(config.period(), Duration::from_millis(50));
    let config = DeviceConfig {
      fps: 0,
      ..DeviceConfig::default()
    };
    assert_eq!(config.period(), Duration::from_secs(1));
  }

  #[test]
  fn bare_device_path_becomes_v4l_url() {
    let url = parse_device_url("/dev/video24").unwrap();
    assert_eq!(url.scheme(), "v4l");
    assert_eq!(url.path(), "/dev/video24");

    let url = parse_device_url("pattern://solid?width=2&height=2").unwrap();
    assert_eq!(url.scheme(), "pattern");
  }

  #[test]
  fn unknown_scheme_is_rejected() {
    let url = Url::parse("rtsp://camera/stream").unwrap();
    assert!(matches!(
      DeviceWrapper::open(&url, &DeviceConfig::default()),
      Err(CaptureError::SchemeMismatch(_))
    ));
  }

  #[test]
  fn open_failure_is_returned_before_capture_starts() {
    let slot = Arc::new(FrameSlot::new());
    let result = spawn_capture(
      || -> Result<ScriptedDevice, CaptureError> {
        Err(CaptureError::InvalidUrl("no such device".into()))
      },
      slot.clone(),
      Duration::from_millis(1),
    );
    assert!(matches!(result, Err(CaptureError::InvalidUrl(_))));
    assert!(slot.is_empty());
  }

  #[test]
  fn spawned_capture_publishes_and_stops() {
    let slot = Arc::new(FrameSlot::new());
    let handle = spawn_capture(
      || {
        Ok(ScriptedDevice {
          script: Vec::new(),
          cursor: 0,
        })
      },
      slot.clone(),
      Duration::from_millis(2),
    )
    .unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while slot.is_empty() && Instant::now() < deadline {
      thread::sleep(Duration::from_millis(2));
    }
    handle.stop();
    assert!(!slot.is_empty());
  }
}
