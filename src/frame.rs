// 该文件是 Liuguang （流光） 项目的一部分。
// src/frame.rs - 帧定义与共享帧槽
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

use std::sync::{Mutex, MutexGuard};

use image::RgbImage;

/// 帧数据
#[derive(Debug, Clone)]
pub struct Frame {
  /// RGB 图像数据（三通道交错）
  pub image: RgbImage,
  /// 帧索引
  pub index: u64,
  /// 时间戳（毫秒，相对采集开始）
  pub timestamp_ms: u64,
}

/// 读取最新帧的来源
///
/// 推流端的每个连接只依赖这个接口，测试中可以替换成计数的实现。
pub trait FrameSource: Send + Sync {
  /// 返回当前帧的独立副本，没有帧时返回 `None`
  fn latest(&self) -> Option<Frame>;
}

/// 单帧共享槽
///
/// 只保存最近一次发布的帧。写入是整体替换，读取返回完整拷贝，
/// 读者永远看不到写了一半的帧。没有队列，也没有背压。
#[derive(Debug, Default)]
pub struct FrameSlot {
  frame: Mutex<Option<Frame>>,
}

impl FrameSlot {
  pub fn new() -> Self {
    Self::default()
  }

  /// 替换当前帧，旧帧被丢弃
  pub fn publish(&self, frame: Frame) {
    let previous = self.guard().replace(frame);
    // 旧帧在锁外释放
    drop(previous);
  }

  /// 读取当前帧的拷贝，持锁时间仅为一次拷贝
  pub fn read(&self) -> Option<Frame> {
    self.guard().clone()
  }

  pub fn is_empty(&self) -> bool {
    self.guard().is_none()
  }

  fn guard(&self) -> MutexGuard<'_, Option<Frame>> {
    // 某个读者 panic 不应让槽永久失效
    self
      .frame
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

impl FrameSource for FrameSlot {
  fn latest(&self) -> Option<Frame> {
    self.read()
  }
}
