// 该文件是 Liuguang （流光） 项目的一部分。
// src/client.rs - MJPEG 流读取与 JPEG 切分
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

use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use image::{ImageFormat, RgbImage};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// JPEG 起始标记 (SOI)
pub const JPEG_START: [u8; 2] = [0xFF, 0xD8];
/// JPEG 结束标记 (EOI)
pub const JPEG_END: [u8; 2] = [0xFF, 0xD9];

/// 每次从连接读取的字节数
pub const READ_CHUNK_SIZE: usize = 4096;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ClientError {
  #[error("HTTP 错误: {0}")]
  HttpError(#[from] reqwest::Error),
}

/// 字节累积器，从任意切分的字节流中切出完整的 JPEG
///
/// 每次成功切出一张图像后，结束标记及之前的字节都会被丢弃。
#[derive(Debug, Default)]
pub struct JpegSplitter {
  buffer: Vec<u8>,
}

impl JpegSplitter {
  pub fn new() -> Self {
    Self::default()
  }

  /// 追加一个数据块
  pub fn push(&mut self, chunk: &[u8]) {
    self.buffer.extend_from_slice(chunk);
  }

  /// 当前缓存的字节数
  pub fn buffered(&self) -> usize {
    self.buffer.len()
  }

  /// 取出下一张完整图像的字节（含起止标记），没有时返回 `None`
  pub fn next_image(&mut self) -> Option<Vec<u8>> {
    let Some(start) = find_marker(&self.buffer, &JPEG_START, 0) else {
      // 没有起始标记，只保留最后一个字节，它可能是被切开的标记的前半
      let keep_from = self.buffer.len().saturating_sub(1);
      self.buffer.drain(..keep_from);
      return None;
    };

    if start > 0 {
      self.buffer.drain(..start);
    }

    let end = find_marker(&self.buffer, &JPEG_END, JPEG_START.len())?;
    let frame_end = end + JPEG_END.len();
    let image: Vec<u8> = self.buffer.drain(..frame_end).collect();
    Some(image)
  }
}

fn find_marker(buffer: &[u8], marker: &[u8], from: usize) -> Option<usize> {
  buffer
    .get(from..)?
    .windows(marker.len())
    .position(|window| window == marker)
    .map(|pos| pos + from)
}

/// 解码一张 JPEG，失败时返回 `None`
pub fn decode_jpeg(bytes: &[u8]) -> Option<RgbImage> {
  match image::load_from_memory_with_format(bytes, ImageFormat::Jpeg) {
    Ok(image) => Some(image.into_rgb8()),
    Err(e) => {
      warn!("丢弃损坏的 JPEG ({} 字节): {}", bytes.len(), e);
      None
    }
  }
}

/// 从字节流中逐张产出解码后的图像
///
/// 序列长度只受连接生命周期限制，不可重启；新连接需要新的迭代器。
/// 损坏的图像被丢弃，不会终止序列。
pub struct MjpegFrames<R> {
  reader: R,
  splitter: JpegSplitter,
  chunk: Box<[u8]>,
  finished: bool,
}

impl<R: Read> MjpegFrames<R> {
  pub fn new(reader: R) -> Self {
    Self::with_chunk_size(reader, READ_CHUNK_SIZE)
  }

  pub fn with_chunk_size(reader: R, chunk_size: usize) -> Self {
    Self {
      reader,
      splitter: JpegSplitter::new(),
      chunk: vec![0u8; chunk_size.max(1)].into_boxed_slice(),
      finished: false,
    }
  }
}

impl<R: Read> Iterator for MjpegFrames<R> {
  type Item = RgbImage;

  fn next(&mut self) -> Option<Self::Item> {
    loop {
      while let Some(jpeg) = self.splitter.next_image() {
        trace!("切出 JPEG: {} 字节", jpeg.len());
        if let Some(image) = decode_jpeg(&jpeg) {
          return Some(image);
        }
      }

      if self.finished {
        return None;
      }

      match self.reader.read(&mut self.chunk) {
        Ok(0) => {
          debug!("流已结束，剩余 {} 字节未成帧", self.splitter.buffered());
          self.finished = true;
        }
        Ok(n) => self.splitter.push(&self.chunk[..n]),
        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
        Err(e) => {
          warn!("读取流失败: {}", e);
          self.finished = true;
        }
      }
    }
  }
}

/// 连接 MJPEG 流
///
/// 只限制建立连接的时间，读取流本身不设超时。非 2xx 状态视为错误。
pub fn connect(url: &str) -> Result<MjpegFrames<reqwest::blocking::Response>, ClientError> {
  let client = reqwest::blocking::Client::builder()
    .connect_timeout(CONNECT_TIMEOUT)
    .timeout(None)
    .build()?;
  info!("连接 MJPEG 流: {}", url);
  let response = client.get(url).send()?.error_for_status()?;
  info!("已连接，状态 {}", response.status());
  Ok(MjpegFrames::new(response))
}

/// 带可选重连的 MJPEG 流
///
/// 每次重连都会新建累积器，旧连接中未成帧的字节被丢弃。
/// 未设置重连间隔时，连接结束即序列结束。
pub struct ReconnectingStream {
  url: String,
  reconnect_delay: Option<Duration>,
  stop: Arc<AtomicBool>,
  current: Option<MjpegFrames<reqwest::blocking::Response>>,
}

impl ReconnectingStream {
  /// 建立首个连接，失败时直接返回错误
  pub fn connect(
    url: &str,
    reconnect_delay: Option<Duration>,
    stop: Arc<AtomicBool>,
  ) -> Result<Self, ClientError> {
    let current = connect(url)?;
    Ok(Self {
      url: url.to_string(),
      reconnect_delay,
      stop,
      current: Some(current),
    })
  }
}

impl Iterator for ReconnectingStream {
  type Item = RgbImage;

  fn next(&mut self) -> Option<Self::Item> {
    loop {
      if self.stop.load(Ordering::Relaxed) {
        return None;
      }

      if let Some(frames) = self.current.as_mut() {
        if let Some(image) = frames.next() {
          return Some(image);
        }
        self.current = None;
        info!("MJPEG 流已结束: {}", self.url);
      }

      let delay = self.reconnect_delay?;
      thread::sleep(delay);
      if self.stop.load(Ordering::Relaxed) {
        return None;
      }
      match connect(&self.url) {
        Ok(frames) => self.current = Some(frames),
        Err(e) => warn!("重连失败，{:.2?} 后重试: {}", delay, e),
      }
    }
  }
}
