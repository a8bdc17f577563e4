// 该文件是 Liuguang （流光） 项目的一部分。
// src/server/multipart.rs - JPEG 编码与 multipart 分段
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

use axum::body::Bytes;
use image::{ExtendedColorType, ImageEncoder, RgbImage, codecs::jpeg::JpegEncoder};

use super::StreamError;

/// multipart 边界标记
pub const BOUNDARY: &str = "FRAME";

/// 默认 JPEG 质量
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// 流响应的 Content-Type
pub fn stream_content_type() -> String {
  format!("multipart/x-mixed-replace; boundary={}", BOUNDARY)
}

/// 将 RGB 帧编码为 JPEG
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, StreamError> {
  let (width, height) = image.dimensions();
  if width == 0 || height == 0 {
    return Err(StreamError::EmptyFrame { width, height });
  }

  let mut jpeg = Vec::with_capacity((width * height) as usize / 4);
  JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100)).write_image(
    image.as_raw(),
    width,
    height,
    ExtendedColorType::Rgb8,
  )?;
  Ok(jpeg)
}

/// 组装一个 multipart 分段：边界行、分段头、空行、JPEG 数据、行结束符
pub fn frame_part(jpeg: &[u8]) -> Bytes {
  let header = format!(
    "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
    BOUNDARY,
    jpeg.len()
  );
  let mut part = Vec::with_capacity(header.len() + jpeg.len() + 2);
  part.extend_from_slice(header.as_bytes());
  part.extend_from_slice(jpeg);
  part.extend_from_slice(b"\r\n");
  Bytes::from(part)
}
