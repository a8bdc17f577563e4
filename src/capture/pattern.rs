// 该文件是 Liuguang （流光） 项目的一部分。
// src/capture/pattern.rs - 纯色测试图案设备
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

use image::{Rgb, RgbImage};
use tracing::error;
use url::Url;

use super::{CaptureError, VideoDevice};
use crate::{FromUrl, FromUrlWithScheme};

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_COLOR: [u8; 3] = [0, 128, 255];

/// 纯色图案设备，格式 `pattern://solid?width=W&height=H&color=RRGGBB`
#[derive(Debug, Clone)]
pub struct PatternDevice {
  image: RgbImage,
}

impl PatternDevice {
  pub fn solid(width: u32, height: u32, color: [u8; 3]) -> Self {
    Self {
      image: RgbImage::from_pixel(width, height, Rgb(color)),
    }
  }
}

impl FromUrlWithScheme for PatternDevice {
  const SCHEME: &'static str = "pattern";
}

impl FromUrl for PatternDevice {
  type Error = CaptureError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(CaptureError::SchemeMismatch(url.scheme().to_string()));
    }

    match url.host_str() {
      Some("solid") | None => {}
      Some(other) => {
        return Err(CaptureError::InvalidUrl(format!("未知图案: {}", other)));
      }
    }

    let mut width = DEFAULT_WIDTH;
    let mut height = DEFAULT_HEIGHT;
    let mut color = DEFAULT_COLOR;
    for (k, v) in url.query_pairs() {
      match k.as_ref() {
        "width" => width = parse_dimension(&v)?,
        "height" => height = parse_dimension(&v)?,
        "color" => color = parse_color(&v)?,
        _ => {}
      }
    }

    Ok(Self::solid(width, height, color))
  }
}

fn parse_dimension(value: &str) -> Result<u32, CaptureError> {
  match value.parse::<u32>() {
    Ok(v) if v > 0 => Ok(v),
    _ => Err(CaptureError::InvalidUrl(format!("无效尺寸: {}", value))),
  }
}

fn parse_color(value: &str) -> Result<[u8; 3], CaptureError> {
  let hex = value.trim_start_matches('#');
  let invalid = || CaptureError::InvalidUrl(format!("无效颜色: {}", value));
  if hex.len() != 6 {
    return Err(invalid());
  }
  let mut color = [0u8; 3];
  for (i, c) in color.iter_mut().enumerate() {
    *c = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).map_err(|_| invalid())?;
  }
  Ok(color)
}

impl VideoDevice for PatternDevice {
  fn read_frame(&mut self) -> Result<RgbImage, CaptureError> {
    Ok(self.image.clone())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_size_and_color_from_query() {
    let url = Url::parse("pattern://solid?width=2&height=3&color=ff8000").unwrap();
    let mut device = PatternDevice::from_url(&url).unwrap();
    let image = device.read_frame().unwrap();
    assert_eq!(image.dimensions(), (2, 3));
    assert_eq!(image.get_pixel(1, 2), &Rgb([255, 128, 0]));
  }

  #[test]
  fn rejects_bad_parameters() {
    for bad in [
      "pattern://solid?width=0",
      "pattern://solid?color=zzzzzz",
      "pattern://stripes",
    ] {
      let url = Url::parse(bad).unwrap();
      assert!(PatternDevice::from_url(&url).is_err(), "{}", bad);
    }
  }
}
