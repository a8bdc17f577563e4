// 该文件是 Liuguang （流光） 项目的一部分。
// src/capture/still_image.rs - 静态图像设备
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

use image::{ImageReader, RgbImage};
use tracing::{error, info};
use url::Url;

use super::{CaptureError, VideoDevice};
use crate::{FromUrl, FromUrlWithScheme};

/// 把一张图片当作摄像头，每个周期返回同一帧
pub struct StillImageDevice {
  image: RgbImage,
}

impl FromUrlWithScheme for StillImageDevice {
  const SCHEME: &'static str = "image";
}

impl FromUrl for StillImageDevice {
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

    let path = url.path();
    let image = ImageReader::open(path)?.with_guessed_format()?.decode()?;
    info!("已加载静态图像 {}: {}x{}", path, image.width(), image.height());

    Ok(StillImageDevice {
      image: image.into_rgb8(),
    })
  }
}

impl VideoDevice for StillImageDevice {
  fn read_frame(&mut self) -> Result<RgbImage, CaptureError> {
    Ok(self.image.clone())
  }
}
