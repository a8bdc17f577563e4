// 该文件是 Liuguang （流光） 项目的一部分。
// src/bin/mjpeg_server.rs - 摄像头 MJPEG 推流服务
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use liuguang::{
  capture::{DeviceConfig, DeviceWrapper, parse_device_url, spawn_capture},
  frame::FrameSlot,
  server::{self, DEFAULT_POLL_INTERVAL, StreamOptions},
};

/// 采集摄像头画面并通过 HTTP 以 MJPEG 推流
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 采集设备，支持 v4l:///dev/videoN、image:///path、pattern://solid 或裸设备路径
  #[arg(long, value_name = "DEVICE", default_value = "v4l:///dev/video24")]
  pub device: String,
  /// 期望宽度
  #[arg(long, default_value_t = 1280)]
  pub width: u32,
  /// 期望高度
  #[arg(long, default_value_t = 720)]
  pub height: u32,
  /// 期望帧率
  #[arg(long, default_value_t = 15)]
  pub fps: u32,
  /// 监听端口
  #[arg(long, default_value_t = 8080)]
  pub port: u16,
  /// 监听地址
  #[arg(long, default_value = "0.0.0.0")]
  pub bind: IpAddr,
  /// JPEG 质量
  #[arg(long, default_value_t = 80, value_parser = clap::value_parser!(u8).range(1..=100))]
  pub quality: u8,
  /// 单个分段的写入超时（毫秒），不设置则无限等待
  #[arg(long, value_name = "MS")]
  pub write_timeout_ms: Option<u64>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  let url = parse_device_url(&args.device)?;
  let config = DeviceConfig {
    width: args.width,
    height: args.height,
    fps: args.fps,
  };
  info!("采集设备: {}", url);
  info!("期望参数: {}x{} @ {} fps", config.width, config.height, config.fps);

  let slot = Arc::new(FrameSlot::new());
  let open_url = url.clone();
  let capture = spawn_capture(
    move || DeviceWrapper::open(&open_url, &config),
    slot.clone(),
    config.period(),
  )
  .with_context(|| format!("无法打开采集设备 {}", url))?;

  let options = StreamOptions {
    quality: args.quality,
    poll_interval: DEFAULT_POLL_INTERVAL,
    write_timeout: args.write_timeout_ms.map(Duration::from_millis),
  };

  let runtime = tokio::runtime::Builder::new_multi_thread()
    .enable_all()
    .build()?;
  let result = runtime.block_on(async {
    let addr = SocketAddr::new(args.bind, args.port);
    let listener = TcpListener::bind(addr)
      .await
      .with_context(|| format!("无法监听 {}", addr))?;
    server::serve(listener, slot, options, async {
      let _ = tokio::signal::ctrl_c().await;
    })
    .await?;
    anyhow::Ok(())
  });

  info!("停止采集...");
  capture.stop();
  runtime.shutdown_timeout(Duration::from_millis(100));
  result
}
