// 该文件是 Liuguang （流光） 项目的一部分。
// src/server.rs - MJPEG HTTP 推流服务
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

//! # MJPEG 推流服务
//!
//! 提供两个路由：
//! - `GET /`：说明页面
//! - `GET /mjpeg`：`multipart/x-mixed-replace` 图像流
//!
//! 每个连接有独立的推流任务，只通过 [`FrameSource`] 读取最新帧，
//! 连接之间不共享其他可变状态。对端断开只会结束该连接自己的任务。
//!
//! 写入慢的客户端默认会让该连接的任务无限期等待，与其他连接无关；
//! 设置 [`StreamOptions::write_timeout`] 后，超时的连接会被关闭。
//! 帧槽为空期间，每次轮询都会检查连接是否已被对端关闭。

use std::convert::Infallible;
use std::future::{Future, IntoFuture};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::{
  Router,
  body::{Body, Bytes},
  extract::State,
  http::{StatusCode, header},
  response::{Html, IntoResponse, Response},
  routing::get,
};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::frame::FrameSource;

mod multipart;

pub use self::multipart::{
  BOUNDARY, DEFAULT_JPEG_QUALITY, encode_jpeg, frame_part, stream_content_type,
};

/// 没有帧时的轮询间隔
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

// 每个连接最多缓存一个待发送分段
const PART_CHANNEL_CAPACITY: usize = 1;

const INDEX_PAGE: &str = r#"<html>
<head>
<title>MJPEG Stream</title>
</head>
<body>
<h1>MJPEG Stream</h1>
<img src="/mjpeg" />
</body>
</html>
"#;

#[derive(Error, Debug)]
pub enum StreamError {
  #[error("JPEG 编码错误: {0}")]
  EncodeError(#[from] image::ImageError),
  #[error("空帧无法编码: {width}x{height}")]
  EmptyFrame { width: u32, height: u32 },
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// 推流参数
#[derive(Debug, Clone)]
pub struct StreamOptions {
  /// JPEG 质量 (1 - 100)
  pub quality: u8,
  /// 帧槽为空时的轮询间隔
  pub poll_interval: Duration,
  /// 单个分段交给连接的最长等待时间，`None` 表示无限等待
  pub write_timeout: Option<Duration>,
}

impl Default for StreamOptions {
  fn default() -> Self {
    Self {
      quality: DEFAULT_JPEG_QUALITY,
      poll_interval: DEFAULT_POLL_INTERVAL,
      write_timeout: None,
    }
  }
}

/// 连接推流循环结束的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientLoopEnd {
  /// 对端关闭或重置连接
  PeerClosed,
  /// 分段在超时时间内未被连接接收
  WriteTimeout,
}

type PartSender = mpsc::Sender<Result<Bytes, Infallible>>;

/// 单个连接的推流循环
///
/// 读最新帧 → 编码 → 发送一个分段，直到发送失败。帧槽为空时按
/// `poll_interval` 等待，不发送任何内容；编码失败时跳过本次。
pub async fn stream_to_client<S>(
  source: Arc<S>,
  options: StreamOptions,
  parts: PartSender,
) -> ClientLoopEnd
where
  S: FrameSource + ?Sized + 'static,
{
  let mut sent = 0u64;
  loop {
    let Some(frame) = source.latest() else {
      // 没有帧可发时只能通过通道状态发现对端断开
      if parts.is_closed() {
        debug!("帧槽为空时连接已关闭");
        return ClientLoopEnd::PeerClosed;
      }
      tokio::time::sleep(options.poll_interval).await;
      continue;
    };

    let quality = options.quality;
    let index = frame.index;
    let jpeg = match tokio::task::spawn_blocking(move || encode_jpeg(&frame.image, quality)).await {
      Ok(Ok(jpeg)) => jpeg,
      Ok(Err(e)) => {
        warn!("第 {} 帧编码失败，跳过: {}", index, e);
        continue;
      }
      Err(e) => {
        error!("编码任务异常退出: {}", e);
        continue;
      }
    };

    if let Err(end) = send_part(&parts, frame_part(&jpeg), options.write_timeout).await {
      debug!("连接结束，共发送 {} 个分段", sent);
      return end;
    }
    sent += 1;
  }
}

async fn send_part(
  parts: &PartSender,
  part: Bytes,
  timeout: Option<Duration>,
) -> Result<(), ClientLoopEnd> {
  match timeout {
    None => parts
      .send(Ok(part))
      .await
      .map_err(|_| ClientLoopEnd::PeerClosed),
    Some(timeout) => match parts.send_timeout(Ok(part), timeout).await {
      Ok(()) => Ok(()),
      Err(SendTimeoutError::Timeout(_)) => Err(ClientLoopEnd::WriteTimeout),
      Err(SendTimeoutError::Closed(_)) => Err(ClientLoopEnd::PeerClosed),
    },
  }
}

struct StreamState<S: ?Sized> {
  source: Arc<S>,
  options: StreamOptions,
  next_client: AtomicU64,
}

/// 构建路由
pub fn router<S>(source: Arc<S>, options: StreamOptions) -> Router
where
  S: FrameSource + ?Sized + 'static,
{
  let state = Arc::new(StreamState {
    source,
    options,
    next_client: AtomicU64::new(1),
  });

  Router::new()
    .route("/", get(index_route))
    .route("/mjpeg", get(mjpeg_route::<S>))
    .fallback(not_found)
    .with_state(state)
}

/// 在给定监听器上提供服务，直到 `shutdown` 完成
///
/// 退出时不等待推流连接结束，它们是无限流。
pub async fn serve<S, F>(
  listener: TcpListener,
  source: Arc<S>,
  options: StreamOptions,
  shutdown: F,
) -> Result<(), StreamError>
where
  S: FrameSource + ?Sized + 'static,
  F: Future<Output = ()> + Send,
{
  let addr = listener.local_addr()?;
  info!("MJPEG 服务已启动: http://{}/mjpeg", addr);

  let app = router(source, options);
  tokio::select! {
    result = axum::serve(listener, app).into_future() => result?,
    _ = shutdown => info!("收到退出信号，停止 HTTP 服务"),
  }
  Ok(())
}

async fn index_route() -> Html<&'static str> {
  Html(INDEX_PAGE)
}

async fn mjpeg_route<S>(State(state): State<Arc<StreamState<S>>>) -> Response
where
  S: FrameSource + ?Sized + 'static,
{
  let client = state.next_client.fetch_add(1, Ordering::Relaxed);
  let (tx, rx) = mpsc::channel(PART_CHANNEL_CAPACITY);

  let source = state.source.clone();
  let options = state.options.clone();
  tokio::spawn(async move {
    info!("客户端 {} 已连接", client);
    match stream_to_client(source, options, tx).await {
      ClientLoopEnd::PeerClosed => info!("客户端 {} 已断开", client),
      ClientLoopEnd::WriteTimeout => warn!("客户端 {} 写入超时，关闭连接", client),
    }
  });

  Response::builder()
    .status(StatusCode::OK)
    .header(header::AGE, "0")
    .header(header::CACHE_CONTROL, "no-cache, private")
    .header(header::PRAGMA, "no-cache")
    .header(header::CONTENT_TYPE, stream_content_type())
    .body(Body::from_stream(ReceiverStream::new(rx)))
    .unwrap_or_else(|e| {
      error!("构建流响应失败: {}", e);
      StatusCode::INTERNAL_SERVER_ERROR.into_response()
    })
}

async fn not_found() -> impl IntoResponse {
  (StatusCode::NOT_FOUND, "Not Found")
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::{Frame, FrameSlot};
  use image::{Rgb, RgbImage};
  use std::sync::atomic::AtomicUsize;
  use std::time::Instant;

  struct CountingEmptySource {
    reads: AtomicUsize,
  }

  impl FrameSource for CountingEmptySource {
    fn latest(&self) -> Option<Frame> {
      self.reads.fetch_add(1, Ordering::Relaxed);
      None
    }
  }

  fn slot_with_frame() -> Arc<FrameSlot> {
    let slot = Arc::new(FrameSlot::new());
    slot.publish(Frame {
      image: RgbImage::from_pixel(2, 2, Rgb([0, 255, 0])),
      index: 0,
      timestamp_ms: 0,
    });
    slot
  }

  #[tokio::test]
  async fn empty_slot_is_polled_at_bounded_rate() {
    let source = Arc::new(CountingEmptySource {
      reads: AtomicUsize::new(0),
    });
    let (tx, mut rx) = mpsc::channel(1);

    let started = Instant::now();
    let run = tokio::time::timeout(
      Duration::from_millis(200),
      stream_to_client(source.clone(), StreamOptions::default(), tx),
    )
    .await;
    assert!(run.is_err(), "空槽时循环不应结束");

    let elapsed_ms = started.elapsed().as_millis() as usize;
    let reads = source.reads.load(Ordering::Relaxed);
    assert!(reads >= 1);
    assert!(reads <= elapsed_ms / 10 + 1, "{} reads in {} ms", reads, elapsed_ms);
    assert!(rx.try_recv().is_err(), "空槽时不应发送分段");
  }

  #[tokio::test]
  async fn closed_peer_is_noticed_while_slot_is_empty() {
    let source = Arc::new(CountingEmptySource {
      reads: AtomicUsize::new(0),
    });
    let (tx, rx) = mpsc::channel(1);
    drop(rx);

    let end = tokio::time::timeout(
      Duration::from_secs(1),
      stream_to_client(source.clone(), StreamOptions::default(), tx),
    )
    .await
    .expect("空槽时对端关闭应结束循环");
    assert_eq!(end, ClientLoopEnd::PeerClosed);
    assert_eq!(source.reads.load(Ordering::Relaxed), 1);
  }

  #[tokio::test]
  async fn parts_carry_matching_content_length() {
    let (tx, mut rx) = mpsc::channel(1);
    let task = tokio::spawn(stream_to_client(
      slot_with_frame(),
      StreamOptions::default(),
      tx,
    ));

    for _ in 0..2 {
      let part = rx.recv().await.unwrap().unwrap();
      let text = String::from_utf8_lossy(&part);
      assert!(text.starts_with("--FRAME\r\nContent-Type: image/jpeg\r\nContent-Length: "));

      let header_end = part.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
      let length: usize = text["--FRAME\r\nContent-Type: image/jpeg\r\nContent-Length: ".len()..]
        .split("\r\n")
        .next()
        .unwrap()
        .parse()
        .unwrap();
      assert_eq!(part.len(), header_end + length + 2);
      assert!(part.ends_with(b"\xFF\xD9\r\n"));
    }

    drop(rx);
    assert_eq!(task.await.unwrap(), ClientLoopEnd::PeerClosed);
  }

  #[tokio::test]
  async fn closed_peer_ends_only_its_own_loop() {
    let slot = slot_with_frame();
    let (tx_a, rx_a) = mpsc::channel(1);
    let (tx_b, mut rx_b) = mpsc::channel(1);

    let a = tokio::spawn(stream_to_client(slot.clone(), StreamOptions::default(), tx_a));
    let b = tokio::spawn(stream_to_client(slot.clone(), StreamOptions::default(), tx_b));

    drop(rx_a);
    assert_eq!(a.await.unwrap(), ClientLoopEnd::PeerClosed);

    for _ in 0..3 {
      assert!(rx_b.recv().await.is_some());
    }
    assert!(!b.is_finished());
    b.abort();
  }

  #[tokio::test]
  async fn stalled_peer_times_out_when_configured() {
    let (tx, _rx) = mpsc::channel(1);
    let options = StreamOptions {
      write_timeout: Some(Duration::from_millis(20)),
      ..StreamOptions::default()
    };
    let end = tokio::time::timeout(
      Duration::from_secs(5),
      stream_to_client(slot_with_frame(), options, tx),
    )
    .await
    .unwrap();
    assert_eq!(end, ClientLoopEnd::WriteTimeout);
  }
}
