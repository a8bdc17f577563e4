// 该文件是 Liuguang （流光） 项目的一部分。
// tests/stream_e2e.rs - 推流服务与流读取端到端测试
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

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use image::{Rgb, RgbImage};

use liuguang::{
  capture::{CaptureHandle, DeviceConfig, DeviceWrapper, parse_device_url, spawn_capture},
  client::{self, ReconnectingStream},
  frame::FrameSlot,
  server::{self, StreamOptions, encode_jpeg, frame_part},
};

const PART_PREFIX: &str = "--FRAME\r\nContent-Type: image/jpeg\r\nContent-Length: ";

/// 在后台线程启动采集与服务，返回监听地址
fn start_server(device: &str) -> (SocketAddr, CaptureHandle) {
  let slot = Arc::new(FrameSlot::new());
  let url = parse_device_url(device).unwrap();
  let config = DeviceConfig {
    fps: 30,
    ..DeviceConfig::default()
  };
  let capture = spawn_capture(
    move || DeviceWrapper::open(&url, &config),
    slot.clone(),
    config.period(),
  )
  .unwrap();

  let listener = TcpListener::bind("127.0.0.1:0").unwrap();
  listener.set_nonblocking(true).unwrap();
  let addr = listener.local_addr().unwrap();

  thread::spawn(move || {
    let runtime = tokio::runtime::Builder::new_multi_thread()
      .enable_all()
      .build()
      .unwrap();
    runtime.block_on(async move {
      let listener = tokio::net::TcpListener::from_std(listener).unwrap();
      server::serve(
        listener,
        slot,
        StreamOptions::default(),
        std::future::pending(),
      )
      .await
      .unwrap();
    });
  });

  (addr, capture)
}

#[test]
fn index_and_unknown_paths() {
  let (addr, capture) = start_server("pattern://solid?width=16&height=8");
  let http = reqwest::blocking::Client::new();

  let index = http.get(format!("http://{}/", addr)).send().unwrap();
  assert_eq!(index.status(), 200);
  let content_type = index.headers()["content-type"].to_str().unwrap().to_string();
  assert!(content_type.starts_with("text/html"));
  assert!(index.text().unwrap().contains("<img src=\"/mjpeg\""));

  let missing = http.get(format!("http://{}/snapshot", addr)).send().unwrap();
  assert_eq!(missing.status(), 404);

  capture.stop();
}

#[test]
fn stream_parts_declare_their_length() {
  let (addr, capture) = start_server("pattern://solid?width=2&height=2");

  let mut response = reqwest::blocking::get(format!("http://{}/mjpeg", addr)).unwrap();
  assert_eq!(response.status(), 200);
  let headers = response.headers();
  assert_eq!(
    headers["content-type"],
    "multipart/x-mixed-replace; boundary=FRAME"
  );
  assert_eq!(headers["cache-control"], "no-cache, private");
  assert_eq!(headers["pragma"], "no-cache");
  assert_eq!(headers["age"], "0");

  // 读取直到得到一个完整分段
  let mut buffer = Vec::new();
  let mut chunk = [0u8; 1024];
  let (header_end, length) = loop {
    let n = response.read(&mut chunk).unwrap();
    assert!(n > 0, "流提前结束");
    buffer.extend_from_slice(&chunk[..n]);

    let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") else {
      continue;
    };
    let head = String::from_utf8_lossy(&buffer[..pos]).to_string();
    assert!(head.starts_with(PART_PREFIX), "unexpected head: {}", head);
    let length: usize = head[PART_PREFIX.len()..].parse().unwrap();
    if buffer.len() >= pos + 4 + length + 2 {
      break (pos + 4, length);
    }
  };

  let body = &buffer[header_end..header_end + length];
  assert_eq!(&body[..2], &[0xFF, 0xD8]);
  assert_eq!(&body[length - 2..], &[0xFF, 0xD9]);
  let decoded = image::load_from_memory(body).unwrap().into_rgb8();
  assert_eq!(decoded.dimensions(), (2, 2));
  assert_eq!(&buffer[header_end + length..header_end + length + 2], b"\r\n");

  drop(response);
  capture.stop();
}

#[test]
fn client_decodes_served_frames() {
  let (addr, capture) = start_server("pattern://solid?width=16&height=8&color=ff0000");

  let mut frames = client::connect(&format!("http://{}/mjpeg", addr)).unwrap();
  for _ in 0..3 {
    let image = frames.next().unwrap();
    assert_eq!(image.dimensions(), (16, 8));
    let pixel = image.get_pixel(8, 4);
    assert!(pixel[0] > 200 && pixel[1] < 60 && pixel[2] < 60, "{:?}", pixel);
  }

  drop(frames);
  capture.stop();
}

#[test]
fn unreachable_stream_fails_to_connect() {
  let listener = TcpListener::bind("127.0.0.1:0").unwrap();
  let addr = listener.local_addr().unwrap();
  drop(listener);

  assert!(client::connect(&format!("http://{}/mjpeg", addr)).is_err());
}

/// 读完请求头后写出 `body`，然后关闭连接
fn answer_once(stream: &mut TcpStream, body: &[u8]) {
  let mut request = Vec::new();
  let mut byte = [0u8; 1];
  while !request.ends_with(b"\r\n\r\n") {
    if stream.read(&mut byte).unwrap() == 0 {
      return;
    }
    request.push(byte[0]);
  }
  stream
    .write_all(
      b"HTTP/1.1 200 OK\r\n\
        Content-Type: multipart/x-mixed-replace; boundary=FRAME\r\n\
        Connection: close\r\n\r\n",
    )
    .unwrap();
  stream.write_all(body).unwrap();
  stream.flush().unwrap();
}

/// 按顺序为每个连接回放一段响应体，之后不再接受连接
fn replay_server(bodies: Vec<Vec<u8>>) -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").unwrap();
  let addr = listener.local_addr().unwrap();
  thread::spawn(move || {
    for body in bodies {
      let (mut stream, _) = listener.accept().unwrap();
      answer_once(&mut stream, &body);
    }
  });
  addr
}

fn full_part(color: [u8; 3]) -> Vec<u8> {
  let jpeg = encode_jpeg(&RgbImage::from_pixel(4, 4, Rgb(color)), 90).unwrap();
  frame_part(&jpeg).to_vec()
}

#[test]
fn reconnect_starts_from_a_fresh_accumulator() {
  // 第一个连接只有半帧：起始标记后连接即被关闭
  let full = full_part([0, 0, 255]);
  let half = full[..full.len() / 2].to_vec();
  let addr = replay_server(vec![half, full]);

  let stop = Arc::new(AtomicBool::new(false));
  let mut frames = ReconnectingStream::connect(
    &format!("http://{}/mjpeg", addr),
    Some(Duration::from_millis(50)),
    stop.clone(),
  )
  .unwrap();

  let image = frames.next().unwrap();
  assert_eq!(image.dimensions(), (4, 4));
  let pixel = image.get_pixel(2, 2);
  assert!(pixel[2] > 200 && pixel[0] < 60 && pixel[1] < 60, "{:?}", pixel);

  stop.store(true, Ordering::Relaxed);
  assert!(frames.next().is_none());
}

#[test]
fn stream_ends_with_connection_when_reconnect_is_off() {
  let mut body = full_part([255, 255, 255]);
  body.extend_from_slice(&full_part([0, 0, 0]));
  let addr = replay_server(vec![body]);

  let frames = ReconnectingStream::connect(
    &format!("http://{}/mjpeg", addr),
    None,
    Arc::new(AtomicBool::new(false)),
  )
  .unwrap();

  let images: Vec<RgbImage> = frames.collect();
  assert_eq!(images.len(), 2);
  assert!(images[0].get_pixel(1, 1)[0] > 200);
  assert!(images[1].get_pixel(1, 1)[0] < 60);
}
