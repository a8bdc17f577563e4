// 该文件是 Liuguang （流光） 项目的一部分。
// src/report.rs - 检测结果输出
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use serde_json::json;
use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::model::Detection;
use crate::{FromUrl, FromUrlWithScheme};

/// 检测结果的外部接收端
pub trait Report {
  type Error;
  /// 报告一个周期中分数最高的检测
  fn report_best(&self, best: &Detection) -> Result<(), Self::Error>;
  /// 报告吞吐量（每秒周期数）
  fn report_throughput(&self, fps: f64) -> Result<(), Self::Error>;
}

#[derive(Error, Debug)]
pub enum ReportError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 错误: {0}")]
  JsonError(#[from] serde_json::Error),
}

/// 写入日志，格式 `log:`
#[derive(Debug, Default)]
pub struct LogReport;

impl FromUrlWithScheme for LogReport {
  const SCHEME: &'static str = "log";
}

impl FromUrl for LogReport {
  type Error = ReportError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ReportError::SchemeMismatch(url.scheme().to_string()));
    }
    Ok(LogReport)
  }
}

impl Report for LogReport {
  type Error = ReportError;

  fn report_best(&self, best: &Detection) -> Result<(), Self::Error> {
    info!("best: {}", best);
    Ok(())
  }

  fn report_throughput(&self, fps: f64) -> Result<(), Self::Error> {
    info!("fps ~ {:.1}", fps);
    Ok(())
  }
}

/// 追加 JSON Lines 记录，格式 `jsonl:///path/to/file`
pub struct JsonLinesReport {
  writer: Mutex<BufWriter<File>>,
}

impl FromUrlWithScheme for JsonLinesReport {
  const SCHEME: &'static str = "jsonl";
}

impl FromUrl for JsonLinesReport {
  type Error = ReportError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ReportError::SchemeMismatch(url.scheme().to_string()));
    }

    let path = PathBuf::from(url.path());
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() && !parent.exists() {
        std::fs::create_dir_all(parent)?;
      }
    }
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    info!("检测记录写入: {}", path.display());

    Ok(JsonLinesReport {
      writer: Mutex::new(BufWriter::new(file)),
    })
  }
}

impl JsonLinesReport {
  fn write_record(&self, record: serde_json::Value) -> Result<(), ReportError> {
    let mut writer = self
      .writer
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    serde_json::to_writer(&mut *writer, &record)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
  }
}

fn timestamp() -> String {
  Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl Report for JsonLinesReport {
  type Error = ReportError;

  fn report_best(&self, best: &Detection) -> Result<(), Self::Error> {
    self.write_record(json!({
      "time": timestamp(),
      "kind": "best",
      "score": best.score,
      "class": best.class_id,
      "box": best.bbox,
    }))
  }

  fn report_throughput(&self, fps: f64) -> Result<(), Self::Error> {
    self.write_record(json!({
      "time": timestamp(),
      "kind": "throughput",
      "fps": fps,
    }))
  }
}

pub enum ReportWrapper {
  Log(LogReport),
  JsonLines(JsonLinesReport),
}

impl FromUrl for ReportWrapper {
  type Error = ReportError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      LogReport::SCHEME => Ok(ReportWrapper::Log(LogReport::from_url(url)?)),
      JsonLinesReport::SCHEME => Ok(ReportWrapper::JsonLines(JsonLinesReport::from_url(url)?)),
      other => {
        error!("不支持的输出方案: {}", other);
        Err(ReportError::SchemeMismatch(other.to_string()))
      }
    }
  }
}

impl Report for ReportWrapper {
  type Error = ReportError;

  fn report_best(&self, best: &Detection) -> Result<(), Self::Error> {
    match self {
      ReportWrapper::Log(report) => report.report_best(best),
      ReportWrapper::JsonLines(report) => report.report_best(best),
    }
  }

  fn report_throughput(&self, fps: f64) -> Result<(), Self::Error> {
    match self {
      ReportWrapper::Log(report) => report.report_throughput(fps),
      ReportWrapper::JsonLines(report) => report.report_throughput(fps),
    }
  }
}
