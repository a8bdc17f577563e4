// 该文件是 Liuguang （流光） 项目的一部分。
// src/task.rs - 连续检测任务
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
use std::{thread, time::Duration};

use image::RgbImage;
use tracing::{debug, info, warn};

use crate::detect::DetectionPipeline;
use crate::model::InferenceEngine;
use crate::report::Report;

/// 收到中断信号后，超过该时间仍未退出则强制结束进程
const FORCE_EXIT_AFTER: Duration = Duration::from_secs(30);

pub trait Task<I, M, O>: Sized {
  type Output;
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<Self::Output, Self::Error>;
}

/// 安装 Ctrl-C 处理器，收到信号时置位 `stop`
///
/// 每个进程只能安装一次。
pub fn install_ctrlc_handler(stop: Arc<AtomicBool>) -> Result<(), ctrlc::Error> {
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    stop.store(true, Ordering::SeqCst);
    thread::spawn(|| {
      thread::sleep(FORCE_EXIT_AFTER);
      warn!("强制退出程序");
      std::process::exit(1);
    });
  })
}

/// 任务结束时的统计
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TaskSummary {
  /// 执行的周期数
  pub cycles: usize,
  /// 有检测结果并已报告的周期数
  pub reported: usize,
  /// 因推理或输出解析失败而跳过的周期数
  pub failed: usize,
}

/// 对图像序列逐帧执行检测，直到序列结束、达到帧数上限或收到停止信号
#[derive(Default, Debug)]
pub struct ContinuousTask {
  frame_number: Option<usize>,
  stop: Option<Arc<AtomicBool>>,
}

impl ContinuousTask {
  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number.filter(|&n| n > 0);
    self
  }

  pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
    self.stop = Some(stop);
    self
  }

  fn stop_requested(&self) -> bool {
    self
      .stop
      .as_ref()
      .map(|stop| stop.load(Ordering::Relaxed))
      .unwrap_or(false)
  }
}

impl<'a, 'b, I, E, O> Task<I, &'a mut DetectionPipeline<E>, &'b O> for ContinuousTask
where
  I: Iterator<Item = RgbImage>,
  E: InferenceEngine,
  O: Report,
  O::Error: std::error::Error + Send + Sync + 'static,
{
  type Output = TaskSummary;
  type Error = anyhow::Error;

  fn run_task(
    self,
    input: I,
    pipeline: &'a mut DetectionPipeline<E>,
    output: &'b O,
  ) -> Result<Self::Output, Self::Error> {
    info!("开始任务...");
    let mut summary = TaskSummary::default();

    for frame in input {
      if self.stop_requested() {
        warn!("中断信号接收，退出任务循环");
        break;
      }

      summary.cycles += 1;
      let now = std::time::Instant::now();
      match pipeline.process(&frame) {
        Ok(outcome) => {
          debug!(
            "第 {} 帧: {} 个检测通过阈值，输出按{}解析，耗时 {:.2?}",
            summary.cycles,
            outcome.detections.len(),
            outcome.resolution,
            now.elapsed()
          );
          if let Some(best) = outcome.best() {
            output.report_best(best)?;
            summary.reported += 1;
          }
        }
        Err(e) => {
          warn!("第 {} 帧检测失败，跳过: {}", summary.cycles, e);
          summary.failed += 1;
        }
      }

      if let Some(fps) = pipeline.record_cycle() {
        output.report_throughput(fps)?;
      }

      if self.frame_number.is_some_and(|n| summary.cycles >= n) {
        info!("达到指定帧数 {}, 退出任务循环", summary.cycles);
        break;
      }
    }

    info!(
      "任务完成，共 {} 帧，报告 {} 帧，失败 {} 帧",
      summary.cycles, summary.reported, summary.failed
    );
    Ok(summary)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::cell::RefCell;

  use image::Rgb;

  use crate::detect::PipelineOptions;
  use crate::model::{Detection, InputShape, InputTensor, Tensor, TensorLayout, TensorOutputSet};

  /// 按脚本依次返回分数；`None` 表示本次推理失败
  struct ScriptedEngine {
    script: Vec<Option<Vec<f32>>>,
    calls: usize,
  }

  impl InferenceEngine for ScriptedEngine {
    type Error = std::io::Error;

    fn input_shape(&self) -> InputShape {
      InputShape {
        width: 2,
        height: 2,
        layout: TensorLayout::Nhwc,
      }
    }

    fn invoke(&mut self, _input: &InputTensor) -> Result<TensorOutputSet, Self::Error> {
      let step = self.script[self.calls % self.script.len()].clone();
      self.calls += 1;
      let scores = step.ok_or_else(|| std::io::Error::other("delegate failure"))?;
      let n = scores.len();
      Ok(TensorOutputSet::new(vec![
        Tensor::named("detection_boxes", vec![1, n, 4], vec![0.5; n * 4]),
        Tensor::named("detection_classes", vec![1, n], vec![7.0; n]),
        Tensor::named("detection_scores", vec![1, n], scores),
      ]))
    }
  }

  #[derive(Default)]
  struct RecordingReport {
    best: RefCell<Vec<Detection>>,
    throughput: RefCell<Vec<f64>>,
  }

  impl Report for RecordingReport {
    type Error = std::io::Error;

    fn report_best(&self, best: &Detection) -> Result<(), Self::Error> {
      self.best.borrow_mut().push(best.clone());
      Ok(())
    }

    fn report_throughput(&self, fps: f64) -> Result<(), Self::Error> {
      self.throughput.borrow_mut().push(fps);
      Ok(())
    }
  }

  fn frames(n: usize) -> impl Iterator<Item = RgbImage> {
    (0..n).map(|_| RgbImage::from_pixel(4, 4, Rgb([128, 128, 128])))
  }

  fn pipeline(script: Vec<Option<Vec<f32>>>, window: u32) -> DetectionPipeline<ScriptedEngine> {
    DetectionPipeline::new(
      ScriptedEngine { script, calls: 0 },
      PipelineOptions {
        throughput_window: window,
        ..PipelineOptions::default()
      },
    )
  }

  #[test]
  fn failed_cycles_are_skipped_and_loop_continues() {
    let mut pipeline = pipeline(vec![Some(vec![0.2, 0.8]), None, Some(vec![0.1])], 100);
    let report = RecordingReport::default();

    let summary = ContinuousTask::default()
      .run_task(frames(6), &mut pipeline, &report)
      .unwrap();

    assert_eq!(
      summary,
      TaskSummary {
        cycles: 6,
        reported: 2,
        failed: 2,
      }
    );
    let best = report.best.borrow();
    assert!(best.iter().all(|d| d.score == 0.8 && d.class_id == 7));
  }

  #[test]
  fn throughput_is_reported_once_per_window() {
    let mut pipeline = pipeline(vec![Some(vec![0.9])], 3);
    let report = RecordingReport::default();

    ContinuousTask::default()
      .run_task(frames(7), &mut pipeline, &report)
      .unwrap();

    assert_eq!(report.throughput.borrow().len(), 2);
    assert_eq!(report.best.borrow().len(), 7);
  }

  #[test]
  fn frame_limit_stops_the_loop() {
    let mut pipeline = pipeline(vec![Some(vec![0.9])], 30);
    let report = RecordingReport::default();

    let summary = ContinuousTask::default()
      .with_frame_number(Some(4))
      .run_task(frames(100), &mut pipeline, &report)
      .unwrap();

    assert_eq!(summary.cycles, 4);
  }

  #[test]
  fn stop_flag_ends_before_next_cycle() {
    let mut pipeline = pipeline(vec![Some(vec![0.9])], 30);
    let report = RecordingReport::default();
    let stop = Arc::new(AtomicBool::new(true));

    let summary = ContinuousTask::default()
      .with_stop_flag(stop)
      .run_task(frames(10), &mut pipeline, &report)
      .unwrap();

    assert_eq!(summary.cycles, 0);
    assert!(report.best.borrow().is_empty());
  }
}
