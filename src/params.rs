// 该文件是 Xibao （细胞计数） 项目的一部分。
// src/params.rs - 过滤参数
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

/// IoU 阈值上限，取该值时不做重叠抑制
pub const IOU_THRESHOLD_MAX: f32 = 0.9999;

pub const DEFAULT_SCORE_THRESHOLD: f32 = 0.25;
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.45;

/// 重叠抑制的分组方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NmsMode {
  /// 不区分类别
  #[default]
  ClassAgnostic,
  /// 仅在同一类别内抑制
  PerClass,
}

/// 过滤参数
///
/// 超出范围的值会被夹到合法范围内而不是报错，NaN 取默认值。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterParams {
  score_threshold: f32,
  iou_threshold: f32,
  min_area: Option<f32>,
  nms_mode: NmsMode,
  raw: bool,
}

impl Default for FilterParams {
  fn default() -> Self {
    FilterParams::new(DEFAULT_SCORE_THRESHOLD, DEFAULT_IOU_THRESHOLD, None)
  }
}

impl FilterParams {
  pub fn new(score_threshold: f32, iou_threshold: f32, min_area: Option<f32>) -> Self {
    FilterParams {
      score_threshold: clamp_or(score_threshold, 0.0, 1.0, DEFAULT_SCORE_THRESHOLD),
      iou_threshold: clamp_or(iou_threshold, 0.0, IOU_THRESHOLD_MAX, DEFAULT_IOU_THRESHOLD),
      min_area: min_area.filter(|v| !v.is_nan()).map(|v| v.max(0.0)),
      nms_mode: NmsMode::default(),
      raw: false,
    }
  }

  /// 批处理界面的默认参数
  pub fn batch_default() -> Self {
    FilterParams::new(0.4, 0.3, Some(200.0))
  }

  /// 不做任何过滤，保留全部候选框
  pub fn pass_through() -> Self {
    FilterParams::new(0.0, IOU_THRESHOLD_MAX, None)
  }

  /// 原始模式：跳过全部过滤阶段，并在响应中标记
  pub fn raw() -> Self {
    FilterParams {
      raw: true,
      ..FilterParams::pass_through()
    }
  }

  pub fn with_nms_mode(mut self, nms_mode: NmsMode) -> Self {
    self.nms_mode = nms_mode;
    self
  }

  pub fn score_threshold(&self) -> f32 {
    self.score_threshold
  }

  pub fn iou_threshold(&self) -> f32 {
    self.iou_threshold
  }

  pub fn min_area(&self) -> Option<f32> {
    self.min_area
  }

  pub fn nms_mode(&self) -> NmsMode {
    self.nms_mode
  }

  pub fn is_raw(&self) -> bool {
    self.raw
  }

  pub fn suppression_enabled(&self) -> bool {
    !self.raw && self.iou_threshold < IOU_THRESHOLD_MAX
  }
}

fn clamp_or(value: f32, min: f32, max: f32, fallback: f32) -> f32 {
  if value.is_nan() {
    fallback
  } else {
    value.clamp(min, max)
  }
}
