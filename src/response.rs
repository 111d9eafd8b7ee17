// 该文件是 Xibao （细胞计数） 项目的一部分。
// src/response.rs - 单张图像的推理响应
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

use serde::Serialize;

use crate::{
  aggregate::{Aggregation, CountSummary},
  detection::Detection,
  params::FilterParams,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionView {
  /// 整数像素坐标 [x1, y1, x2, y2]，向零取整
  pub bbox: [i64; 4],
  pub score: f32,
  pub class_id: u32,
  pub class_name: String,
}

impl From<&Detection> for DetectionView {
  fn from(det: &Detection) -> Self {
    let [x1, y1, x2, y2] = det.bbox.to_array();
    DetectionView {
      bbox: [x1 as i64, y1 as i64, x2 as i64, y2 as i64],
      score: det.score,
      class_id: det.class_id,
      class_name: det.class_name.clone(),
    }
  }
}

/// 实际生效的阈值；原始模式下 IoU 阈值与最小尺寸为空
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThresholdsUsed {
  pub score_threshold: f32,
  pub iou_threshold: Option<f32>,
  pub min_bbox_size: Option<f32>,
  pub raw: bool,
}

impl From<&FilterParams> for ThresholdsUsed {
  fn from(params: &FilterParams) -> Self {
    if params.is_raw() {
      return ThresholdsUsed {
        score_threshold: 0.0,
        iou_threshold: None,
        min_bbox_size: None,
        raw: true,
      };
    }
    ThresholdsUsed {
      score_threshold: params.score_threshold(),
      iou_threshold: Some(params.iou_threshold()),
      min_bbox_size: params.min_area(),
      raw: false,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResponse {
  pub num_detections: usize,
  pub detections: Vec<DetectionView>,
  pub counts: CountSummary,
  pub viability: Option<f64>,
  pub thresholds_used: ThresholdsUsed,
}

impl PredictionResponse {
  pub fn new(aggregation: &Aggregation, params: &FilterParams) -> Self {
    PredictionResponse {
      num_detections: aggregation.detections.len(),
      detections: aggregation.detections.iter().map(DetectionView::from).collect(),
      counts: aggregation.counts.clone(),
      viability: aggregation.viability,
      thresholds_used: ThresholdsUsed::from(params),
    }
  }

  pub fn to_json(&self) -> serde_json::Result<String> {
    serde_json::to_string(self)
  }
}
