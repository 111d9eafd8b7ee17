// 该文件是 Xibao （细胞计数） 项目的一部分。
// src/detection.rs - 检测框数据类型与解码
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
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::DetectResult;

/// 持久化的原始检测行: [x1, y1, x2, y2, score, class_id]
pub type RawRow = [f32; 6];

/// 类别编号上限（不含）。小于该值的整数在 f32 行中可以无损保存
pub const CLASS_ID_LIMIT: u32 = 1 << 24;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvalidInput {
  #[error("边界框坐标不是有限数: {0:?}")]
  NonFiniteBox([f32; 4]),
  #[error("边界框面积为零或为负: {0:?}")]
  DegenerateBox([f32; 4]),
  #[error("置信度超出 [0, 1] 范围: {0}")]
  ScoreOutOfRange(f32),
  #[error("类别编号无效: {0}")]
  InvalidClassId(f32),
}

/// 轴对齐边界框，像素坐标，保证 x1 < x2 且 y1 < y2
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
  x1: f32,
  y1: f32,
  x2: f32,
  y2: f32,
}

impl BoundingBox {
  pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Result<Self, InvalidInput> {
    let coords = [x1, y1, x2, y2];
    if coords.iter().any(|v| !v.is_finite()) {
      return Err(InvalidInput::NonFiniteBox(coords));
    }
    if x1 >= x2 || y1 >= y2 {
      return Err(InvalidInput::DegenerateBox(coords));
    }
    Ok(BoundingBox { x1, y1, x2, y2 })
  }

  pub fn x1(&self) -> f32 {
    self.x1
  }

  pub fn y1(&self) -> f32 {
    self.y1
  }

  pub fn x2(&self) -> f32 {
    self.x2
  }

  pub fn y2(&self) -> f32 {
    self.y2
  }

  pub fn width(&self) -> f32 {
    self.x2 - self.x1
  }

  pub fn height(&self) -> f32 {
    self.y2 - self.y1
  }

  pub fn area(&self) -> f32 {
    self.width() * self.height()
  }

  pub fn to_array(&self) -> [f32; 4] {
    [self.x1, self.y1, self.x2, self.y2]
  }

  pub fn intersection_area(&self, other: &BoundingBox) -> f32 {
    let x1 = self.x1.max(other.x1);
    let y1 = self.y1.max(other.y1);
    let x2 = self.x2.min(other.x2);
    let y2 = self.y2.min(other.y2);

    (x2 - x1).max(0.0) * (y2 - y1).max(0.0)
  }

  /// 计算两个边界框的 IoU
  pub fn iou(&self, other: &BoundingBox) -> f32 {
    let intersection = self.intersection_area(other);
    let union = self.area() + other.area() - intersection;

    if union > 0.0 {
      intersection / union
    } else {
      0.0
    }
  }
}

/// 经过校验的模型原始检测结果
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RawDetection {
  bbox: BoundingBox,
  score: f32,
  class_id: u32,
}

impl RawDetection {
  pub fn decode(bbox: [f32; 4], score: f32, class_id: u32) -> Result<Self, InvalidInput> {
    let bbox = BoundingBox::new(bbox[0], bbox[1], bbox[2], bbox[3])?;
    if !(0.0..=1.0).contains(&score) {
      return Err(InvalidInput::ScoreOutOfRange(score));
    }
    if class_id >= CLASS_ID_LIMIT {
      return Err(InvalidInput::InvalidClassId(class_id as f32));
    }
    Ok(RawDetection {
      bbox,
      score,
      class_id,
    })
  }

  /// 从持久化行解码，类别编号必须是小于 `CLASS_ID_LIMIT` 的非负整数
  pub fn from_row(row: &RawRow) -> Result<Self, InvalidInput> {
    let [x1, y1, x2, y2, score, class_id] = *row;
    if !class_id.is_finite() || class_id < 0.0 || class_id.fract() != 0.0 || class_id >= CLASS_ID_LIMIT as f32 {
      return Err(InvalidInput::InvalidClassId(class_id));
    }
    Self::decode([x1, y1, x2, y2], score, class_id as u32)
  }

  pub fn to_row(&self) -> RawRow {
    let [x1, y1, x2, y2] = self.bbox.to_array();
    [x1, y1, x2, y2, self.score, self.class_id as f32]
  }

  pub fn bbox(&self) -> &BoundingBox {
    &self.bbox
  }

  pub fn score(&self) -> f32 {
    self.score
  }

  pub fn class_id(&self) -> u32 {
    self.class_id
  }
}

/// 过滤后对外输出的检测结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
  pub bbox: BoundingBox,
  /// 置信度，保留四位小数
  pub score: f32,
  pub class_id: u32,
  pub class_name: String,
}

impl Detection {
  pub fn named(raw: &RawDetection, class_name: String) -> Self {
    Detection {
      bbox: raw.bbox,
      score: round_score(raw.score),
      class_id: raw.class_id,
      class_name,
    }
  }
}

fn round_score(score: f32) -> f32 {
  (score * 10_000.0).round() / 10_000.0
}

/// 模型输出的解码结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decoded {
  pub detections: Vec<RawDetection>,
  /// 被拒绝的候选框: (输入位置, 原因)
  pub rejected: Vec<(usize, InvalidInput)>,
}

/// 解码模型输出，无效候选框逐个上报，不影响其他候选框
pub fn decode_items(result: &DetectResult) -> Decoded {
  let mut decoded = Decoded::default();
  for (index, item) in result.items.iter().enumerate() {
    match RawDetection::decode(item.bbox, item.score, item.class_id) {
      Ok(det) => decoded.detections.push(det),
      Err(e) => {
        warn!("第 {} 个候选框无效，已丢弃: {}", index, e);
        decoded.rejected.push((index, e));
      }
    }
  }
  debug!(
    "解码 {} 个候选框, 有效 {}, 无效 {}",
    result.len(),
    decoded.detections.len(),
    decoded.rejected.len()
  );
  decoded
}

/// 解码持久化行，遇到第一个无效行即返回 (行号, 原因)
pub fn decode_rows(rows: &[RawRow]) -> Result<Vec<RawDetection>, (usize, InvalidInput)> {
  rows
    .iter()
    .enumerate()
    .map(|(index, row)| RawDetection::from_row(row).map_err(|e| (index, e)))
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::DetectItem;

  #[test]
  fn rejects_degenerate_boxes() {
    assert!(matches!(
      BoundingBox::new(5.0, 0.0, 5.0, 10.0),
      Err(InvalidInput::DegenerateBox(_))
    ));
    assert!(matches!(
      BoundingBox::new(0.0, 10.0, 10.0, 2.0),
      Err(InvalidInput::DegenerateBox(_))
    ));
    assert!(matches!(
      BoundingBox::new(0.0, f32::NAN, 10.0, 2.0),
      Err(InvalidInput::NonFiniteBox(_))
    ));
  }

  #[test]
  fn iou_of_overlapping_boxes() {
    let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0).unwrap();
    let b = BoundingBox::new(1.0, 1.0, 11.0, 11.0).unwrap();
    let c = BoundingBox::new(50.0, 50.0, 60.0, 60.0).unwrap();

    // 81 / (100 + 100 - 81)
    assert!((a.iou(&b) - 81.0 / 119.0).abs() < 1e-6);
    assert_eq!(a.iou(&c), 0.0);
    assert_eq!(a.iou(&a), 1.0);
  }

  #[test]
  fn decode_checks_score_range() {
    assert!(RawDetection::decode([0.0, 0.0, 1.0, 1.0], 1.0, 0).is_ok());
    assert_eq!(
      RawDetection::decode([0.0, 0.0, 1.0, 1.0], 1.5, 0),
      Err(InvalidInput::ScoreOutOfRange(1.5))
    );
  }

  #[test]
  fn row_class_id_must_be_integral() {
    assert_eq!(
      RawDetection::from_row(&[0.0, 0.0, 1.0, 1.0, 0.5, 1.5]),
      Err(InvalidInput::InvalidClassId(1.5))
    );
    assert_eq!(
      RawDetection::from_row(&[0.0, 0.0, 1.0, 1.0, 0.5, -1.0]),
      Err(InvalidInput::InvalidClassId(-1.0))
    );
    let det = RawDetection::from_row(&[0.0, 0.0, 1.0, 1.0, 0.5, 2.0]).unwrap();
    assert_eq!(det.class_id(), 2);
    assert_eq!(det.to_row(), [0.0, 0.0, 1.0, 1.0, 0.5, 2.0]);
  }

  #[test]
  fn class_id_survives_row_round_trip() {
    let largest = RawDetection::decode([0.0, 0.0, 1.0, 1.0], 0.5, CLASS_ID_LIMIT - 1).unwrap();
    let back = RawDetection::from_row(&largest.to_row()).unwrap();
    assert_eq!(back.class_id(), CLASS_ID_LIMIT - 1);
    assert_eq!(back, largest);

    // 超出上限的编号无法在行中无损保存，两条路径都拒绝
    assert!(matches!(
      RawDetection::decode([0.0, 0.0, 1.0, 1.0], 0.5, CLASS_ID_LIMIT + 1),
      Err(InvalidInput::InvalidClassId(_))
    ));
    assert!(matches!(
      RawDetection::from_row(&[0.0, 0.0, 1.0, 1.0, 0.5, 16_777_216.0]),
      Err(InvalidInput::InvalidClassId(_))
    ));
    assert_eq!(
      RawDetection::from_row(&[0.0, 0.0, 1.0, 1.0, 0.5, 4_294_967_296.0]),
      Err(InvalidInput::InvalidClassId(4_294_967_296.0))
    );
  }

  #[test]
  fn decode_rows_reports_first_bad_row() {
    let rows = [
      [0.0, 0.0, 1.0, 1.0, 0.5, 0.0],
      [0.0, 0.0, 1.0, 1.0, 0.5, 0.0],
      [3.0, 0.0, 1.0, 1.0, 0.5, 0.0],
    ];
    let (index, err) = decode_rows(&rows).unwrap_err();
    assert_eq!(index, 2);
    assert!(matches!(err, InvalidInput::DegenerateBox(_)));
    assert_eq!(decode_rows(&rows[..2]).unwrap().len(), 2);
  }

  #[test]
  fn decode_items_keeps_valid_siblings() {
    let result = DetectResult::from(vec![
      DetectItem {
        class_id: 0,
        score: 0.9,
        bbox: [0.0, 0.0, 10.0, 10.0],
      },
      DetectItem {
        class_id: 0,
        score: 0.9,
        bbox: [10.0, 0.0, 0.0, 10.0],
      },
    ]);
    let decoded = decode_items(&result);
    assert_eq!(decoded.detections.len(), 1);
    assert_eq!(decoded.rejected.len(), 1);
    assert_eq!(decoded.rejected[0].0, 1);
  }

  #[test]
  fn named_detection_rounds_score() {
    let raw = RawDetection::decode([0.0, 0.0, 1.0, 1.0], 0.123_456, 3).unwrap();
    let det = Detection::named(&raw, "live".to_string());
    assert_eq!(det.score, 0.1235);
    assert_eq!(det.class_name, "live");
  }
}
