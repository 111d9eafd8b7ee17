// 该文件是 Xibao （细胞计数） 项目的一部分。
// src/filter.rs - 置信度过滤、尺寸过滤与非极大值抑制
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

use tracing::debug;

use crate::{
  detection::RawDetection,
  params::{FilterParams, NmsMode},
};

/// 检测框过滤器
///
/// 依次执行置信度过滤、尺寸过滤和非极大值抑制。纯函数，不做 I/O。
/// 输出按置信度降序排列，同分时保留输入顺序。
#[derive(Debug, Clone, Copy, Default)]
pub struct BoxFilterEngine {
  params: FilterParams,
}

impl BoxFilterEngine {
  pub fn new(params: FilterParams) -> Self {
    BoxFilterEngine { params }
  }

  pub fn params(&self) -> &FilterParams {
    &self.params
  }

  pub fn filter(&self, raw: &[RawDetection]) -> Vec<RawDetection> {
    if self.params.is_raw() {
      return raw.to_vec();
    }

    let score_threshold = self.params.score_threshold();
    let candidates: Vec<RawDetection> = raw
      .iter()
      .filter(|det| det.score() >= score_threshold)
      .filter(|det| {
        self
          .params
          .min_area()
          .is_none_or(|min_area| det.bbox().area() >= min_area)
      })
      .copied()
      .collect();

    debug!(
      "过滤: 输入 {} 个, 通过置信度与尺寸过滤 {} 个",
      raw.len(),
      candidates.len()
    );

    if !self.params.suppression_enabled() {
      return candidates;
    }

    let kept = non_max_suppression(
      candidates,
      self.params.iou_threshold(),
      self.params.nms_mode(),
    );
    debug!("非极大值抑制后保留 {} 个", kept.len());
    kept
  }
}

/// 非极大值抑制
///
/// 与已选框 IoU 大于 `iou_threshold` 的候选框被抑制。
pub fn non_max_suppression(
  mut candidates: Vec<RawDetection>,
  iou_threshold: f32,
  mode: NmsMode,
) -> Vec<RawDetection> {
  // 按置信度降序排序，稳定排序保证同分时靠前的输入优先
  candidates.sort_by(|a, b| b.score().total_cmp(&a.score()));

  let mut suppressed = vec![false; candidates.len()];
  let mut result = Vec::new();

  for i in 0..candidates.len() {
    if suppressed[i] {
      continue;
    }
    let best = candidates[i];
    result.push(best);

    for (j, det) in candidates.iter().enumerate().skip(i + 1) {
      if suppressed[j] {
        continue;
      }
      if mode == NmsMode::PerClass && det.class_id() != best.class_id() {
        continue;
      }
      if best.bbox().iou(det.bbox()) > iou_threshold {
        suppressed[j] = true;
      }
    }
  }

  result
}
