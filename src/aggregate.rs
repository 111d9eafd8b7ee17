// 该文件是 Xibao （细胞计数） 项目的一部分。
// src/aggregate.rs - 类别计数与存活率
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

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use crate::{
  detection::{Detection, RawDetection},
  labels::ClassNameMap,
};

/// 类别名称 -> 数量
pub type CountSummary = BTreeMap<String, usize>;

/// 参与存活率计算的类别名称，按 ASCII 忽略大小写匹配
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViabilityLabels {
  alive: String,
  dead: String,
  aggregate: String,
}

impl Default for ViabilityLabels {
  fn default() -> Self {
    ViabilityLabels::new("live", "dead", "aggregate")
  }
}

impl ViabilityLabels {
  pub fn new(alive: impl Into<String>, dead: impl Into<String>, aggregate: impl Into<String>) -> Self {
    ViabilityLabels {
      alive: alive.into(),
      dead: dead.into(),
      aggregate: aggregate.into(),
    }
  }

  fn count(&self, counts: &CountSummary) -> ViabilityCounts {
    let sum = |label: &str| -> usize {
      counts
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case(label))
        .map(|(_, n)| *n)
        .sum()
    };
    ViabilityCounts {
      alive: sum(&self.alive),
      dead: sum(&self.dead),
      aggregate: sum(&self.aggregate),
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ViabilityCounts {
  pub alive: usize,
  pub dead: usize,
  pub aggregate: usize,
}

impl ViabilityCounts {
  pub fn viability(&self) -> Option<f64> {
    viability(self.alive, self.dead)
  }
}

/// alive / (alive + dead) * 100，保留两位小数；分母为零时无定义
pub fn viability(alive: usize, dead: usize) -> Option<f64> {
  let total = alive + dead;
  if total == 0 {
    return None;
  }
  let ratio = alive as f64 / total as f64 * 100.0;
  Some((ratio * 100.0).round() / 100.0)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
  pub detections: Vec<Detection>,
  pub counts: CountSummary,
  pub viability_counts: ViabilityCounts,
  pub viability: Option<f64>,
}

impl Aggregation {
  pub fn total(&self) -> usize {
    self.detections.len()
  }
}

/// 类别聚合器
#[derive(Debug, Clone, Default)]
pub struct ClassAggregator {
  labels: ViabilityLabels,
  include_known_classes: bool,
}

impl ClassAggregator {
  pub fn new(labels: ViabilityLabels) -> Self {
    ClassAggregator {
      labels,
      include_known_classes: false,
    }
  }

  /// 计数中包含名称映射里出现的全部类别（即使数量为零）
  pub fn with_known_classes(mut self, include_known_classes: bool) -> Self {
    self.include_known_classes = include_known_classes;
    self
  }

  pub fn labels(&self) -> &ViabilityLabels {
    &self.labels
  }

  pub fn aggregate(&self, detections: &[RawDetection], names: &ClassNameMap) -> Aggregation {
    let mut counts = CountSummary::new();
    if self.include_known_classes {
      for name in names.known_names() {
        counts.insert(name.to_string(), 0);
      }
    }

    let detections: Vec<Detection> = detections
      .iter()
      .map(|raw| {
        let name = names.name_of(raw.class_id()).into_owned();
        *counts.entry(name.clone()).or_insert(0) += 1;
        Detection::named(raw, name)
      })
      .collect();

    let viability_counts = self.labels.count(&counts);
    let viability = viability_counts.viability();
    debug!(
      "聚合: 检测 {} 个, 计数 {:?}, 存活率 {:?}",
      detections.len(),
      counts,
      viability
    );

    Aggregation {
      detections,
      counts,
      viability_counts,
      viability,
    }
  }
}

/// 检测框面积统计
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AreaSummary {
  pub count: usize,
  pub total: f64,
  pub mean: f64,
  pub largest: f64,
  pub smallest: f64,
}

impl AreaSummary {
  pub fn of(detections: &[Detection]) -> Option<Self> {
    if detections.is_empty() {
      return None;
    }

    let areas = detections.iter().map(|det| det.bbox.area() as f64);
    let total: f64 = areas.clone().sum();
    let largest = areas.clone().fold(f64::MIN, f64::max);
    let smallest = areas.fold(f64::MAX, f64::min);

    Some(AreaSummary {
      count: detections.len(),
      total,
      mean: total / detections.len() as f64,
      largest,
      smallest,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn det(bbox: [f32; 4], class_id: u32) -> RawDetection {
    RawDetection::decode(bbox, 0.9, class_id).unwrap()
  }

  #[test]
  fn viability_rule() {
    assert_eq!(viability(0, 0), None);
    assert_eq!(viability(1, 1), Some(50.0));
    assert_eq!(viability(0, 3), Some(0.0));
    assert_eq!(viability(3, 0), Some(100.0));
    assert_eq!(viability(2, 1), Some(66.67));
  }

  #[test]
  fn counts_are_conserved() {
    let names = ClassNameMap::from_labels(["live", "dead"]);
    let raw = [
      det([0.0, 0.0, 1.0, 1.0], 0),
      det([0.0, 0.0, 1.0, 1.0], 0),
      det([0.0, 0.0, 1.0, 1.0], 1),
      det([0.0, 0.0, 1.0, 1.0], 9),
    ];
    let agg = ClassAggregator::default().aggregate(&raw, &names);
    assert_eq!(agg.counts.values().sum::<usize>(), raw.len());
    assert_eq!(agg.counts["live"], 2);
    assert_eq!(agg.counts["9"], 1);
    assert_eq!(agg.detections[3].class_name, "9");
    assert_eq!(agg.viability, Some(66.67));
  }

  #[test]
  fn known_classes_flag() {
    let names = ClassNameMap::from_labels(["live", "dead", "aggregate"]);
    let raw = [det([0.0, 0.0, 1.0, 1.0], 0)];

    let open = ClassAggregator::default().aggregate(&raw, &names);
    assert_eq!(open.counts.len(), 1);

    let closed = ClassAggregator::default()
      .with_known_classes(true)
      .aggregate(&raw, &names);
    assert_eq!(closed.counts.len(), 3);
    assert_eq!(closed.counts["dead"], 0);
    assert_eq!(closed.counts.values().sum::<usize>(), 1);
  }

  #[test]
  fn labels_match_ignoring_case() {
    let names = ClassNameMap::from_labels(["Alive", "Dead", "Aggregate"]);
    let raw = [
      det([0.0, 0.0, 1.0, 1.0], 0),
      det([0.0, 0.0, 1.0, 1.0], 1),
      det([0.0, 0.0, 1.0, 1.0], 2),
      det([0.0, 0.0, 1.0, 1.0], 2),
    ];
    let agg = ClassAggregator::new(ViabilityLabels::new("alive", "dead", "aggregate"))
      .aggregate(&raw, &names);
    assert_eq!(
      agg.viability_counts,
      ViabilityCounts {
        alive: 1,
        dead: 1,
        aggregate: 2,
      }
    );
    assert_eq!(agg.viability, Some(50.0));
  }

  #[test]
  fn no_alive_or_dead_means_no_viability() {
    let names = ClassNameMap::from_labels(["live", "dead", "aggregate"]);
    let agg = ClassAggregator::default().aggregate(&[det([0.0, 0.0, 1.0, 1.0], 2)], &names);
    assert_eq!(agg.viability, None);
    assert_eq!(agg.total(), 1);
  }

  #[test]
  fn area_summary() {
    let names = ClassNameMap::new();
    let agg = ClassAggregator::default().aggregate(
      &[det([0.0, 0.0, 2.0, 2.0], 0), det([0.0, 0.0, 4.0, 4.0], 0)],
      &names,
    );
    let summary = AreaSummary::of(&agg.detections).unwrap();
    assert_eq!(summary.count, 2);
    assert_eq!(summary.total, 20.0);
    assert_eq!(summary.mean, 10.0);
    assert_eq!(summary.largest, 16.0);
    assert_eq!(summary.smallest, 4.0);
    assert!(AreaSummary::of(&[]).is_none());
  }
}
