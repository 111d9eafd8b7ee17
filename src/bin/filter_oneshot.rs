// 该文件是 Xibao （细胞计数） 项目的一部分。
// src/bin/filter_oneshot.rs - 对单张图像的原始预测做一次过滤与计数
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

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tracing::info;

use xibao::{
  aggregate::{ClassAggregator, ViabilityLabels},
  detection::{RawRow, decode_rows},
  filter::BoxFilterEngine,
  labels::ClassNameMap,
  params::{DEFAULT_IOU_THRESHOLD, DEFAULT_SCORE_THRESHOLD, FilterParams, NmsMode},
  response::PredictionResponse,
  store::RawRecord,
};

/// 单张图像过滤参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 原始预测文件（`<image_id>_raw.json` 或行数组）
  #[arg(long, value_name = "FILE")]
  pub detections: PathBuf,
  /// 类别名称文件（.names 或 .json）
  #[arg(long, value_name = "FILE")]
  pub labels: Option<PathBuf>,
  /// 置信度阈值 (0.0 - 1.0)
  #[arg(long, default_value_t = DEFAULT_SCORE_THRESHOLD, value_name = "THRESHOLD")]
  pub score_threshold: f32,
  /// NMS IOU 阈值 (0.0 - 0.9999)，取最大值时不做抑制
  #[arg(long, default_value_t = DEFAULT_IOU_THRESHOLD, value_name = "THRESHOLD")]
  pub iou_threshold: f32,
  /// 最小检测框面积（像素）
  #[arg(long, value_name = "AREA")]
  pub min_bbox_size: Option<f32>,
  /// 按类别分别做 NMS
  #[arg(long)]
  pub per_class: bool,
  /// 原始模式：跳过全部过滤
  #[arg(long)]
  pub raw: bool,
  /// 存活类别名称
  #[arg(long, default_value = "live")]
  pub alive_label: String,
  /// 死亡类别名称
  #[arg(long, default_value = "dead")]
  pub dead_label: String,
  /// 聚集类别名称
  #[arg(long, default_value = "aggregate")]
  pub aggregate_label: String,
}

fn read_rows(path: &Path) -> Result<Vec<RawRow>> {
  let bytes = std::fs::read(path).with_context(|| format!("无法读取 {}", path.display()))?;
  if let Ok(record) = serde_json::from_slice::<RawRecord>(&bytes) {
    info!("读取原始预测: {} ({} 行)", record.image_id, record.rows.len());
    return Ok(record.rows);
  }
  let rows: Vec<RawRow> = serde_json::from_slice(&bytes).context("原始预测格式错误")?;
  Ok(rows)
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  let names = match &args.labels {
    Some(path) => ClassNameMap::load(path)?,
    None => ClassNameMap::new(),
  };
  let rows = read_rows(&args.detections)?;
  let raw = decode_rows(&rows).map_err(|(index, e)| anyhow!("第 {} 行原始检测无效: {}", index, e))?;

  let params = if args.raw {
    FilterParams::raw()
  } else {
    let mode = if args.per_class {
      NmsMode::PerClass
    } else {
      NmsMode::ClassAgnostic
    };
    FilterParams::new(args.score_threshold, args.iou_threshold, args.min_bbox_size).with_nms_mode(mode)
  };
  info!("过滤参数: {:?}", params);

  let kept = BoxFilterEngine::new(params).filter(&raw);
  let aggregator = ClassAggregator::new(ViabilityLabels::new(
    args.alive_label,
    args.dead_label,
    args.aggregate_label,
  ));
  let aggregation = aggregator.aggregate(&kept, &names);
  info!("原始 {} 个, 保留 {} 个", raw.len(), kept.len());

  println!("{}", PredictionResponse::new(&aggregation, &params).to_json()?);
  Ok(())
}
