// 该文件是 Xibao （细胞计数） 项目的一部分。
// src/bin/master_table.rs - 从已保存的原始预测重建汇总表
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

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use url::Url;

use xibao::{
  FromUrl,
  aggregate::{ClassAggregator, ViabilityLabels},
  labels::ClassNameMap,
  params::FilterParams,
  store::{AnyPersistence, RawStore},
  table::{MasterTableBuilder, save_csv},
};

/// 汇总表参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 原始预测存储，例如 folder:///data/raw
  #[arg(long, value_name = "STORE")]
  pub store: Url,
  /// 类别名称文件（.names 或 .json）
  #[arg(long, value_name = "FILE")]
  pub labels: PathBuf,
  /// 输出 CSV 路径
  #[arg(long, default_value = "master_table.csv", value_name = "OUTPUT")]
  pub output: PathBuf,
  /// 置信度阈值 (0.0 - 1.0)
  #[arg(long, default_value = "0.4", value_name = "THRESHOLD")]
  pub score_threshold: f32,
  /// NMS IOU 阈值 (0.0 - 0.9999)
  #[arg(long, default_value = "0.3", value_name = "THRESHOLD")]
  pub iou_threshold: f32,
  /// 最小检测框面积（像素）
  #[arg(long, default_value = "200", value_name = "AREA")]
  pub min_bbox_size: Option<f32>,
  /// 不按检测框面积过滤
  #[arg(long, conflicts_with = "min_bbox_size")]
  pub no_min_bbox_size: bool,
  /// 存活类别名称
  #[arg(long, default_value = "Alive")]
  pub alive_label: String,
  /// 死亡类别名称
  #[arg(long, default_value = "Dead")]
  pub dead_label: String,
  /// 聚集类别名称
  #[arg(long, default_value = "Aggregate")]
  pub aggregate_label: String,
}

fn filter_params(args: &Args) -> FilterParams {
  let min_area = if args.no_min_bbox_size { None } else { args.min_bbox_size };
  FilterParams::new(args.score_threshold, args.iou_threshold, min_area)
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("原始预测存储: {}", args.store);
  info!("类别文件: {}", args.labels.display());
  info!("输出路径: {}", args.output.display());

  let names = ClassNameMap::load(&args.labels)?;
  let store = RawStore::<AnyPersistence>::from_url(&args.store)?;
  let params = filter_params(&args);
  let builder = MasterTableBuilder::new(ClassAggregator::new(ViabilityLabels::new(
    args.alive_label,
    args.dead_label,
    args.aggregate_label,
  )));

  let now = std::time::Instant::now();
  let rows = builder.replay(&store, &params, &names)?;
  info!("汇总表重建完成，耗时: {:.2?}", now.elapsed());

  for row in rows.iter().filter(|row| row.is_errored()) {
    warn!("{}: {}", row.filename, row.error.as_deref().unwrap_or_default());
  }
  save_csv(&rows, &args.output)?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  const BASE: [&str; 5] = ["master-table", "--store", "memory:", "--labels", "labels.names"];

  #[test]
  fn size_filter_defaults_to_batch_value() {
    let args = Args::try_parse_from(BASE).unwrap();
    assert_eq!(filter_params(&args), FilterParams::batch_default());
  }

  #[test]
  fn size_filter_can_be_turned_off() {
    let args = Args::try_parse_from(BASE.into_iter().chain(["--no-min-bbox-size"])).unwrap();
    assert_eq!(filter_params(&args).min_area(), None);

    let args = Args::try_parse_from(BASE.into_iter().chain(["--min-bbox-size", "50"])).unwrap();
    assert_eq!(filter_params(&args).min_area(), Some(50.0));
  }
}
