// 该文件是 Xibao （细胞计数） 项目的一部分。
// src/table.rs - 批处理汇总表
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

use std::{io::Write, path::Path};

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
  aggregate::ClassAggregator,
  detection::{InvalidInput, decode_rows},
  filter::BoxFilterEngine,
  labels::ClassNameMap,
  params::FilterParams,
  store::{Persistence, RawRecord, RawStore, StoreError},
};

/// 汇总表列名，顺序是对外约定的一部分
pub const MASTER_TABLE_HEADER: [&str; 6] = ["Filename", "Total", "Alive", "Dead", "Aggregate", "Viability"];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RowError {
  #[error("第 {index} 行原始检测无效: {source}")]
  InvalidRow { index: usize, source: InvalidInput },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MasterTableRow {
  pub filename: String,
  pub total: usize,
  pub alive: usize,
  pub dead: usize,
  pub aggregate: usize,
  pub viability: Option<f64>,
  /// 该行处理失败的原因，失败行的计数全部为零
  pub error: Option<String>,
}

impl MasterTableRow {
  fn errored(filename: &str, error: &RowError) -> Self {
    MasterTableRow {
      filename: filename.to_string(),
      total: 0,
      alive: 0,
      dead: 0,
      aggregate: 0,
      viability: None,
      error: Some(error.to_string()),
    }
  }

  pub fn is_errored(&self) -> bool {
    self.error.is_some()
  }
}

/// 汇总表构建器
///
/// 汇总表是 (原始记录, 过滤参数) 的纯函数，参数变化时整表重算，不会触碰模型或原始图像。
#[derive(Debug, Clone, Default)]
pub struct MasterTableBuilder {
  aggregator: ClassAggregator,
}

impl MasterTableBuilder {
  pub fn new(aggregator: ClassAggregator) -> Self {
    MasterTableBuilder { aggregator }
  }

  pub fn build(&self, records: &[RawRecord], params: &FilterParams, names: &ClassNameMap) -> Vec<MasterTableRow> {
    let engine = BoxFilterEngine::new(*params);
    let rows: Vec<MasterTableRow> = records
      .iter()
      .map(|record| match self.build_row(&engine, record, names) {
        Ok(row) => row,
        Err(e) => {
          warn!("{}: {}", record.image_id, e);
          MasterTableRow::errored(&record.image_id, &e)
        }
      })
      .collect();

    let errored = rows.iter().filter(|row| row.is_errored()).count();
    info!("汇总表构建完成: {} 行, 失败 {} 行", rows.len(), errored);
    rows
  }

  /// 重新读取存储中的全部原始记录并构建汇总表
  pub fn replay<P: Persistence>(
    &self,
    store: &RawStore<P>,
    params: &FilterParams,
    names: &ClassNameMap,
  ) -> Result<Vec<MasterTableRow>, StoreError> {
    let records = store.load_all()?;
    Ok(self.build(&records, params, names))
  }

  fn build_row(
    &self,
    engine: &BoxFilterEngine,
    record: &RawRecord,
    names: &ClassNameMap,
  ) -> Result<MasterTableRow, RowError> {
    let raw = decode_rows(&record.rows).map_err(|(index, source)| RowError::InvalidRow { index, source })?;
    let kept = engine.filter(&raw);
    let aggregation = self.aggregator.aggregate(&kept, names);

    Ok(MasterTableRow {
      filename: record.image_id.clone(),
      total: aggregation.total(),
      alive: aggregation.viability_counts.alive,
      dead: aggregation.viability_counts.dead,
      aggregate: aggregation.viability_counts.aggregate,
      viability: aggregation.viability,
      error: None,
    })
  }
}

/// 写出 CSV，失败行只保留文件名，其余列留空
pub fn write_csv<W: Write>(rows: &[MasterTableRow], mut writer: W) -> std::io::Result<()> {
  writeln!(writer, "{}", MASTER_TABLE_HEADER.join(","))?;
  for row in rows {
    let filename = escape_csv(&row.filename);
    if row.is_errored() {
      writeln!(writer, "{},,,,,", filename)?;
      continue;
    }
    let viability = row.viability.map(|v| format!("{:.2}", v)).unwrap_or_default();
    writeln!(
      writer,
      "{},{},{},{},{},{}",
      filename, row.total, row.alive, row.dead, row.aggregate, viability
    )?;
  }
  writer.flush()
}

pub fn to_csv_string(rows: &[MasterTableRow]) -> String {
  let mut buffer = Vec::new();
  // 写入内存缓冲区不会失败
  let _ = write_csv(rows, &mut buffer);
  String::from_utf8_lossy(&buffer).into_owned()
}

pub fn save_csv(rows: &[MasterTableRow], path: &Path) -> std::io::Result<()> {
  if let Some(parent) = path.parent() {
    if !parent.as_os_str().is_empty() {
      std::fs::create_dir_all(parent)?;
    }
  }
  let file = std::fs::File::create(path)?;
  write_csv(rows, std::io::BufWriter::new(file))?;
  info!("汇总表已保存: {}", path.display());
  Ok(())
}

fn escape_csv(field: &str) -> String {
  if field.contains([',', '"', '\n', '\r']) {
    format!("\"{}\"", field.replace('"', "\"\""))
  } else {
    field.to_string()
  }
}
