// 该文件是 Xibao （细胞计数） 项目的一部分。
// src/service.rs - 计数服务
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

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  aggregate::ClassAggregator,
  cache::{CacheConfig, Clock, Fingerprint, PredictionCache},
  detection::{RawDetection, decode_items},
  filter::BoxFilterEngine,
  labels::ClassNameMap,
  model::{InferenceError, Model},
  params::FilterParams,
  response::PredictionResponse,
  store::{Persistence, RawRecord, RawStore, StoreError},
  table::{MasterTableBuilder, MasterTableRow},
};

#[derive(Error, Debug)]
pub enum ServiceError {
  #[error(transparent)]
  Inference(#[from] InferenceError),
  #[error(transparent)]
  Store(#[from] StoreError),
}

/// 批处理结果
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
  pub rows: Vec<MasterTableRow>,
  /// 推理失败的图像，不出现在汇总表中
  pub failures: Vec<(String, InferenceError)>,
}

/// 计数服务
///
/// 显式构造并注入到请求处理方，缓存位于模型调用之前，原始存储位于其后。
pub struct CountingService<M> {
  model: M,
  names: ClassNameMap,
  cache: PredictionCache<Arc<[RawDetection]>>,
  aggregator: ClassAggregator,
  table: MasterTableBuilder,
}

impl<M: Model> CountingService<M> {
  pub fn new(model: M, names: ClassNameMap, cache_config: CacheConfig) -> Self {
    Self::with_cache(model, names, PredictionCache::new(cache_config))
  }

  pub fn with_clock(model: M, names: ClassNameMap, cache_config: CacheConfig, clock: impl Clock + 'static) -> Self {
    Self::with_cache(model, names, PredictionCache::with_clock(cache_config, clock))
  }

  fn with_cache(model: M, names: ClassNameMap, cache: PredictionCache<Arc<[RawDetection]>>) -> Self {
    CountingService {
      model,
      names,
      cache,
      aggregator: ClassAggregator::default(),
      table: MasterTableBuilder::default(),
    }
  }

  /// 替换聚合器，单张预测与汇总表使用相同的存活/死亡类别
  pub fn with_aggregator(mut self, aggregator: ClassAggregator) -> Self {
    self.table = MasterTableBuilder::new(aggregator.clone());
    self.aggregator = aggregator;
    self
  }

  pub fn names(&self) -> &ClassNameMap {
    &self.names
  }

  pub fn cache(&self) -> &PredictionCache<Arc<[RawDetection]>> {
    &self.cache
  }

  pub fn table(&self) -> &MasterTableBuilder {
    &self.table
  }

  /// 处理单张图像；同一时间窗口内相同的图像字节只推理一次
  pub fn predict(&self, image: &[u8], params: &FilterParams) -> Result<PredictionResponse, ServiceError> {
    let fingerprint = Fingerprint::of(image);
    let bucket = self.cache.time_bucket();
    let raw = self
      .cache
      .get_or_compute(fingerprint, bucket, || self.infer_raw(image))?;

    let kept = BoxFilterEngine::new(*params).filter(&raw);
    let aggregation = self.aggregator.aggregate(&kept, &self.names);
    debug!(
      "图像 {}: 原始 {} 个, 保留 {} 个",
      fingerprint,
      raw.len(),
      kept.len()
    );
    Ok(PredictionResponse::new(&aggregation, params))
  }

  /// 批处理：逐张推理并写入原始存储，随后构建汇总表
  ///
  /// 模型输出原样写入存储，校验在构建汇总表时进行，含无效候选框的图像
  /// 在表中标记为失败行。单张图像推理失败只记录在报告中，不会中断整个批次。
  pub fn run_batch<P, I, S, B>(
    &self,
    images: I,
    store: &RawStore<P>,
    params: &FilterParams,
  ) -> Result<BatchReport, StoreError>
  where
    P: Persistence,
    I: IntoIterator<Item = (S, B)>,
    S: Into<String>,
    B: AsRef<[u8]>,
  {
    let mut stored = Vec::new();
    let mut failures = Vec::new();

    for (image_id, bytes) in images {
      let image_id = image_id.into();
      let now = std::time::Instant::now();
      match self.model.infer(bytes.as_ref()) {
        Ok(result) => {
          info!(
            "{}: 推理完成，耗时: {:.2?}, 候选框 {} 个",
            image_id,
            now.elapsed(),
            result.len()
          );
          store.put_record(&RawRecord::from_result(image_id.as_str(), &result))?;
          stored.push(image_id);
        }
        Err(e) => {
          warn!("{}: {}", image_id, e);
          failures.push((image_id, e));
        }
      }
    }

    let records = store.load(&stored)?;
    let rows = self.table.build(&records, params, &self.names);
    Ok(BatchReport { rows, failures })
  }

  /// 使用已保存的原始预测重建汇总表，不调用模型
  pub fn rebuild_table<P: Persistence>(
    &self,
    store: &RawStore<P>,
    params: &FilterParams,
  ) -> Result<Vec<MasterTableRow>, StoreError> {
    self.table.replay(store, params, &self.names)
  }

  fn infer_raw(&self, image: &[u8]) -> Result<Arc<[RawDetection]>, InferenceError> {
    let now = std::time::Instant::now();
    let result = self.model.infer(image)?;
    info!("推理完成，耗时: {:.2?}", now.elapsed());
    let decoded = decode_items(&result);
    Ok(decoded.detections.into())
  }
}
