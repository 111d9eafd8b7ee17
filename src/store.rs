// 该文件是 Xibao （细胞计数） 项目的一部分。
// src/store.rs - 原始预测存储
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

use std::{
  collections::BTreeMap,
  sync::{PoisonError, RwLock},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
  FromUrl, FromUrlWithScheme,
  detection::{RawDetection, RawRow},
  model::DetectResult,
};

#[cfg(feature = "folder_store")]
mod folder;
#[cfg(feature = "folder_store")]
pub use self::folder::FolderPersistence;

#[derive(Error, Debug)]
pub enum StoreError {
  #[error("未找到图像的原始预测: {0}")]
  NotFound(String),
  #[error("图像编号无效: {0:?}")]
  InvalidKey(String),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("序列化错误: {0}")]
  Serde(#[from] serde_json::Error),
}

/// 持久化层，对存储格式不做假设
pub trait Persistence: Send + Sync {
  fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;
  fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
  fn keys(&self) -> Result<Vec<String>, StoreError>;
}

/// 进程内存储
#[derive(Debug, Default)]
pub struct MemoryPersistence {
  blobs: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryPersistence {
  pub fn new() -> Self {
    Self::default()
  }
}

impl Persistence for MemoryPersistence {
  fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
    let mut blobs = self.blobs.write().unwrap_or_else(PoisonError::into_inner);
    blobs.insert(key.to_string(), bytes.to_vec());
    Ok(())
  }

  fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
    let blobs = self.blobs.read().unwrap_or_else(PoisonError::into_inner);
    Ok(blobs.get(key).cloned())
  }

  fn keys(&self) -> Result<Vec<String>, StoreError> {
    let blobs = self.blobs.read().unwrap_or_else(PoisonError::into_inner);
    Ok(blobs.keys().cloned().collect())
  }
}

impl FromUrlWithScheme for MemoryPersistence {
  const SCHEME: &'static str = "memory";
}

impl FromUrl for MemoryPersistence {
  type Error = StoreError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(StoreError::SchemeMismatch(url.scheme().to_string()));
    }
    Ok(MemoryPersistence::new())
  }
}

/// 按 URI 方案选择的持久化层
pub enum AnyPersistence {
  Memory(MemoryPersistence),
  #[cfg(feature = "folder_store")]
  Folder(FolderPersistence),
}

impl FromUrl for AnyPersistence {
  type Error = StoreError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    let scheme = url.scheme();
    if scheme == MemoryPersistence::SCHEME {
      return Ok(AnyPersistence::Memory(MemoryPersistence::from_url(url)?));
    }
    #[cfg(feature = "folder_store")]
    {
      if scheme == FolderPersistence::SCHEME {
        return Ok(AnyPersistence::Folder(FolderPersistence::from_url(url)?));
      }
    }
    Err(StoreError::SchemeMismatch(scheme.to_string()))
  }
}

impl Persistence for AnyPersistence {
  fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
    match self {
      AnyPersistence::Memory(p) => p.write(key, bytes),
      #[cfg(feature = "folder_store")]
      AnyPersistence::Folder(p) => p.write(key, bytes),
    }
  }

  fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
    match self {
      AnyPersistence::Memory(p) => p.read(key),
      #[cfg(feature = "folder_store")]
      AnyPersistence::Folder(p) => p.read(key),
    }
  }

  fn keys(&self) -> Result<Vec<String>, StoreError> {
    match self {
      AnyPersistence::Memory(p) => p.keys(),
      #[cfg(feature = "folder_store")]
      AnyPersistence::Folder(p) => p.keys(),
    }
  }
}

/// 单张图像的原始预测，行格式为 [x1, y1, x2, y2, score, class_id]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
  pub image_id: String,
  pub rows: Vec<RawRow>,
}

impl RawRecord {
  pub fn new(image_id: impl Into<String>, rows: Vec<RawRow>) -> Self {
    RawRecord {
      image_id: image_id.into(),
      rows,
    }
  }

  pub fn from_detections(image_id: impl Into<String>, detections: &[RawDetection]) -> Self {
    Self::new(image_id, detections.iter().map(RawDetection::to_row).collect())
  }

  /// 按模型输出原样记录，校验推迟到回放时进行
  pub fn from_result(image_id: impl Into<String>, result: &DetectResult) -> Self {
    let rows = result
      .items
      .iter()
      .map(|item| {
        let [x1, y1, x2, y2] = item.bbox;
        [x1, y1, x2, y2, item.score, item.class_id as f32]
      })
      .collect();
    Self::new(image_id, rows)
  }
}

/// 原始预测存储
///
/// 每张图像写入一次，之后只读。一个批处理会话只有一个写入者。
pub struct RawStore<P> {
  persistence: P,
}

impl<P: Persistence> RawStore<P> {
  pub fn new(persistence: P) -> Self {
    RawStore { persistence }
  }

  pub fn persistence(&self) -> &P {
    &self.persistence
  }

  pub fn put(&self, image_id: &str, rows: &[RawRow]) -> Result<(), StoreError> {
    self.put_record(&RawRecord::new(image_id, rows.to_vec()))
  }

  pub fn put_record(&self, record: &RawRecord) -> Result<(), StoreError> {
    validate_key(&record.image_id)?;
    let bytes = serde_json::to_vec(record)?;
    self.persistence.write(&record.image_id, &bytes)?;
    debug!(
      "写入原始预测: {} ({} 行)",
      record.image_id,
      record.rows.len()
    );
    Ok(())
  }

  pub fn get(&self, image_id: &str) -> Result<RawRecord, StoreError> {
    validate_key(image_id)?;
    let bytes = self
      .persistence
      .read(image_id)?
      .ok_or_else(|| StoreError::NotFound(image_id.to_string()))?;
    let record: RawRecord = serde_json::from_slice(&bytes)?;
    debug!("读取原始预测: {} ({} 行)", image_id, record.rows.len());
    Ok(record)
  }

  pub fn contains(&self, image_id: &str) -> Result<bool, StoreError> {
    validate_key(image_id)?;
    Ok(self.persistence.read(image_id)?.is_some())
  }

  pub fn image_ids(&self) -> Result<Vec<String>, StoreError> {
    let mut ids = self.persistence.keys()?;
    ids.sort();
    Ok(ids)
  }

  /// 按给定顺序读取，任一缺失即返回 NotFound
  pub fn load(&self, image_ids: &[String]) -> Result<Vec<RawRecord>, StoreError> {
    image_ids.iter().map(|id| self.get(id)).collect()
  }

  /// 读取全部记录（按图像编号排序）
  pub fn load_all(&self) -> Result<Vec<RawRecord>, StoreError> {
    let ids = self.image_ids()?;
    info!("读取 {} 条已有原始预测", ids.len());
    self.load(&ids)
  }
}

impl FromUrl for RawStore<AnyPersistence> {
  type Error = StoreError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    Ok(RawStore::new(AnyPersistence::from_url(url)?))
  }
}

fn validate_key(image_id: &str) -> Result<(), StoreError> {
  let invalid = image_id.is_empty()
    || image_id == "."
    || image_id == ".."
    || image_id.contains(['/', '\\', '\0']);
  if invalid {
    return Err(StoreError::InvalidKey(image_id.to_string()));
  }
  Ok(())
}
