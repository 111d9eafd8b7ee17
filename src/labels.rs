// 该文件是 Xibao （细胞计数） 项目的一部分。
// src/labels.rs - 类别名称映射
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
  borrow::Cow,
  collections::{BTreeMap, BTreeSet},
  path::{Path, PathBuf},
};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

/// 类别名称映射加载失败，属于启动配置错误
#[derive(Error, Debug)]
pub enum LabelError {
  #[error("无法读取类别文件 {path}: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("类别文件 JSON 格式错误: {0}")]
  Json(#[from] serde_json::Error),
  #[error("类别编号无效: {0}")]
  InvalidId(String),
  #[error("类别名称必须是字符串: {0}")]
  InvalidName(String),
  #[error("类别文件必须是对象或数组")]
  UnsupportedLayout,
}

/// 类别编号到显示名称的映射
///
/// 查询不到的编号返回编号本身的字符串，不会失败。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassNameMap {
  names: BTreeMap<u32, String>,
}

impl ClassNameMap {
  pub fn new() -> Self {
    Self::default()
  }

  /// 从名称列表构建，编号即列表下标
  pub fn from_labels<I, S>(labels: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    labels
      .into_iter()
      .enumerate()
      .map(|(id, name)| (id as u32, name.into()))
      .collect()
  }

  pub fn insert(&mut self, class_id: u32, name: impl Into<String>) {
    self.names.insert(class_id, name.into());
  }

  pub fn get(&self, class_id: u32) -> Option<&str> {
    self.names.get(&class_id).map(String::as_str)
  }

  pub fn name_of(&self, class_id: u32) -> Cow<'_, str> {
    match self.names.get(&class_id) {
      Some(name) => Cow::Borrowed(name),
      None => Cow::Owned(class_id.to_string()),
    }
  }

  /// 所有已知名称（去重、有序）
  pub fn known_names(&self) -> BTreeSet<&str> {
    self.names.values().map(String::as_str).collect()
  }

  pub fn len(&self) -> usize {
    self.names.len()
  }

  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }

  /// 从文件加载，`.json` 按 JSON 解析，其余按每行一个名称解析
  pub fn load(path: &Path) -> Result<Self, LabelError> {
    info!("加载类别文件: {}", path.display());
    let content = std::fs::read_to_string(path).map_err(|source| LabelError::Io {
      path: path.to_path_buf(),
      source,
    })?;

    let is_json = path
      .extension()
      .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let map = if is_json {
      Self::from_json_str(&content)?
    } else {
      Self::from_names_str(&content)
    };
    debug!("类别数量: {}", map.len());
    Ok(map)
  }

  /// 每行一个名称，行号即编号，空行跳过但占用编号
  pub fn from_names_str(content: &str) -> Self {
    content
      .lines()
      .enumerate()
      .filter_map(|(id, line)| {
        let name = line.trim();
        (!name.is_empty()).then(|| (id as u32, name.to_string()))
      })
      .collect()
  }

  /// 支持 `{"0": "live"}` 形式的对象和 `["live", "dead"]` 形式的数组
  pub fn from_json_str(content: &str) -> Result<Self, LabelError> {
    match serde_json::from_str::<Value>(content)? {
      Value::Object(entries) => {
        let mut map = ClassNameMap::new();
        for (key, value) in entries {
          let id = key
            .trim()
            .parse::<u32>()
            .map_err(|_| LabelError::InvalidId(key.clone()))?;
          let name = value
            .as_str()
            .ok_or_else(|| LabelError::InvalidName(value.to_string()))?;
          map.insert(id, name);
        }
        Ok(map)
      }
      Value::Array(values) => {
        let labels = values
          .iter()
          .map(|value| {
            value
              .as_str()
              .map(str::to_string)
              .ok_or_else(|| LabelError::InvalidName(value.to_string()))
          })
          .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_labels(labels))
      }
      _ => Err(LabelError::UnsupportedLayout),
    }
  }
}

impl FromIterator<(u32, String)> for ClassNameMap {
  fn from_iter<T: IntoIterator<Item = (u32, String)>>(iter: T) -> Self {
    ClassNameMap {
      names: iter.into_iter().collect(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn unknown_id_falls_back_to_number() {
    let map = ClassNameMap::from_labels(["live", "dead"]);
    assert_eq!(map.name_of(0), "live");
    assert_eq!(map.name_of(1), "dead");
    assert_eq!(map.name_of(7), "7");
    assert_eq!(map.get(7), None);
  }

  #[test]
  fn names_file_uses_line_index() {
    let map = ClassNameMap::from_names_str("Alive\r\n\nDead\nAggregate\n");
    assert_eq!(map.len(), 3);
    assert_eq!(map.name_of(0), "Alive");
    assert_eq!(map.name_of(1), "1");
    assert_eq!(map.name_of(2), "Dead");
    assert_eq!(map.name_of(3), "Aggregate");
  }

  #[test]
  fn json_object_and_array() {
    let map = ClassNameMap::from_json_str(r#"{"0": "live", "1": "dead"}"#).unwrap();
    assert_eq!(map.name_of(1), "dead");

    let map = ClassNameMap::from_json_str(r#"["live", "dead"]"#).unwrap();
    assert_eq!(map.name_of(0), "live");

    assert!(matches!(
      ClassNameMap::from_json_str(r#"{"x": "live"}"#),
      Err(LabelError::InvalidId(_))
    ));
    assert!(matches!(
      ClassNameMap::from_json_str(r#"[1, 2]"#),
      Err(LabelError::InvalidName(_))
    ));
    assert!(matches!(
      ClassNameMap::from_json_str("3"),
      Err(LabelError::UnsupportedLayout)
    ));
  }

  #[test]
  fn load_from_file() {
    let dir = std::env::temp_dir().join(format!("xibao-labels-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();

    let names = dir.join("cells.names");
    std::fs::write(&names, "Alive\nDead\n").unwrap();
    assert_eq!(ClassNameMap::load(&names).unwrap().name_of(1), "Dead");

    let json = dir.join("cells.json");
    std::fs::write(&json, r#"{"0": "live"}"#).unwrap();
    assert_eq!(ClassNameMap::load(&json).unwrap().name_of(0), "live");

    assert!(matches!(
      ClassNameMap::load(&dir.join("missing.names")),
      Err(LabelError::Io { .. })
    ));

    std::fs::remove_dir_all(&dir).unwrap();
  }

  #[test]
  fn known_names_are_deduplicated() {
    let map = ClassNameMap::from_labels(["live", "dead", "live"]);
    assert_eq!(map.known_names().into_iter().collect::<Vec<_>>(), ["dead", "live"]);
  }
}
