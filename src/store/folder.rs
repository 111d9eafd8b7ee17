// 该文件是 Xibao （细胞计数） 项目的一部分。
// src/store/folder.rs - 目录存储
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

use std::{io::ErrorKind, path::PathBuf};

use tracing::debug;

use crate::{
  FromUrl, FromUrlWithScheme,
  store::{Persistence, StoreError},
};

const RAW_SUFFIX: &str = "_raw.json";
const TEMP_SUFFIX: &str = ".tmp";

/// 每张图像一个 `<image_id>_raw.json` 文件
#[derive(Debug, Clone)]
pub struct FolderPersistence {
  directory: PathBuf,
}

impl FolderPersistence {
  pub fn new(directory: impl Into<PathBuf>) -> Self {
    FolderPersistence {
      directory: directory.into(),
    }
  }

  pub fn directory(&self) -> &PathBuf {
    &self.directory
  }

  fn path_of(&self, key: &str) -> PathBuf {
    self.directory.join(format!("{}{}", key, RAW_SUFFIX))
  }
}

impl FromUrlWithScheme for FolderPersistence {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for FolderPersistence {
  type Error = StoreError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(StoreError::SchemeMismatch(url.scheme().to_string()));
    }
    Ok(FolderPersistence::new(url.path()))
  }
}

impl Persistence for FolderPersistence {
  fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
    if !self.directory.exists() {
      std::fs::create_dir_all(&self.directory)?;
    }

    // 先写临时文件再重命名，读取方不会看到写了一半的文件
    let path = self.path_of(key);
    let temp = path.with_file_name(format!("{}{}{}", key, RAW_SUFFIX, TEMP_SUFFIX));
    std::fs::write(&temp, bytes)?;
    std::fs::rename(&temp, &path)?;
    debug!("保存文件: {}", path.display());
    Ok(())
  }

  fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
    match std::fs::read(self.path_of(key)) {
      Ok(bytes) => Ok(Some(bytes)),
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
      Err(e) => Err(e.into()),
    }
  }

  fn keys(&self) -> Result<Vec<String>, StoreError> {
    let entries = match std::fs::read_dir(&self.directory) {
      Ok(entries) => entries,
      Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(e.into()),
    };

    let mut keys = Vec::new();
    for entry in entries {
      let entry = entry?;
      if !entry.file_type()?.is_file() {
        continue;
      }
      let name = entry.file_name();
      if let Some(key) = name.to_str().and_then(|n| n.strip_suffix(RAW_SUFFIX)) {
        keys.push(key.to_string());
      }
    }
    keys.sort();
    Ok(keys)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::{AnyPersistence, RawStore};

  fn temp_dir(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("xibao-{}-{}", name, std::process::id()))
  }

  #[test]
  fn round_trip_through_directory() {
    let dir = temp_dir("folder-store");
    let _ = std::fs::remove_dir_all(&dir);

    let store = RawStore::new(FolderPersistence::new(&dir));
    assert!(store.image_ids().unwrap().is_empty());

    store.put("b.tif", &[[0.0, 0.0, 4.0, 4.0, 0.7, 1.0]]).unwrap();
    store.put("a.tif", &[]).unwrap();
    assert!(dir.join("b.tif_raw.json").exists());
    assert!(!dir.join("b.tif_raw.json.tmp").exists());

    // 无关文件不影响读取
    std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

    assert_eq!(store.image_ids().unwrap(), ["a.tif", "b.tif"]);
    assert_eq!(store.get("b.tif").unwrap().rows[0][4], 0.7);
    assert!(matches!(store.get("c.tif"), Err(StoreError::NotFound(_))));

    std::fs::remove_dir_all(&dir).unwrap();
  }

  #[test]
  fn unreadable_records_surface_io_and_serde_errors() {
    let dir = temp_dir("folder-errors");
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(dir.join("dir.tif_raw.json")).unwrap();
    std::fs::write(dir.join("bad.tif_raw.json"), "not json").unwrap();

    let store = RawStore::new(FolderPersistence::new(&dir));
    assert!(matches!(store.get("dir.tif"), Err(StoreError::Io(_))));
    assert!(matches!(store.get("bad.tif"), Err(StoreError::Serde(_))));

    std::fs::remove_dir_all(&dir).unwrap();
  }

  #[test]
  fn folder_url() {
    let url = url::Url::parse("folder:///tmp/xibao-store").unwrap();
    let store = RawStore::<AnyPersistence>::from_url(&url).unwrap();
    assert!(matches!(
      store.persistence(),
      AnyPersistence::Folder(p) if p.directory() == &PathBuf::from("/tmp/xibao-store")
    ));

    let file_url = url::Url::parse("file:///tmp").unwrap();
    assert!(matches!(
      FolderPersistence::from_url(&file_url),
      Err(StoreError::SchemeMismatch(_))
    ));
  }
}
