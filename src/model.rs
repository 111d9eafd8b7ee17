// 该文件是 Xibao （细胞计数） 项目的一部分。
// src/model.rs - 模型
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

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 模型调用失败
///
/// 推理失败必须作为独立的错误上报，不能被当作“零检测”处理。
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
  #[error("图像数据无效: {0}")]
  InvalidImage(String),
  #[error("模型推理失败: {0}")]
  Failed(String),
}

/// 目标检测模型
///
/// 输入为原始图像字节，图像解码由模型适配器自行负责。
pub trait Model {
  fn infer(&self, image: &[u8]) -> Result<DetectResult, InferenceError>;
}

/// 分割模型
pub trait SegmentModel {
  fn infer(&self, image: &[u8]) -> Result<Mask, InferenceError>;
}

/// 模型输出的候选框，尚未经过校验
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectItem {
  pub class_id: u32,
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectResult {
  pub items: Box<[DetectItem]>,
}

impl DetectResult {
  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }
}

impl From<Vec<DetectItem>> for DetectResult {
  fn from(items: Vec<DetectItem>) -> Self {
    DetectResult {
      items: items.into_boxed_slice(),
    }
  }
}

/// 单通道分割掩码，非零像素为前景
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
  width: u32,
  height: u32,
  data: Box<[u8]>,
}

impl Mask {
  pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self, InferenceError> {
    let expected = width as usize * height as usize;
    if data.len() != expected {
      return Err(InferenceError::Failed(format!(
        "掩码大小不匹配: 期望 {}x{}={}, 实际 {}",
        width,
        height,
        expected,
        data.len()
      )));
    }

    Ok(Mask {
      width,
      height,
      data: data.into_boxed_slice(),
    })
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.data
  }

  pub fn foreground_pixels(&self) -> usize {
    self.data.iter().filter(|&&v| v != 0).count()
  }

  /// 前景像素占比（百分比，保留两位小数），空掩码返回 0
  pub fn coverage_percentage(&self) -> f64 {
    if self.data.is_empty() {
      return 0.0;
    }
    let ratio = self.foreground_pixels() as f64 / self.data.len() as f64 * 100.0;
    (ratio * 100.0).round() / 100.0
  }
}
