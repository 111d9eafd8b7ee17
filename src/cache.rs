// 该文件是 Xibao （细胞计数） 项目的一部分。
// src/cache.rs - 推理结果缓存
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
  collections::{BTreeMap, HashMap},
  fmt,
  sync::{
    Arc, Mutex, MutexGuard, OnceLock, PoisonError,
    atomic::{AtomicI64, AtomicU64, Ordering},
  },
};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::debug;

pub const DEFAULT_CACHE_CAPACITY: usize = 32;
pub const DEFAULT_WINDOW_SECONDS: u64 = 5;

/// 输入字节的 SHA-256 指纹
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
  pub fn of(bytes: &[u8]) -> Self {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();

    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Fingerprint(out)
  }

  pub fn as_bytes(&self) -> &[u8; 32] {
    &self.0
  }
}

impl fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for byte in self.0 {
      write!(f, "{:02x}", byte)?;
    }
    Ok(())
  }
}

impl fmt::Debug for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Fingerprint({})", self)
  }
}

/// 时间来源（秒级 Unix 时间戳）
pub trait Clock: Send + Sync {
  fn now_seconds(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now_seconds(&self) -> i64 {
    Utc::now().timestamp()
  }
}

/// 手动推进的时钟
#[derive(Debug, Default)]
pub struct ManualClock {
  now: AtomicI64,
}

impl ManualClock {
  pub fn new(now: i64) -> Self {
    ManualClock {
      now: AtomicI64::new(now),
    }
  }

  pub fn set(&self, now: i64) {
    self.now.store(now, Ordering::SeqCst);
  }

  pub fn advance(&self, seconds: i64) {
    self.now.fetch_add(seconds, Ordering::SeqCst);
  }
}

impl Clock for ManualClock {
  fn now_seconds(&self) -> i64 {
    self.now.load(Ordering::SeqCst)
  }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
  fn now_seconds(&self) -> i64 {
    (**self).now_seconds()
  }
}

/// 缓存时间窗口，time_bucket = floor(now / seconds)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
  seconds: u64,
}

impl TimeWindow {
  pub fn new(seconds: u64) -> Self {
    TimeWindow {
      seconds: seconds.max(1),
    }
  }

  pub fn seconds(&self) -> u64 {
    self.seconds
  }

  pub fn bucket(&self, now_seconds: i64) -> u64 {
    now_seconds.max(0) as u64 / self.seconds
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
  pub capacity: usize,
  pub window_seconds: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    CacheConfig {
      capacity: DEFAULT_CACHE_CAPACITY,
      window_seconds: DEFAULT_WINDOW_SECONDS,
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
  pub hits: u64,
  pub misses: u64,
  /// 因容量淘汰
  pub evictions: u64,
  /// 因时间窗口推进而失效
  pub expired: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CacheKey {
  fingerprint: Fingerprint,
  bucket: u64,
}

struct CacheCell<R> {
  value: OnceLock<R>,
  // 同一键同一时刻只允许一个计算
  gate: Mutex<()>,
}

impl<R> CacheCell<R> {
  fn new() -> Self {
    CacheCell {
      value: OnceLock::new(),
      gate: Mutex::new(()),
    }
  }
}

struct Slot<R> {
  cell: Arc<CacheCell<R>>,
  last_used: u64,
}

struct CacheInner<R> {
  entries: HashMap<CacheKey, Slot<R>>,
  recency: BTreeMap<u64, CacheKey>,
  tick: u64,
}

impl<R> CacheInner<R> {
  fn new() -> Self {
    CacheInner {
      entries: HashMap::new(),
      recency: BTreeMap::new(),
      tick: 0,
    }
  }

  fn next_tick(&mut self) -> u64 {
    self.tick += 1;
    self.tick
  }

  fn touch(&mut self, key: CacheKey) -> Option<Arc<CacheCell<R>>> {
    let tick = self.next_tick();
    let slot = self.entries.get_mut(&key)?;
    self.recency.remove(&slot.last_used);
    slot.last_used = tick;
    self.recency.insert(tick, key);
    Some(slot.cell.clone())
  }

  fn insert(&mut self, key: CacheKey, cell: Arc<CacheCell<R>>) {
    let tick = self.next_tick();
    self.entries.insert(
      key,
      Slot {
        cell,
        last_used: tick,
      },
    );
    self.recency.insert(tick, key);
  }

  fn remove(&mut self, key: &CacheKey) -> Option<Slot<R>> {
    let slot = self.entries.remove(key)?;
    self.recency.remove(&slot.last_used);
    Some(slot)
  }

  fn pop_least_recent(&mut self) -> Option<CacheKey> {
    let (_, key) = self.recency.pop_first()?;
    self.entries.remove(&key);
    Some(key)
  }

  fn expire_before(&mut self, bucket: u64) -> usize {
    let stale: Vec<CacheKey> = self
      .entries
      .keys()
      .filter(|key| key.bucket < bucket)
      .copied()
      .collect();
    for key in &stale {
      self.remove(key);
    }
    stale.len()
  }
}

/// 按 (内容指纹, 时间窗口) 记忆计算结果的 LRU 缓存
///
/// 锁只保护缓存结构本身，计算过程不持有该锁。同一个键的并发调用者
/// 会等待正在进行的计算，计算失败的结果不会被缓存。
pub struct PredictionCache<R> {
  window: TimeWindow,
  capacity: usize,
  clock: Box<dyn Clock>,
  inner: Mutex<CacheInner<R>>,
  hits: AtomicU64,
  misses: AtomicU64,
  evictions: AtomicU64,
  expired: AtomicU64,
}

impl<R: Clone> PredictionCache<R> {
  pub fn new(config: CacheConfig) -> Self {
    Self::with_clock(config, SystemClock)
  }

  pub fn with_clock(config: CacheConfig, clock: impl Clock + 'static) -> Self {
    PredictionCache {
      window: TimeWindow::new(config.window_seconds),
      capacity: config.capacity.max(1),
      clock: Box::new(clock),
      inner: Mutex::new(CacheInner::new()),
      hits: AtomicU64::new(0),
      misses: AtomicU64::new(0),
      evictions: AtomicU64::new(0),
      expired: AtomicU64::new(0),
    }
  }

  pub fn window(&self) -> TimeWindow {
    self.window
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// 当前时间所在的窗口
  pub fn time_bucket(&self) -> u64 {
    self.window.bucket(self.clock.now_seconds())
  }

  pub fn get_or_compute<E, F>(&self, fingerprint: Fingerprint, time_bucket: u64, compute: F) -> Result<R, E>
  where
    F: FnOnce() -> Result<R, E>,
  {
    let key = CacheKey {
      fingerprint,
      bucket: time_bucket,
    };
    let cell = self.slot(key);

    if let Some(value) = cell.value.get() {
      return Ok(self.hit(&key, value));
    }

    let _gate = cell.gate.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(value) = cell.value.get() {
      return Ok(self.hit(&key, value));
    }

    self.misses.fetch_add(1, Ordering::Relaxed);
    debug!("缓存未命中: {} @ {}", key.fingerprint, key.bucket);
    match compute() {
      Ok(value) => {
        let _ = cell.value.set(value.clone());
        Ok(value)
      }
      Err(e) => {
        self.discard(&key, &cell);
        Err(e)
      }
    }
  }

  /// 以输入字节指纹和当前时间窗口为键
  pub fn get_or_compute_now<E, F>(&self, input: &[u8], compute: F) -> Result<R, E>
  where
    F: FnOnce() -> Result<R, E>,
  {
    self.get_or_compute(Fingerprint::of(input), self.time_bucket(), compute)
  }

  /// 查询已完成的缓存项，不触发计算
  pub fn peek(&self, fingerprint: Fingerprint, time_bucket: u64) -> Option<R> {
    let key = CacheKey {
      fingerprint,
      bucket: time_bucket,
    };
    let inner = self.lock();
    inner
      .entries
      .get(&key)
      .and_then(|slot| slot.cell.value.get().cloned())
  }

  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn clear(&self) {
    let mut inner = self.lock();
    inner.entries.clear();
    inner.recency.clear();
  }

  pub fn stats(&self) -> CacheStats {
    CacheStats {
      hits: self.hits.load(Ordering::Relaxed),
      misses: self.misses.load(Ordering::Relaxed),
      evictions: self.evictions.load(Ordering::Relaxed),
      expired: self.expired.load(Ordering::Relaxed),
    }
  }

  fn hit(&self, key: &CacheKey, value: &R) -> R {
    self.hits.fetch_add(1, Ordering::Relaxed);
    debug!("缓存命中: {} @ {}", key.fingerprint, key.bucket);
    value.clone()
  }

  fn lock(&self) -> MutexGuard<'_, CacheInner<R>> {
    // 结构修改过程中不会发生 panic，中毒后可以继续使用
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn slot(&self, key: CacheKey) -> Arc<CacheCell<R>> {
    let mut inner = self.lock();

    let expired = inner.expire_before(key.bucket);
    if expired > 0 {
      self.expired.fetch_add(expired as u64, Ordering::Relaxed);
      debug!("时间窗口推进，清除 {} 个过期缓存项", expired);
    }

    if let Some(cell) = inner.touch(key) {
      return cell;
    }

    let cell = Arc::new(CacheCell::new());
    inner.insert(key, cell.clone());
    while inner.entries.len() > self.capacity {
      match inner.pop_least_recent() {
        Some(evicted) => {
          self.evictions.fetch_add(1, Ordering::Relaxed);
          debug!("缓存已满，淘汰: {} @ {}", evicted.fingerprint, evicted.bucket);
        }
        None => break,
      }
    }
    cell
  }

  fn discard(&self, key: &CacheKey, cell: &Arc<CacheCell<R>>) {
    let mut inner = self.lock();
    let same = inner
      .entries
      .get(key)
      .is_some_and(|slot| Arc::ptr_eq(&slot.cell, cell));
    if same {
      inner.remove(key);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::{
    sync::{Barrier, atomic::AtomicUsize},
    thread,
    time::Duration,
  };

  fn cache(capacity: usize) -> (PredictionCache<usize>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_000));
    let config = CacheConfig {
      capacity,
      window_seconds: 5,
    };
    (PredictionCache::with_clock(config, clock.clone()), clock)
  }

  fn counted(counter: &AtomicUsize, value: usize) -> impl FnOnce() -> Result<usize, ()> + '_ {
    move || {
      counter.fetch_add(1, Ordering::SeqCst);
      Ok(value)
    }
  }

  #[test]
  fn fingerprint_is_stable() {
    let a = Fingerprint::of(b"image bytes");
    let b = Fingerprint::of(b"image bytes");
    assert_eq!(a, b);
    assert_ne!(a, Fingerprint::of(b"other bytes"));
    assert_eq!(
      Fingerprint::of(b"").to_string(),
      "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
  }

  #[test]
  fn time_bucket_floor() {
    let window = TimeWindow::new(5);
    assert_eq!(window.bucket(0), 0);
    assert_eq!(window.bucket(4), 0);
    assert_eq!(window.bucket(5), 1);
    assert_eq!(window.bucket(-3), 0);
    assert_eq!(TimeWindow::new(0).seconds(), 1);
  }

  #[test]
  fn reuses_result_within_window() {
    let (cache, clock) = cache(4);
    let counter = AtomicUsize::new(0);

    assert_eq!(cache.get_or_compute_now(b"img", counted(&counter, 1)), Ok(1));
    assert_eq!(cache.get_or_compute_now(b"img", counted(&counter, 2)), Ok(1));
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    clock.advance(5);
    assert_eq!(cache.get_or_compute_now(b"img", counted(&counter, 3)), Ok(3));
    assert_eq!(counter.load(Ordering::SeqCst), 2);

    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 2);
    assert_eq!(stats.expired, 1);
    assert_eq!(cache.len(), 1);
  }

  #[test]
  fn evicts_least_recently_used() {
    let (cache, _clock) = cache(2);
    let counter = AtomicUsize::new(0);
    let bucket = cache.time_bucket();
    let (a, b, c) = (
      Fingerprint::of(b"a"),
      Fingerprint::of(b"b"),
      Fingerprint::of(b"c"),
    );

    cache.get_or_compute(a, bucket, counted(&counter, 1)).unwrap();
    cache.get_or_compute(b, bucket, counted(&counter, 2)).unwrap();
    // 访问 a，使 b 成为最久未使用
    cache.get_or_compute(a, bucket, counted(&counter, 9)).unwrap();
    cache.get_or_compute(c, bucket, counted(&counter, 3)).unwrap();

    assert_eq!(cache.len(), 2);
    assert_eq!(cache.peek(a, bucket), Some(1));
    assert_eq!(cache.peek(b, bucket), None);
    assert_eq!(cache.peek(c, bucket), Some(3));
    assert_eq!(cache.stats().evictions, 1);
    assert_eq!(counter.load(Ordering::SeqCst), 3);
  }

  #[test]
  fn errors_are_not_cached() {
    let (cache, _clock) = cache(4);
    let first: Result<usize, &str> = cache.get_or_compute_now(b"img", || Err("boom"));
    assert_eq!(first, Err("boom"));
    assert!(cache.is_empty());

    let second: Result<usize, &str> = cache.get_or_compute_now(b"img", || Ok(7));
    assert_eq!(second, Ok(7));
  }

  #[test]
  fn concurrent_callers_share_one_computation() {
    let (cache, _clock) = cache(4);
    let cache = Arc::new(cache);
    let counter = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
      .map(|_| {
        let cache = cache.clone();
        let counter = counter.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
          barrier.wait();
          cache.get_or_compute_now(b"same image", || -> Result<usize, ()> {
            counter.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(50));
            Ok(42)
          })
        })
      })
      .collect();

    for handle in handles {
      assert_eq!(handle.join().unwrap(), Ok(42));
    }
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stats().misses, 1);
    assert_eq!(cache.stats().hits, 7);
  }

  #[test]
  fn clear_drops_everything() {
    let (cache, _clock) = cache(4);
    let counter = AtomicUsize::new(0);
    cache.get_or_compute_now(b"img", counted(&counter, 1)).unwrap();
    cache.clear();
    assert!(cache.is_empty());
    cache.get_or_compute_now(b"img", counted(&counter, 1)).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 2);
  }
}
