//! 帧率统计
//!
//! 生产者每推入一帧调用 [`FrameRateStats::record`]（单个原子自增），
//! 后台检查任务周期性调用 [`FrameRateStats::sample`] 计算瞬时帧率和全程平均帧率。
//! 统计只用于观测，延迟或跳过采样不影响正确性。

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// 一次帧率采样结果
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FrameRate {
    /// 距上次采样的帧率（帧/秒）
    pub instant: f64,
    /// 自第一帧以来的平均帧率（帧/秒）
    pub average: f64,
    /// 累计帧数
    pub total: u64,
}

#[derive(Debug)]
struct SampleWindow {
    first_frame: Option<Instant>,
    last_check: Option<(Instant, u64)>,
}

#[derive(Debug)]
pub struct FrameRateStats {
    frames: AtomicU64,
    window: Mutex<SampleWindow>,
}

impl Default for FrameRateStats {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameRateStats {
    pub fn new() -> Self {
        Self {
            frames: AtomicU64::new(0),
            window: Mutex::new(SampleWindow {
                first_frame: None,
                last_check: None,
            }),
        }
    }

    /// 记录一帧
    #[inline]
    pub fn record(&self) {
        if self.frames.fetch_add(1, Ordering::Relaxed) == 0 {
            self.window.lock().first_frame.get_or_insert_with(Instant::now);
        }
    }

    /// 累计帧数
    pub fn total(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// 采样帧率
    ///
    /// 第一次调用只建立基准，`instant` 为 0。
    pub fn sample(&self) -> FrameRate {
        self.sample_at(Instant::now())
    }

    fn sample_at(&self, now: Instant) -> FrameRate {
        let total = self.total();
        let mut window = self.window.lock();

        let instant = match window.last_check {
            Some((at, count)) => {
                let elapsed = now.saturating_duration_since(at).as_secs_f64();
                if elapsed > 0.0 {
                    total.saturating_sub(count) as f64 / elapsed
                } else {
                    0.0
                }
            },
            None => 0.0,
        };

        let average = match window.first_frame {
            Some(first) => {
                let elapsed = now.saturating_duration_since(first).as_secs_f64();
                if elapsed > 0.0 { total as f64 / elapsed } else { 0.0 }
            },
            None => 0.0,
        };

        window.last_check = Some((now, total));
        FrameRate {
            instant,
            average,
            total,
        }
    }
}
