//! 流水线运行指标
//!
//! 所有计数器都是 `Relaxed` 原子量，只用于观测，不参与同步。

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PipelineMetrics {
    /// 从帧来源收到的帧
    pub frames_seen: AtomicU64,
    /// 不属于格式的帧（或错误帧）
    pub frames_ignored: AtomicU64,
    /// 预热阶段丢弃的帧
    pub warmup_discarded: AtomicU64,
    /// 组装出的批次
    pub batches_produced: AtomicU64,
    /// 已分发到 sink 的批次
    pub batches_routed: AtomicU64,
    /// sink 拒收（背压）次数
    pub sink_drops: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_seen: self.frames_seen.load(Ordering::Relaxed),
            frames_ignored: self.frames_ignored.load(Ordering::Relaxed),
            warmup_discarded: self.warmup_discarded.load(Ordering::Relaxed),
            batches_produced: self.batches_produced.load(Ordering::Relaxed),
            batches_routed: self.batches_routed.load(Ordering::Relaxed),
            sink_drops: self.sink_drops.load(Ordering::Relaxed),
        }
    }
}

/// 指标快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MetricsSnapshot {
    pub frames_seen: u64,
    pub frames_ignored: u64,
    pub warmup_discarded: u64,
    pub batches_produced: u64,
    pub batches_routed: u64,
    pub sink_drops: u64,
}
