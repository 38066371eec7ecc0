//! 批次条件：边沿触发、计数、经过时间
//!
//! 文件记录器用条件决定何时开始、何时结束记录；实时显示用边沿触发门控采集。
//! 所有条件都是有状态的，`reset()` 恢复到初始状态。

use canpdo_protocol::Batch;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// 触发边沿
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Edge {
    /// `prev < threshold && current > threshold`
    #[default]
    Rising,
    /// `prev > threshold && current < threshold`
    Falling,
    /// 上升或下降
    Either,
    /// `current == threshold`
    Equal,
}

/// 对单个通道的边沿触发
///
/// 第一次检查只建立基线，永远不触发。恰好等于阈值不算穿越。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeTrigger {
    pub channel: String,
    #[serde(default)]
    pub edge: Edge,
    #[serde(default)]
    pub threshold: f64,
    #[serde(skip)]
    prev: Option<f64>,
    #[serde(skip)]
    fired: u64,
}

impl EdgeTrigger {
    pub fn new(channel: impl Into<String>, edge: Edge) -> Self {
        Self {
            channel: channel.into(),
            edge,
            threshold: 0.0,
            prev: None,
            fired: 0,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// 检查批次中的通道值，通道不存在时返回 `false`
    pub fn check(&mut self, batch: &Batch) -> bool {
        match batch.value(&self.channel) {
            Some(value) => self.check_value(value),
            None => {
                trace!("Trigger channel {} not in batch {}", self.channel, batch.index);
                false
            },
        }
    }

    /// 检查一个新值（每次调用都更新前值）
    pub fn check_value(&mut self, value: f64) -> bool {
        let Some(prev) = self.prev.replace(value) else {
            return false;
        };
        let threshold = self.threshold;
        let rising = prev < threshold && value > threshold;
        let falling = prev > threshold && value < threshold;
        let fired = match self.edge {
            Edge::Rising => rising,
            Edge::Falling => falling,
            Edge::Either => rising || falling,
            Edge::Equal => value == threshold,
        };
        if fired {
            self.fired += 1;
        }
        fired
    }

    /// 重新布防，可选地以给定值作为新基线
    pub fn rearm(&mut self, baseline: Option<f64>) {
        self.prev = baseline;
    }

    pub fn reset(&mut self) {
        self.prev = None;
        self.fired = 0;
    }

    /// 累计触发次数
    pub fn fire_count(&self) -> u64 {
        self.fired
    }
}

/// 第 `count` 次检查时触发（只触发一次）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountCondition {
    pub count: u64,
    #[serde(skip)]
    seen: u64,
}

impl CountCondition {
    pub fn new(count: u64) -> Self {
        Self { count, seen: 0 }
    }

    pub fn check(&mut self, _batch: &Batch) -> bool {
        self.seen = self.seen.saturating_add(1);
        self.seen == self.count
    }

    pub fn reset(&mut self) {
        self.seen = 0;
    }
}

/// 距第一次检查的批次时间达到 `seconds` 时触发
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElapsedCondition {
    pub seconds: f64,
    #[serde(skip)]
    baseline: Option<f64>,
}

impl ElapsedCondition {
    pub fn new(seconds: f64) -> Self {
        Self {
            seconds,
            baseline: None,
        }
    }

    pub fn check(&mut self, batch: &Batch) -> bool {
        let baseline = *self.baseline.get_or_insert(batch.time);
        batch.time - baseline >= self.seconds
    }

    pub fn reset(&mut self) {
        self.baseline = None;
    }
}

/// 记录器的开始/结束条件
///
/// TOML 中写作 `{ kind = "Count", count = 1000 }`、
/// `{ kind = "Edge", channel = "speed", edge = "Rising", threshold = 0.5 }` 等。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Condition {
    Edge(EdgeTrigger),
    Count(CountCondition),
    Elapsed(ElapsedCondition),
}

impl Condition {
    pub fn edge(channel: impl Into<String>, edge: Edge, threshold: f64) -> Self {
        Condition::Edge(EdgeTrigger::new(channel, edge).with_threshold(threshold))
    }

    pub fn count(count: u64) -> Self {
        Condition::Count(CountCondition::new(count))
    }

    pub fn elapsed(seconds: f64) -> Self {
        Condition::Elapsed(ElapsedCondition::new(seconds))
    }

    pub fn check(&mut self, batch: &Batch) -> bool {
        match self {
            Condition::Edge(c) => c.check(batch),
            Condition::Count(c) => c.check(batch),
            Condition::Elapsed(c) => c.check(batch),
        }
    }

    pub fn reset(&mut self) {
        match self {
            Condition::Edge(c) => c.reset(),
            Condition::Count(c) => c.reset(),
            Condition::Elapsed(c) => c.reset(),
        }
    }
}
