//! 实时显示缓冲区
//!
//! 每个通道（外加 `"Time"`）一个定长环形缓冲，复制为三个存储槽：
//! 显示槽、收集槽、输出槽。显示线程通过 [`LiveBuffer::get_view`] 取走显示槽的拷贝。
//!
//! | 模式      | 追加到 | 何时交换显示/收集槽                    | `append` 返回 `true` |
//! |-----------|--------|----------------------------------------|----------------------|
//! | `Rolling` | 显示槽 | 从不                                   | 从不                 |
//! | `Redraw`  | 收集槽 | 收集槽写满时                           | 收集槽写满时         |
//! | `Sliding` | 显示槽 | 显示槽已满且已被取走后，下一次追加时   | 显示槽写满时         |
//!
//! `Sliding` 模式下显示槽已满但还没被取走时，新数据暂存到收集槽；
//! 收集槽也写满说明显示端跟不上，返回 [`SinkError::BufferOverflow`]。
//!
//! 追加、满检查、交换和输出拷贝都在同一把锁内完成。

use canpdo_driver::SinkError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// 时间通道名
pub const TIME_CHANNEL: &str = "Time";

/// 刷新方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DisplayMode {
    /// 连续滚动
    #[default]
    Rolling,
    /// 采满一屏再整体刷新
    Redraw,
    /// 边采边显示，显示端取走后换屏
    Sliding,
}

/// 一个存储槽：每个通道一个环形缓冲，最后一个是时间
#[derive(Debug, Clone)]
struct Slot {
    channels: Vec<VecDeque<f64>>,
}

impl Slot {
    fn new(width: usize, capacity: usize) -> Self {
        Self {
            channels: (0..width).map(|_| VecDeque::with_capacity(capacity)).collect(),
        }
    }

    fn push(&mut self, values: &[f64], capacity: usize) {
        for (channel, &value) in self.channels.iter_mut().zip(values) {
            if channel.len() == capacity {
                channel.pop_front();
            }
            channel.push_back(value);
        }
    }

    fn len(&self) -> usize {
        self.channels.first().map_or(0, VecDeque::len)
    }

    fn clear(&mut self) {
        self.channels.iter_mut().for_each(VecDeque::clear);
    }
}

struct Slots {
    /// 显示槽、收集槽（`live`/`collect` 在前两个之间交换）和输出槽
    slots: [Slot; 3],
    live: usize,
    collect: usize,
    updated: bool,
}

impl Slots {
    fn is_full(&self, slot: usize, capacity: usize) -> bool {
        self.slots[slot].len() >= capacity
    }

    fn swap(&mut self) {
        std::mem::swap(&mut self.live, &mut self.collect);
    }
}

/// 显示端拿到的快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveView {
    /// `(通道名, 数值序列)`，顺序与缓冲区通道一致
    pub channels: Vec<(String, Vec<f64>)>,
    pub time: Vec<f64>,
}

impl LiveView {
    pub fn get(&self, name: &str) -> Option<&[f64]> {
        if name == TIME_CHANNEL {
            return Some(&self.time);
        }
        self.channels
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, values)| values.as_slice())
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }
}

pub struct LiveBuffer {
    names: Vec<String>,
    capacity: usize,
    mode: DisplayMode,
    inner: Mutex<Slots>,
}

impl LiveBuffer {
    /// `names` 为显示的通道名（不含时间），`capacity` 为每个通道保留的点数
    pub fn new(names: Vec<String>, capacity: usize, mode: DisplayMode) -> Self {
        let capacity = capacity.max(1);
        let width = names.len() + 1;
        Self {
            names,
            capacity,
            mode,
            inner: Mutex::new(Slots {
                slots: std::array::from_fn(|_| Slot::new(width, capacity)),
                live: 0,
                collect: 1,
                updated: false,
            }),
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn mode(&self) -> DisplayMode {
        self.mode
    }

    /// 是否有尚未取走的新数据
    pub fn is_updated(&self) -> bool {
        self.inner.lock().updated
    }

    /// 追加一组值：`values` 与 [`LiveBuffer::names`] 一一对应，`time` 为时间
    ///
    /// 返回 `Ok(true)` 表示缓冲区"满"（含义见模块文档）。
    pub fn append(&self, values: &[f64], time: f64) -> Result<bool, SinkError> {
        if values.len() != self.names.len() {
            return Err(SinkError::ChannelMismatch {
                expected: self.names.len(),
                actual: values.len(),
            });
        }
        let row: Vec<f64> = values.iter().copied().chain(std::iter::once(time)).collect();
        let capacity = self.capacity;
        let mut inner = self.inner.lock();

        match self.mode {
            DisplayMode::Rolling => {
                let live = inner.live;
                inner.slots[live].push(&row, capacity);
                inner.updated = true;
                Ok(false)
            },
            DisplayMode::Redraw => {
                let collect = inner.collect;
                inner.slots[collect].push(&row, capacity);
                if !inner.is_full(collect, capacity) {
                    return Ok(false);
                }
                inner.updated = true;
                inner.swap();
                let collect = inner.collect;
                inner.slots[collect].clear();
                Ok(true)
            },
            DisplayMode::Sliding => {
                if inner.is_full(inner.live, capacity) {
                    if inner.updated {
                        // 显示槽还没被取走，暂存到收集槽
                        let collect = inner.collect;
                        inner.slots[collect].push(&row, capacity);
                        if inner.is_full(collect, capacity) {
                            return Err(SinkError::BufferOverflow { capacity });
                        }
                        return Ok(false);
                    }
                    inner.swap();
                    let collect = inner.collect;
                    inner.slots[collect].clear();
                }
                let live = inner.live;
                inner.slots[live].push(&row, capacity);
                inner.updated = true;
                Ok(inner.is_full(live, capacity))
            },
        }
    }

    /// 取走显示槽的拷贝并清除更新标志；没有新数据时返回 `None`
    pub fn get_view(&self) -> Option<LiveView> {
        let mut inner = self.inner.lock();
        if !inner.updated {
            return None;
        }
        inner.updated = false;

        let live = inner.live;
        let [first, second, out] = &mut inner.slots;
        out.clone_from(if live == 0 { first } else { second });

        let mut columns = out.channels.iter().map(|c| c.iter().copied().collect::<Vec<f64>>());
        let channels = self
            .names
            .iter()
            .cloned()
            .zip(columns.by_ref())
            .collect::<Vec<_>>();
        let time = columns.next().unwrap_or_default();
        Some(LiveView { channels, time })
    }

    /// 清空所有槽
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.slots.iter_mut().for_each(Slot::clear);
        inner.live = 0;
        inner.collect = 1;
        inner.updated = false;
    }
}
