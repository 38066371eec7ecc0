//! PDO 格式定义
//!
//! `FrameFormat` 描述单个 PDO 标识符的负载布局，`Format` 描述一个总线周期内
//! 各 PDO 的到达顺序与采样率。二者在启动时构建一次，运行期间只读。

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, warn};

use crate::ProtocolError;
use crate::codec::Encoding;
use crate::params::params_from_file;

/// 每帧最多的通道槽位
pub const SLOTS_PER_FRAME: usize = 4;

/// 默认采样率（Hz）
pub const DEFAULT_SAMPLE_RATE_HZ: f64 = 1000.0;

/// PDO 发送分频基准：`rate = TX_DIVIDER_BASE / tx_divider`
pub const TX_DIVIDER_BASE: f64 = 10000.0;

/// 可配置的 PDO 编号范围（1..=4）
pub const MAX_PDO: u32 = 4;

/// PDO n 的 CAN ID
pub fn pdo_id(n: u32) -> u32 {
    n * 0x100 + 0x81
}

/// 单个 PDO 帧的格式
///
/// 每个实例拥有独立的增益/偏移数组（默认增益 1、偏移 0）。
/// 槽位的增益或偏移非默认时，解码值保存为 `raw_value`，
/// 输出值为 `(raw + offset) * gain`。
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FrameFormat {
    pub id: u32,
    pub encoding: Encoding,
    pub names: [String; SLOTS_PER_FRAME],
    pub gain: [f64; SLOTS_PER_FRAME],
    pub offset: [f64; SLOTS_PER_FRAME],
}

impl FrameFormat {
    /// 创建帧格式，通道名默认为 `"<十进制 id>_<槽位>"`
    pub fn new(id: u32, encoding: Encoding) -> Self {
        Self {
            id,
            encoding,
            names: std::array::from_fn(|slot| format!("{}_{}", id, slot)),
            gain: [1.0; SLOTS_PER_FRAME],
            offset: [0.0; SLOTS_PER_FRAME],
        }
    }

    /// 7Q8 编码帧
    pub fn fixed_point(id: u32) -> Self {
        Self::new(id, Encoding::FixedPoint7Q8)
    }

    /// 单精度编码帧
    pub fn single(id: u32) -> Self {
        Self::new(id, Encoding::Single)
    }

    /// 设置通道名（按槽位顺序，多余的忽略）
    pub fn with_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for (slot, name) in names.into_iter().take(SLOTS_PER_FRAME).enumerate() {
            self.names[slot] = name.into();
        }
        self
    }

    /// 设置某一槽位的增益和偏移
    pub fn with_calibration(mut self, slot: usize, gain: f64, offset: f64) -> Self {
        if slot < SLOTS_PER_FRAME {
            self.gain[slot] = gain;
            self.offset[slot] = offset;
        }
        self
    }

    /// 有效通道数量
    pub fn active_slots(&self) -> usize {
        self.encoding.slot_count()
    }

    /// 有效通道名
    pub fn active_names(&self) -> &[String] {
        &self.names[..self.active_slots()]
    }

    /// 槽位是否需要校准
    pub fn is_calibrated(&self, slot: usize) -> bool {
        slot < SLOTS_PER_FRAME && (self.gain[slot] != 1.0 || self.offset[slot] != 0.0)
    }

    /// 解码一帧负载，返回 `(value, raw_value)` 列表（仅有效槽位）
    pub fn decode(&self, data: &[u8; 8]) -> Vec<(f64, Option<f64>)> {
        (0..self.active_slots())
            .filter_map(|slot| {
                let raw = self.encoding.decode_slot(data, slot)?;
                if self.is_calibrated(slot) {
                    Some(((raw + self.offset[slot]) * self.gain[slot], Some(raw)))
                } else {
                    Some((raw, None))
                }
            })
            .collect()
    }
}

/// 一个总线周期的完整格式
///
/// `order` 的插入顺序即为总线上期望的帧顺序，每个 ID 只出现一次。
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Format {
    order: Vec<u32>,
    frames: HashMap<u32, FrameFormat>,
    sample_rate_hz: f64,
}

impl Default for Format {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_RATE_HZ)
    }
}

impl Format {
    /// 创建空格式
    pub fn new(sample_rate_hz: f64) -> Self {
        Self {
            order: Vec::new(),
            frames: HashMap::new(),
            sample_rate_hz,
        }
    }

    /// 追加一个帧格式（追加顺序即总线顺序）
    pub fn add(&mut self, frame: FrameFormat) -> Result<(), ProtocolError> {
        if self.frames.contains_key(&frame.id) {
            return Err(ProtocolError::DuplicateId { id: frame.id });
        }
        self.order.push(frame.id);
        self.frames.insert(frame.id, frame);
        Ok(())
    }

    /// 链式追加
    pub fn with_frame(mut self, frame: FrameFormat) -> Result<Self, ProtocolError> {
        self.add(frame)?;
        Ok(self)
    }

    /// 默认格式：0x181 单精度，0x281/0x381/0x481 为 7Q8，1000 Hz
    pub fn default_format() -> Self {
        let mut format = Self::new(DEFAULT_SAMPLE_RATE_HZ);
        format.order = (1..=MAX_PDO).map(pdo_id).collect();
        for &id in &format.order {
            let frame = if id == pdo_id(1) {
                FrameFormat::single(id)
            } else {
                FrameFormat::fixed_point(id)
            };
            format.frames.insert(id, frame);
        }
        format
    }

    /// 由键值对构建格式
    ///
    /// 识别的键：
    /// - `tx_divider`：采样率 = 10000 / divider
    /// - `<n>.transmit_type`：值为 `"255"` 时启用 PDO n（n = 1..=4）
    /// - `<n>.use_alt_encoding`：`"0"` 为单精度，其他值为 7Q8（缺省为 7Q8）
    /// - `<n>.channel_ptr_<k>`：第 k 个通道名（k 从 1 开始）
    ///
    /// 其他键忽略。没有启用任何 PDO 时返回 `NoPdoEnabled`。
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self, ProtocolError> {
        let mut format = Self::new(DEFAULT_SAMPLE_RATE_HZ);

        if let Some(divider) = params.get("tx_divider") {
            let parsed: f64 = divider.trim().parse().map_err(|_| ProtocolError::InvalidParam {
                key: "tx_divider".to_string(),
                value: divider.clone(),
            })?;
            format.sample_rate_hz = TX_DIVIDER_BASE / parsed;
        }

        for n in 1..=MAX_PDO {
            let enabled = params
                .get(&format!("{}.transmit_type", n))
                .is_some_and(|value| value.trim() == "255");
            if !enabled {
                continue;
            }

            let encoding = match params.get(&format!("{}.use_alt_encoding", n)) {
                Some(value) if value.trim() == "0" => Encoding::Single,
                _ => Encoding::FixedPoint7Q8,
            };

            let mut frame = FrameFormat::new(pdo_id(n), encoding);
            for slot in 0..encoding.slot_count() {
                if let Some(name) = params.get(&format!("{}.channel_ptr_{}", n, slot + 1)) {
                    frame.names[slot] = name.trim().to_string();
                }
            }
            debug!(
                "PDO{} enabled: id=0x{:X}, encoding={:?}, channels={:?}",
                n,
                frame.id,
                encoding,
                frame.active_names()
            );
            format.add(frame)?;
        }

        if format.order.is_empty() {
            return Err(ProtocolError::NoPdoEnabled);
        }
        format.validate()?;
        Ok(format)
    }

    /// 从 `key = value` 参数文件构建格式
    ///
    /// 文件缺失、无法读取、或没有可用 PDO 时，退回 [`Format::default_format`]。
    pub fn from_params_file(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let Some(params) = params_from_file(path) else {
            warn!(
                "Parameter file {} not readable, using default format",
                path.display()
            );
            return Self::default_format();
        };

        match Self::from_params(&params) {
            Ok(format) => format,
            Err(e) => {
                warn!(
                    "Parameter file {} unusable ({}), using default format",
                    path.display(),
                    e
                );
                Self::default_format()
            },
        }
    }

    /// 检查格式是否满足不变量
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.order.is_empty() {
            return Err(ProtocolError::EmptyFormat);
        }
        if !self.sample_rate_hz.is_finite() || self.sample_rate_hz <= 0.0 {
            return Err(ProtocolError::InvalidSampleRate {
                rate: self.sample_rate_hz,
            });
        }
        Ok(())
    }

    /// 总线周期顺序
    pub fn order(&self) -> &[u32] {
        &self.order
    }

    /// 按 ID 查找帧格式
    pub fn frame(&self, id: u32) -> Option<&FrameFormat> {
        self.frames.get(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.frames.contains_key(&id)
    }

    /// 采样率（Hz）
    pub fn sample_rate_hz(&self) -> f64 {
        self.sample_rate_hz
    }

    /// 周期内帧数量
    pub fn cycle_len(&self) -> usize {
        self.order.len()
    }

    /// 一个批次中的通道数量（各帧有效槽位之和）
    pub fn channel_count(&self) -> usize {
        self.frames_in_order().map(FrameFormat::active_slots).sum()
    }

    /// 按批次顺序列出通道名
    pub fn channel_names(&self) -> Vec<String> {
        self.frames_in_order()
            .flat_map(|frame| frame.active_names().iter().cloned())
            .collect()
    }

    /// 按周期顺序迭代帧格式
    pub fn frames_in_order(&self) -> impl Iterator<Item = &FrameFormat> {
        self.order.iter().filter_map(|id| self.frames.get(id))
    }
}
