//! # canpdo Protocol
//!
//! CANopen PDO 数据协议定义（无硬件依赖、无线程）
//!
//! ## 模块
//!
//! - `codec`: 7Q8 定点数 / 单精度浮点编解码
//! - `format`: PDO 帧格式（`FrameFormat`）与总线周期格式（`Format`）
//! - `params`: 键值对配置解析（对象字典导出文件）
//! - `sample`: 解码后的数据点（`Sample`）与同一时刻的数据批次（`Batch`）
//!
//! ## 字节序
//!
//! PDO 负载使用 Intel (LSB) 低位在前（小端字节序）。

pub mod codec;
pub mod format;
pub mod params;
pub mod sample;

// 重新导出常用类型
pub use codec::{Encoding, decode_7q8, decode_single, encode_7q8, encode_single};
pub use format::{Format, FrameFormat, SLOTS_PER_FRAME};
pub use params::params_from_file;
pub use sample::{Batch, Sample};

use thiserror::Error;

/// CAN 2.0 标准帧（PDO 载体）
///
/// # 设计目的
///
/// `PdoFrame` 是适配层（硬件驱动/虚拟发生器）与解码层之间的中间抽象：
/// - **层次解耦**：解码器不依赖任何具体 CAN 驱动
/// - **Copy trait**：固定 8 字节，无堆分配，适合 4kHz 帧率
/// - **时间戳**：`timestamp` 为帧到达时间（秒），由适配器填写
///
/// # 示例
///
/// ```rust
/// use canpdo_protocol::PdoFrame;
///
/// let frame = PdoFrame::new(0x281, &[1, 2, 3, 4]).with_timestamp(0.25);
/// assert_eq!(frame.id(), 0x281);
/// assert_eq!(frame.data_slice(), &[1, 2, 3, 4]);
/// assert_eq!(frame.timestamp, 0.25);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PdoFrame {
    /// CAN ID
    pub id: u32,

    /// 帧数据（固定 8 字节，未使用部分为 0）
    pub data: [u8; 8],

    /// 有效数据长度 (0-8)
    pub len: u8,

    /// 帧到达时间（秒），0.0 表示不可用
    pub timestamp: f64,

    /// 是否为错误帧
    pub is_error: bool,
}

impl PdoFrame {
    /// 创建数据帧（超过 8 字节的部分被截断）
    pub fn new(id: u32, data: &[u8]) -> Self {
        let mut fixed_data = [0u8; 8];
        let len = data.len().min(8);
        fixed_data[..len].copy_from_slice(&data[..len]);

        Self {
            id,
            data: fixed_data,
            len: len as u8,
            timestamp: 0.0,
            is_error: false,
        }
    }

    /// 由 4 个 7Q8 定点值构建帧（每个 2 字节）
    pub fn from_7q8(id: u32, values: [f64; 4]) -> Self {
        let mut data = [0u8; 8];
        for (slot, value) in values.iter().enumerate() {
            data[slot * 2..slot * 2 + 2].copy_from_slice(&encode_7q8(*value));
        }
        Self::new(id, &data)
    }

    /// 由 2 个单精度值构建帧（每个 4 字节）
    pub fn from_single(id: u32, values: [f32; 2]) -> Self {
        let mut data = [0u8; 8];
        for (slot, value) in values.iter().enumerate() {
            data[slot * 4..slot * 4 + 4].copy_from_slice(&encode_single(*value));
        }
        Self::new(id, &data)
    }

    /// 设置到达时间戳
    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// 标记为错误帧
    pub fn with_error(mut self, is_error: bool) -> Self {
        self.is_error = is_error;
        self
    }

    /// 获取数据切片（只包含有效数据）
    pub fn data_slice(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// 获取 CAN ID
    pub fn id(&self) -> u32 {
        self.id
    }

    /// 获取完整数据（8字节固定数组）
    pub fn data(&self) -> &[u8; 8] {
        &self.data
    }
}

/// 协议层错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Format has no frames in its cycle order")]
    EmptyFormat,

    #[error("Duplicate frame id in format: 0x{id:X}")]
    DuplicateId { id: u32 },

    #[error("Invalid sample rate: {rate}")]
    InvalidSampleRate { rate: f64 },

    #[error("No PDO enabled in parameter set")]
    NoPdoEnabled,

    #[error("Invalid value for parameter {key}: {value}")]
    InvalidParam { key: String, value: String },
}

/// 小端字节序转 i16
pub fn bytes_to_i16_le(bytes: [u8; 2]) -> i16 {
    i16::from_le_bytes(bytes)
}

/// i16 转小端字节序
pub fn i16_to_bytes_le(value: i16) -> [u8; 2] {
    value.to_le_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_new_truncates_to_eight_bytes() {
        let frame = PdoFrame::new(0x181, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(frame.len, 8);
        assert_eq!(frame.data, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_frame_short_payload_is_zero_padded() {
        let frame = PdoFrame::new(0x181, &[0xAA]);
        assert_eq!(frame.len, 1);
        assert_eq!(frame.data(), &[0xAA, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(frame.data_slice(), &[0xAA]);
        assert!(!frame.is_error);
    }

    #[test]
    fn test_frame_from_7q8_layout() {
        let frame = PdoFrame::from_7q8(0x281, [1.0, -1.0, 0.5, 0.0]);
        // 1.0 * 256 = 0x0100, 小端
        assert_eq!(&frame.data[0..2], &[0x00, 0x01]);
        // -1.0 * 256 = -256 = 0xFF00
        assert_eq!(&frame.data[2..4], &[0x00, 0xFF]);
        assert_eq!(&frame.data[4..6], &[0x80, 0x00]);
        assert_eq!(frame.len, 8);
    }

    #[test]
    fn test_frame_from_single_layout() {
        let frame = PdoFrame::from_single(0x181, [1.5, -2.0]);
        assert_eq!(&frame.data[0..4], &1.5f32.to_le_bytes());
        assert_eq!(&frame.data[4..8], &(-2.0f32).to_le_bytes());
    }

    #[test]
    fn test_bytes_to_i16_le_negative() {
        assert_eq!(bytes_to_i16_le([0xFF, 0xFF]), -1);
        assert_eq!(bytes_to_i16_le([0x34, 0x12]), 0x1234);
    }

    #[test]
    fn test_i16_to_bytes_le() {
        assert_eq!(i16_to_bytes_le(0x1234), [0x34, 0x12]);
        assert_eq!(i16_to_bytes_le(-1), [0xFF, 0xFF]);
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::DuplicateId { id: 0x181 };
        assert_eq!(format!("{}", err), "Duplicate frame id in format: 0x181");
        assert_eq!(
            format!("{}", ProtocolError::EmptyFormat),
            "Format has no frames in its cycle order"
        );
    }
}
