//! PDO 负载编解码
//!
//! 总线上只有两种数值编码：
//! - **7Q8**：16 位有符号定点数，8 位小数（原始整数 / 256），每帧 4 个槽位
//! - **Single**：IEEE754 单精度浮点，每帧 2 个槽位（第 2、3 槽位忽略）
//!
//! 所有函数均为纯函数，无状态。

use crate::{bytes_to_i16_le, i16_to_bytes_le};

/// 7Q8 定点数的缩放因子
pub const FIXED_POINT_SCALE: f64 = 256.0;

/// 槽位编码方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Encoding {
    /// 4 × 2 字节 7Q8 定点数
    #[default]
    FixedPoint7Q8,
    /// 2 × 4 字节单精度浮点
    Single,
}

impl Encoding {
    /// 有效槽位数量
    pub fn slot_count(self) -> usize {
        match self {
            Encoding::FixedPoint7Q8 => 4,
            Encoding::Single => 2,
        }
    }

    /// 每个槽位的字节宽度
    pub fn slot_width(self) -> usize {
        match self {
            Encoding::FixedPoint7Q8 => 2,
            Encoding::Single => 4,
        }
    }

    /// 解码某一槽位
    ///
    /// 超出有效槽位（Single 的 2、3 号）返回 `None`。
    pub fn decode_slot(self, data: &[u8; 8], slot: usize) -> Option<f64> {
        if slot >= self.slot_count() {
            return None;
        }
        let start = slot * self.slot_width();
        match self {
            Encoding::FixedPoint7Q8 => Some(decode_7q8([data[start], data[start + 1]])),
            Encoding::Single => Some(f64::from(decode_single([
                data[start],
                data[start + 1],
                data[start + 2],
                data[start + 3],
            ]))),
        }
    }
}

/// 解码 7Q8 定点数（小端）
///
/// ```rust
/// use canpdo_protocol::decode_7q8;
///
/// assert_eq!(decode_7q8([0x80, 0x01]), 1.5);
/// assert_eq!(decode_7q8([0x00, 0xFF]), -1.0);
/// ```
pub fn decode_7q8(bytes: [u8; 2]) -> f64 {
    f64::from(bytes_to_i16_le(bytes)) / FIXED_POINT_SCALE
}

/// 编码 7Q8 定点数（小端）
///
/// 四舍五入到最近的 1/256，超出 i16 范围时饱和，NaN 编码为 0。
pub fn encode_7q8(value: f64) -> [u8; 2] {
    // `as` 对浮点转整数是饱和转换，NaN 得到 0
    let raw = (value * FIXED_POINT_SCALE).round() as i16;
    i16_to_bytes_le(raw)
}

/// 解码单精度浮点（小端）
pub fn decode_single(bytes: [u8; 4]) -> f32 {
    f32::from_le_bytes(bytes)
}

/// 编码单精度浮点（小端）
pub fn encode_single(value: f32) -> [u8; 4] {
    value.to_le_bytes()
}
