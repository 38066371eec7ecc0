//! 虚拟 PDO 发生器
//!
//! 按 `Format` 的周期顺序生成 PDO 帧，以突发方式（默认每 10ms 一批）
//! 近似真实适配器的行为。每个槽位携带一个只依赖周期序号的已知波形，
//! 测试可以据此验证解码结果。

use crate::device::{FrameProducer, ProducerContext};
use crate::{CanError, PdoFrame};
use canpdo_protocol::{Encoding, Format, SLOTS_PER_FRAME};
use std::f64::consts::TAU;
use std::time::Duration;
use tracing::{debug, info};

/// 波形周期（以总线周期计）
pub const WAVEFORM_PERIOD: u64 = 1000;

/// 第 `frame_pos` 个帧、第 `slot` 个槽位在第 `cycle` 个总线周期的值
///
/// - 槽位 0：正弦
/// - 槽位 1：锯齿
/// - 槽位 2：方波
/// - 槽位 3：常数
///
/// 幅值随帧位置增大，所有值都在 7Q8 可表示范围内。
pub fn waveform(frame_pos: usize, slot: usize, cycle: u64) -> f64 {
    let phase = (cycle % WAVEFORM_PERIOD) as f64 / WAVEFORM_PERIOD as f64;
    let amplitude = (frame_pos + 1) as f64;
    match slot {
        0 => amplitude * (TAU * phase).sin(),
        1 => amplitude * phase * 10.0,
        2 => {
            if phase < 0.5 {
                amplitude
            } else {
                -amplitude
            }
        },
        _ => -(frame_pos as f64) - 0.25,
    }
}

/// 虚拟发生器配置
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, deny_unknown_fields))]
pub struct VirtualConfig {
    /// 每秒发送的帧数
    pub frame_rate: f64,
    /// 突发间隔
    pub burst_interval: Duration,
    /// 发送指定数量的总线周期后结束帧流（`None` 表示不限）
    pub max_cycles: Option<u64>,
    /// 不按节拍发送，队列积压到高水位时退避
    pub unpaced: bool,
}

impl Default for VirtualConfig {
    fn default() -> Self {
        Self {
            frame_rate: 4000.0,
            burst_interval: Duration::from_millis(10),
            max_cycles: None,
            unpaced: false,
        }
    }
}

impl VirtualConfig {
    /// 每次突发发送的帧数
    pub fn burst_frames(&self) -> usize {
        ((self.frame_rate * self.burst_interval.as_secs_f64()).round() as usize).max(1)
    }
}

pub struct VirtualProducer {
    format: Format,
    config: VirtualConfig,
    order_pos: usize,
    cycle: u64,
}

impl VirtualProducer {
    pub fn new(format: Format, config: VirtualConfig) -> Self {
        Self {
            format,
            config,
            order_pos: 0,
            cycle: 0,
        }
    }

    /// 默认格式（0x181..0x481）、默认节拍
    pub fn with_default_format() -> Self {
        Self::new(Format::default_format(), VirtualConfig::default())
    }

    /// 已完整发送的总线周期数
    pub fn cycles_sent(&self) -> u64 {
        self.cycle
    }

    fn finished(&self) -> bool {
        self.config
            .max_cycles
            .is_some_and(|max| self.cycle >= max)
    }

    /// 生成下一帧并推进位置
    fn next_frame(&mut self, timestamp: f64) -> PdoFrame {
        let order = self.format.order();
        let id = order[self.order_pos];
        let pos = self.order_pos;
        let cycle = self.cycle;

        let encoding = self
            .format
            .frame(id)
            .map(|frame| frame.encoding)
            .unwrap_or_default();
        let frame = match encoding {
            Encoding::FixedPoint7Q8 => {
                let values: [f64; SLOTS_PER_FRAME] =
                    std::array::from_fn(|slot| waveform(pos, slot, cycle));
                PdoFrame::from_7q8(id, values)
            },
            Encoding::Single => PdoFrame::from_single(
                id,
                [waveform(pos, 0, cycle) as f32, waveform(pos, 1, cycle) as f32],
            ),
        };

        self.order_pos += 1;
        if self.order_pos >= order.len() {
            self.order_pos = 0;
            self.cycle += 1;
        }
        frame.with_timestamp(timestamp)
    }
}

impl FrameProducer for VirtualProducer {
    fn run(&mut self, ctx: &ProducerContext) -> Result<(), CanError> {
        if self.format.order().is_empty() {
            info!("Virtual producer has no frames to send");
            return Ok(());
        }

        let mut burst = self.config.burst_frames();
        // 退避只在不按节拍发送时使用：保证一次突发不会越过队列容量
        let high_water = if self.config.unpaced {
            burst = burst.min(ctx.capacity() / 2).max(1);
            ctx.capacity() - burst
        } else {
            ctx.capacity()
        };

        info!(
            "Starting frame generation loop ({} frames/s, burst {}, unpaced: {})",
            self.config.frame_rate, burst, self.config.unpaced
        );

        let mut sent: u64 = 0;
        while ctx.is_running() {
            if self.config.unpaced {
                if !ctx.wait_below(high_water) {
                    break;
                }
            } else {
                let target = self.config.frame_rate * ctx.elapsed();
                if (sent as f64) > target {
                    spin_sleep::sleep(self.config.burst_interval);
                    continue;
                }
            }

            for _ in 0..burst {
                if self.finished() {
                    debug!("Virtual producer sent {} cycles, ending stream", self.cycle);
                    ctx.finish();
                    return Ok(());
                }
                let frame = self.next_frame(ctx.elapsed());
                ctx.push(frame)?;
                sent += 1;
            }
        }
        Ok(())
    }
}
