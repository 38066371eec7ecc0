//! 帧回放
//!
//! 按顺序推入一组固定的帧，然后保持空闲直到设备被停止。
//! 用于脚本化测试和回放抓取到的总线流量。

use crate::device::{FrameProducer, ProducerContext};
use crate::{CanError, PdoFrame};
use tracing::debug;

pub struct ReplayProducer {
    frames: Vec<PdoFrame>,
    /// 推入前等待队列积压降到此水位以下（`None` 表示直接推入）
    high_water: Option<usize>,
}

impl ReplayProducer {
    /// 直接推入：帧数超过队列容量会触发溢出
    pub fn new(frames: Vec<PdoFrame>) -> Self {
        Self {
            frames,
            high_water: None,
        }
    }

    /// 在队列积压达到高水位时退避，适合长序列
    pub fn throttled(frames: Vec<PdoFrame>) -> Self {
        Self {
            frames,
            high_water: Some(usize::MAX),
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl FrameProducer for ReplayProducer {
    fn run(&mut self, ctx: &ProducerContext) -> Result<(), CanError> {
        // 高水位最多为容量，保证退避后至少能推入一帧
        let high_water = self.high_water.map(|mark| mark.min(ctx.capacity()));
        let mut pushed = 0usize;
        for frame in self.frames.drain(..) {
            if let Some(mark) = high_water {
                if !ctx.wait_below(mark) {
                    break;
                }
            } else if !ctx.is_running() {
                break;
            }
            ctx.push(frame)?;
            pushed += 1;
        }
        debug!("Replay finished ({} frames pushed)", pushed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Device, DeviceConfig, FrameSource};
    use std::time::Duration;

    fn frames(n: usize) -> Vec<PdoFrame> {
        (0..n)
            .map(|i| PdoFrame::new(0x181 + (i as u32 % 4) * 0x100, &[i as u8]))
            .collect()
    }

    #[test]
    fn test_replay_preserves_order() {
        let device = Device::new(ReplayProducer::new(frames(6)), DeviceConfig::default());
        device.start().unwrap();
        let received: Vec<u8> = (0..6).map(|_| device.next_frame().unwrap().data[0]).collect();
        assert_eq!(received, vec![0, 1, 2, 3, 4, 5]);
        device.stop().unwrap();
        assert!(device.next_frame().is_none());
    }

    #[test]
    fn test_replay_overflow_without_throttle() {
        let device = Device::new(
            ReplayProducer::new(frames(10)),
            DeviceConfig {
                queue_capacity: 4,
                rate_check_interval: Duration::from_secs(10),
            },
        );
        device.start().unwrap();
        // 消费者未及时读取：第 5 帧溢出，设备关闭
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while device.is_running() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        let mut count = 0;
        while device.next_frame().is_some() {
            count += 1;
        }
        assert_eq!(count, 4);
        assert_eq!(device.take_fault(), Some(CanError::Overflow { capacity: 4 }));
        device.stop().unwrap();
    }

    #[test]
    fn test_throttled_replay_handles_long_sequence() {
        let device = Device::new(
            ReplayProducer::throttled(frames(100)),
            DeviceConfig {
                queue_capacity: 4,
                rate_check_interval: Duration::from_secs(10),
            },
        );
        device.start().unwrap();
        for i in 0..100 {
            assert_eq!(device.next_frame().unwrap().data[0], i as u8);
        }
        device.stop().unwrap();
        assert!(device.take_fault().is_none());
    }
}
