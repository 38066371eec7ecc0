//! PDO 帧组装状态机
//!
//! 把可能夹杂无关帧的帧流转换为严格有序的批次（每个总线周期一个）。
//!
//! ```text
//! Idle ──start()──▶ WaitingForSync ──周期首帧（预热结束后）──▶ Running
//!   ▲                                                            │
//!   └──────────────────── 帧顺序错误 ────────────────────────────┘
//! ```
//!
//! 本模块不含线程，线程封装见 [`SampleAssembler`](crate::SampleAssembler)。

use crate::error::DriverError;
use crate::metrics::PipelineMetrics;
use canpdo_protocol::{Batch, Format, PdoFrame, ProtocolError, Sample};
use std::sync::Arc;
use tracing::{debug, info, trace};

/// 状态机状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblerState {
    /// 未启动，或因帧顺序错误而停机
    Idle,
    /// 丢弃预热帧，等待周期首帧
    WaitingForSync,
    /// 正常组装
    Running,
}

/// 帧组装器
pub struct FrameAssembler {
    format: Arc<Format>,
    state: AssemblerState,
    warmup_frames: u64,
    warmup_remaining: u64,
    /// 上一个被接受帧在周期中的位置
    prev_index: usize,
    /// 当前采样序号
    index: u64,
    pending: Vec<Sample>,
    metrics: Arc<PipelineMetrics>,
}

impl FrameAssembler {
    /// 创建组装器（格式必须满足不变量）
    pub fn new(format: Arc<Format>, warmup_frames: u64) -> Result<Self, ProtocolError> {
        format.validate()?;
        let capacity = format.channel_count();
        Ok(Self {
            format,
            state: AssemblerState::Idle,
            warmup_frames,
            warmup_remaining: warmup_frames,
            prev_index: 0,
            index: 0,
            pending: Vec::with_capacity(capacity),
            metrics: Arc::new(PipelineMetrics::new()),
        })
    }

    /// 使用共享的指标计数器
    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    pub fn format(&self) -> &Arc<Format> {
        &self.format
    }

    pub fn state(&self) -> AssemblerState {
        self.state
    }

    /// 下一个批次的采样序号
    pub fn index(&self) -> u64 {
        self.index
    }

    /// 进入等待同步状态
    ///
    /// 每次启动都重新预热；采样序号在同一实例内持续递增。
    pub fn start(&mut self) {
        self.state = AssemblerState::WaitingForSync;
        self.warmup_remaining = self.warmup_frames;
        self.pending.clear();
        debug!(
            "Assembler waiting for sync ({} warm-up frames)",
            self.warmup_frames
        );
    }

    /// 处理一帧
    ///
    /// 返回 `Ok(Some(batch))` 表示一个周期完成；帧顺序错误时返回
    /// [`DriverError::FrameOrder`] 并回到 `Idle`，此后不再产生批次。
    pub fn process(&mut self, frame: &PdoFrame) -> Result<Option<Batch>, DriverError> {
        PipelineMetrics::incr(&self.metrics.frames_seen);

        if frame.is_error || !self.format.contains(frame.id) {
            trace!("Ignoring frame 0x{:X}", frame.id);
            PipelineMetrics::incr(&self.metrics.frames_ignored);
            return Ok(None);
        }

        match self.state {
            AssemblerState::Idle => return Ok(None),
            AssemblerState::WaitingForSync => {
                if self.warmup_remaining > 0 {
                    self.warmup_remaining -= 1;
                    PipelineMetrics::incr(&self.metrics.warmup_discarded);
                    return Ok(None);
                }
                let order = self.format.order();
                if frame.id != order[0] {
                    return Ok(None);
                }
                info!("Assembler running");
                self.state = AssemblerState::Running;
                // 下一个期望位置回绕到 0
                self.prev_index = order.len() - 1;
            },
            AssemblerState::Running => {},
        }

        self.check_order(frame.id)?;
        self.decode(frame);

        if Some(&frame.id) == self.format.order().last() {
            let time = self.current_time();
            let samples = std::mem::replace(
                &mut self.pending,
                Vec::with_capacity(self.format.channel_count()),
            );
            let mut batch = Batch::from_samples(samples);
            batch.index = self.index;
            batch.time = time;
            self.index += 1;
            PipelineMetrics::incr(&self.metrics.batches_produced);
            return Ok(Some(batch));
        }
        Ok(None)
    }

    fn current_time(&self) -> f64 {
        self.index as f64 / self.format.sample_rate_hz()
    }

    fn check_order(&mut self, id: u32) -> Result<(), DriverError> {
        let order = self.format.order();
        let expected_index = (self.prev_index + 1) % order.len();
        if order[expected_index] == id {
            self.prev_index = expected_index;
            return Ok(());
        }

        let err = DriverError::FrameOrder {
            received_id: id,
            expected_index,
            prev_index: self.prev_index,
        };
        self.state = AssemblerState::Idle;
        self.pending.clear();
        Err(err)
    }

    fn decode(&mut self, frame: &PdoFrame) {
        let Some(frame_format) = self.format.frame(frame.id) else {
            return;
        };
        let time = self.current_time();
        for (slot, (value, raw_value)) in frame_format.decode(&frame.data).into_iter().enumerate() {
            self.pending.push(Sample {
                name: frame_format.names[slot].clone(),
                value,
                raw_value,
                timestamp: frame.timestamp,
                time,
                index: self.index,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canpdo_protocol::FrameFormat;
    use proptest::prelude::*;

    fn two_frame_format() -> Arc<Format> {
        let format = Format::new(100.0)
            .with_frame(FrameFormat::single(0x181).with_names(["a", "b"]))
            .unwrap()
            .with_frame(FrameFormat::fixed_point(0x281).with_names(["c", "d", "e", "f"]))
            .unwrap();
        Arc::new(format)
    }

    fn cycle(values: f64) -> [PdoFrame; 2] {
        [
            PdoFrame::from_single(0x181, [values as f32, -(values as f32)]),
            PdoFrame::from_7q8(0x281, [values, values + 1.0, values + 2.0, values + 3.0]),
        ]
    }

    #[test]
    fn test_idle_ignores_frames() {
        let mut assembler = FrameAssembler::new(two_frame_format(), 0).unwrap();
        for frame in cycle(1.0) {
            assert_eq!(assembler.process(&frame).unwrap(), None);
        }
        assert_eq!(assembler.state(), AssemblerState::Idle);
    }

    #[test]
    fn test_sync_on_first_id() {
        let mut assembler = FrameAssembler::new(two_frame_format(), 0).unwrap();
        assembler.start();
        // 周期中间开始：0x281 被丢弃
        assert_eq!(assembler.process(&cycle(0.0)[1]).unwrap(), None);
        assert_eq!(assembler.state(), AssemblerState::WaitingForSync);

        let [first, second] = cycle(2.0);
        assert_eq!(assembler.process(&first).unwrap(), None);
        assert_eq!(assembler.state(), AssemblerState::Running);
        let batch = assembler.process(&second).unwrap().unwrap();

        assert_eq!(batch.index, 0);
        assert_eq!(batch.time, 0.0);
        assert_eq!(batch.channel_names().collect::<Vec<_>>(), vec!["a", "b", "c", "d", "e", "f"]);
        assert_eq!(batch.value("a"), Some(2.0));
        assert_eq!(batch.value("b"), Some(-2.0));
        assert_eq!(batch.value("f"), Some(5.0));
    }

    #[test]
    fn test_warmup_counts_only_relevant_frames() {
        let mut assembler = FrameAssembler::new(two_frame_format(), 3).unwrap();
        assembler.start();
        let noise = PdoFrame::new(0x700, &[0; 8]);
        for _ in 0..10 {
            assembler.process(&noise).unwrap();
        }
        let [a, b] = cycle(1.0);
        assembler.process(&a).unwrap();
        assembler.process(&b).unwrap();
        assembler.process(&a).unwrap();
        // 3 个预热帧已消耗，下一个 0x181 触发同步
        assert_eq!(assembler.state(), AssemblerState::WaitingForSync);
        assembler.process(&b).unwrap();
        assert_eq!(assembler.state(), AssemblerState::WaitingForSync);
        assembler.process(&a).unwrap();
        assert_eq!(assembler.state(), AssemblerState::Running);

        let snapshot = assembler.metrics().snapshot();
        assert_eq!(snapshot.frames_ignored, 10);
        assert_eq!(snapshot.warmup_discarded, 3);
    }

    #[test]
    fn test_batches_are_sequential() {
        let mut assembler = FrameAssembler::new(two_frame_format(), 0).unwrap();
        assembler.start();
        let mut batches = Vec::new();
        for k in 0..5 {
            for frame in cycle(k as f64) {
                if let Some(batch) = assembler.process(&frame).unwrap() {
                    batches.push(batch);
                }
            }
        }
        assert_eq!(batches.len(), 5);
        for (k, batch) in batches.iter().enumerate() {
            assert_eq!(batch.index, k as u64);
            assert!((batch.time - k as f64 / 100.0).abs() < 1e-12);
            assert!(batch.iter().all(|s| s.index == k as u64 && s.time == batch.time));
        }
    }

    #[test]
    fn test_order_violation_halts() {
        let mut assembler = FrameAssembler::new(two_frame_format(), 0).unwrap();
        assembler.start();
        let [a, b] = cycle(1.0);
        assembler.process(&a).unwrap();
        let err = assembler.process(&a).unwrap_err();
        assert_eq!(
            err,
            DriverError::FrameOrder {
                received_id: 0x181,
                expected_index: 1,
                prev_index: 0,
            }
        );
        assert_eq!(assembler.state(), AssemblerState::Idle);
        // 停机后不再产生批次
        assert_eq!(assembler.process(&b).unwrap(), None);
        assert_eq!(assembler.process(&a).unwrap(), None);
        assert_eq!(assembler.process(&b).unwrap(), None);
    }

    #[test]
    fn test_restart_requires_new_warmup() {
        let mut assembler = FrameAssembler::new(two_frame_format(), 1).unwrap();
        assembler.start();
        let [a, b] = cycle(1.0);
        for frame in [a, b, a, b] {
            assembler.process(&frame).unwrap();
        }
        assert_eq!(assembler.index(), 1);
        assert!(assembler.process(&b).is_err());

        assembler.start();
        assert_eq!(assembler.process(&a).unwrap(), None); // 预热
        assembler.process(&a).unwrap();
        let batch = assembler.process(&b).unwrap().unwrap();
        assert_eq!(batch.index, 1);
    }

    #[test]
    fn test_frame_calibration_produces_raw_value() {
        let format = Format::new(1000.0)
            .with_frame(FrameFormat::fixed_point(0x181).with_calibration(0, 2.0, 1.0))
            .unwrap();
        let mut assembler = FrameAssembler::new(Arc::new(format), 0).unwrap();
        assembler.start();
        let batch = assembler
            .process(&PdoFrame::from_7q8(0x181, [1.0, 1.0, 0.0, 0.0]))
            .unwrap()
            .unwrap();
        let samples = batch.samples();
        assert_eq!(samples[0].value, 4.0);
        assert_eq!(samples[0].raw_value, Some(1.0));
        assert_eq!(samples[1].raw_value, None);
    }

    #[test]
    fn test_error_frames_are_ignored() {
        let mut assembler = FrameAssembler::new(two_frame_format(), 0).unwrap();
        assembler.start();
        let [a, b] = cycle(1.0);
        assembler.process(&a).unwrap();
        assert_eq!(assembler.process(&a.with_error(true)).unwrap(), None);
        assert!(assembler.process(&b).unwrap().is_some());
    }

    #[test]
    fn test_rejects_empty_format() {
        assert!(FrameAssembler::new(Arc::new(Format::default()), 0).is_err());
    }

    fn cycles(n: usize) -> Vec<PdoFrame> {
        (0..n).flat_map(|k| cycle(k as f64)).collect()
    }

    proptest! {
        #[test]
        fn prop_noise_does_not_break_cycles(
            n in 1usize..40,
            noise in prop::collection::vec((0usize..80, 0x700u32..0x800), 0..20),
        ) {
            let mut frames = cycles(n);
            for (pos, id) in noise {
                let at = pos.min(frames.len());
                frames.insert(at, PdoFrame::new(id, &[0xAA; 8]));
            }

            let mut assembler = FrameAssembler::new(two_frame_format(), 0).unwrap();
            assembler.start();
            let mut batches = Vec::new();
            for frame in &frames {
                if let Some(batch) = assembler.process(frame).unwrap() {
                    batches.push(batch);
                }
            }

            prop_assert_eq!(batches.len(), n);
            for (i, batch) in batches.iter().enumerate() {
                prop_assert_eq!(batch.index, i as u64);
                prop_assert!((batch.time - i as f64 / 100.0).abs() < 1e-12);
                prop_assert_eq!(batch.len(), 6);
                prop_assert_eq!(batch.samples()[0].value, i as f64);
            }
        }

        #[test]
        fn prop_swapped_frames_halt_at_that_cycle(n in 2usize..30, at in 1usize..30) {
            let at = at.min(n - 1);
            let mut frames = cycles(n);
            frames.swap(2 * at, 2 * at + 1);

            let mut assembler = FrameAssembler::new(two_frame_format(), 0).unwrap();
            assembler.start();
            let mut produced = 0usize;
            let mut errors = 0usize;
            for frame in &frames {
                match assembler.process(frame) {
                    Ok(Some(_)) => {
                        prop_assert_eq!(errors, 0);
                        produced += 1;
                    },
                    Ok(None) => {},
                    Err(DriverError::FrameOrder { received_id, .. }) => {
                        prop_assert_eq!(received_id, 0x281);
                        errors += 1;
                    },
                    Err(e) => prop_assert!(false, "unexpected error: {}", e),
                }
            }
            prop_assert_eq!(produced, at);
            prop_assert_eq!(errors, 1);
            prop_assert_eq!(assembler.state(), AssemblerState::Idle);
        }
    }
}
