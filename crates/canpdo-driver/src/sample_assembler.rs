//! 线程化的样本组装器
//!
//! 独立线程从 [`FrameSource`] 拉取帧，经 [`FrameAssembler`] 组装为批次，
//! 推入有界输出队列。
//!
//! # 背压
//!
//! 输出队列满时不会阻塞：记录 [`DriverError::OutputOverflow`]、停止上游帧来源并退出。
//! 下游最慢的消费者因此会一路把背压传递到帧生产者。

use crate::assembler::FrameAssembler;
use crate::error::DriverError;
use crate::metrics::PipelineMetrics;
use canpdo_can::{BoundedQueue, FrameSource, JoinTimeout};
use canpdo_protocol::{Batch, Format};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{Span, debug, error, info, info_span, warn};

/// 组装器配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblerConfig {
    /// 同步前丢弃的帧数（清空适配器中的陈旧缓冲）
    pub warmup_frames: u64,
    /// 输出队列容量（批次）
    pub output_capacity: usize,
    /// 停止时等待线程退出的超时
    pub join_timeout: Duration,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            warmup_frames: 1000,
            output_capacity: 1000,
            join_timeout: Duration::from_secs(1),
        }
    }
}

pub struct SampleAssembler {
    source: Arc<dyn FrameSource>,
    assembler: Mutex<Option<FrameAssembler>>,
    config: AssemblerConfig,
    output: Arc<BoundedQueue<Batch>>,
    metrics: Arc<PipelineMetrics>,
    fault: Arc<Mutex<Option<DriverError>>>,
    started: AtomicBool,
    stopped: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    span: Span,
}

impl SampleAssembler {
    pub fn new(
        source: Arc<dyn FrameSource>,
        format: Arc<Format>,
        config: AssemblerConfig,
    ) -> Result<Self, DriverError> {
        let metrics = Arc::new(PipelineMetrics::new());
        let assembler =
            FrameAssembler::new(format, config.warmup_frames)?.with_metrics(metrics.clone());
        Ok(Self {
            source,
            assembler: Mutex::new(Some(assembler)),
            output: Arc::new(BoundedQueue::new(config.output_capacity)),
            config,
            metrics,
            fault: Arc::new(Mutex::new(None)),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            worker: Mutex::new(None),
            span: info_span!("assembler"),
        })
    }

    /// 指定日志 span
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    pub fn source(&self) -> &Arc<dyn FrameSource> {
        &self.source
    }

    pub fn config(&self) -> &AssemblerConfig {
        &self.config
    }

    /// 启动帧来源和组装线程
    pub fn start(&self) -> Result<(), DriverError> {
        if self.stopped.load(Ordering::Acquire) || self.started.swap(true, Ordering::AcqRel) {
            return Err(DriverError::AlreadyStarted);
        }
        let Some(mut assembler) = self.assembler.lock().take() else {
            return Err(DriverError::AlreadyStarted);
        };

        let _guard = self.span.enter();
        self.source.start()?;
        assembler.start();

        let source = self.source.clone();
        let output = self.output.clone();
        let fault = self.fault.clone();
        let span = self.span.clone();

        let handle = std::thread::Builder::new()
            .name("canpdo-assembler".into())
            .spawn(move || {
                let _guard = span.enter();
                if let Err(e) = read_loop(&mut assembler, source.as_ref(), &output) {
                    error!("Assembler stopped: {}", e);
                    fault.lock().get_or_insert(e);
                    if let Err(e) = source.stop() {
                        warn!("Failed to stop frame source: {}", e);
                    }
                } else if let Some(e) = source.take_fault() {
                    error!("Frame source failed: {}", e);
                    fault.lock().get_or_insert(DriverError::Can(e));
                }
                // 退出前推入哨兵：此后不会再有批次
                output.put_sentinel();
                debug!("Assembler thread exiting");
            })
            .map_err(|e| DriverError::Spawn {
                thread: "assembler".into(),
                message: e.to_string(),
            })?;

        *self.worker.lock() = Some(handle);
        info!("Sample assembler started");
        Ok(())
    }

    /// 停止组装器
    ///
    /// 推入批次哨兵、停止帧来源、在超时内等待线程退出。可重复调用。
    pub fn stop(&self) -> Result<(), DriverError> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _guard = self.span.enter();

        self.output.put_sentinel();
        let mut result = self.source.stop().map_err(DriverError::from);

        if let Some(handle) = self.worker.lock().take()
            && let Err(failure) = handle.join_timeout(self.config.join_timeout)
        {
            let err = DriverError::from_join(failure, "assembler", self.config.join_timeout);
            error!("{}", err);
            result = Err(err);
        }

        if self.started.load(Ordering::Acquire) {
            info!(
                "Sample assembler stopped after {} batches",
                self.metrics.snapshot().batches_produced
            );
        }
        result
    }

    /// 阻塞获取下一个批次，停止后返回 `None`
    pub fn get_batch(&self) -> Option<Batch> {
        self.output.get()
    }

    /// 取出运行期间记录的致命错误
    pub fn take_fault(&self) -> Option<DriverError> {
        self.fault.lock().take()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl Drop for SampleAssembler {
    fn drop(&mut self) {
        if self.started.load(Ordering::Acquire)
            && !self.stopped.load(Ordering::Acquire)
            && let Err(e) = self.stop()
        {
            warn!("Sample assembler failed to stop cleanly on drop: {}", e);
        }
    }
}

fn read_loop(
    assembler: &mut FrameAssembler,
    source: &dyn FrameSource,
    output: &BoundedQueue<Batch>,
) -> Result<(), DriverError> {
    while let Some(frame) = source.next_frame() {
        let Some(batch) = assembler.process(&frame)? else {
            continue;
        };
        if let Err(full) = output.try_put(batch) {
            if output.is_closed() {
                // stop() 已推入哨兵
                break;
            }
            return Err(DriverError::OutputOverflow {
                capacity: full.capacity,
            });
        }
    }
    Ok(())
}
