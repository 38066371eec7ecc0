//! 帧来源设备
//!
//! `Device<P>` 组合了有界帧队列、生产者线程和帧率检查线程。具体的适配器
//! 只需实现 [`FrameProducer`]（推入侧），消费侧契约对所有适配器一致。

use crate::join::JoinTimeout;
use crate::queue::BoundedQueue;
use crate::rate::FrameRateStats;
use crate::{CanError, FrameSource, PdoFrame};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{Span, debug, error, info, info_span, warn};

/// 设备配置
///
/// # Example
///
/// ```
/// use canpdo_can::DeviceConfig;
/// use std::time::Duration;
///
/// let config = DeviceConfig {
///     queue_capacity: 8000,
///     rate_check_interval: Duration::from_secs(1),
/// };
/// assert!(config.queue_capacity >= DeviceConfig::default().queue_capacity);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, deny_unknown_fields))]
pub struct DeviceConfig {
    /// 帧队列容量（默认 4000，即 4 kHz 帧率下约 1 秒的流量）
    pub queue_capacity: usize,
    /// 帧率检查间隔
    pub rate_check_interval: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 4000,
            rate_check_interval: Duration::from_secs(10),
        }
    }
}

/// 生产者线程可用的推入侧句柄
pub struct ProducerContext {
    queue: Arc<BoundedQueue<PdoFrame>>,
    running: Arc<AtomicBool>,
    stats: Arc<FrameRateStats>,
    started_at: Instant,
}

impl ProducerContext {
    /// 推入一帧（非阻塞）
    ///
    /// 队列满时返回 [`CanError::Overflow`]，设备已停止时返回 [`CanError::Stopped`]，
    /// 生产者应立即返回该错误。
    pub fn push(&self, frame: PdoFrame) -> Result<(), CanError> {
        match self.queue.try_put(frame) {
            Ok(()) => {
                self.stats.record();
                Ok(())
            },
            Err(_) if self.queue.is_closed() => Err(CanError::Stopped),
            Err(full) => Err(CanError::Overflow {
                capacity: full.capacity,
            }),
        }
    }

    /// 设备是否仍在运行
    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 当前排队帧数
    pub fn backlog(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// 自设备启动以来的秒数（用作帧时间戳）
    pub fn elapsed(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    /// 帧流结束
    ///
    /// 已排队的帧仍会被读完，之后 `next_frame` 返回 `None`，下游据此自然结束。
    pub fn finish(&self) {
        if self.queue.put_sentinel() {
            debug!("End of frame stream");
        }
        self.running.store(false, Ordering::Release);
    }

    /// 等待队列积压降到 `high_water` 以下
    ///
    /// 只用于不受节拍约束的生产者；使用短睡眠退避而不是阻塞在 `push` 上。
    /// 设备停止时返回 `false`。
    pub fn wait_below(&self, high_water: usize) -> bool {
        while self.is_running() && self.backlog() >= high_water {
            spin_sleep::sleep(Duration::from_micros(200));
        }
        self.is_running()
    }
}

/// 帧生产者（适配器的推入侧）
///
/// `run` 在设备的生产者线程中执行，应在 `ctx.is_running()` 变为 `false`
/// 或 `push` 失败时尽快返回。正常返回表示暂时不再有帧，设备保持空闲直到被停止；
/// 帧流确实结束时应先调用 [`ProducerContext::finish`]。
pub trait FrameProducer: Send + 'static {
    fn run(&mut self, ctx: &ProducerContext) -> Result<(), CanError>;
}

#[derive(Default)]
struct DeviceThreads {
    producer: Option<JoinHandle<()>>,
    rate_check: Option<JoinHandle<()>>,
    shutdown_tx: Option<Sender<()>>,
}

/// 有界队列 + 生产者线程的帧来源
pub struct Device<P: FrameProducer> {
    config: DeviceConfig,
    queue: Arc<BoundedQueue<PdoFrame>>,
    producer: Mutex<Option<P>>,
    running: Arc<AtomicBool>,
    started: AtomicBool,
    stopped: AtomicBool,
    stats: Arc<FrameRateStats>,
    fault: Arc<Mutex<Option<CanError>>>,
    threads: Mutex<DeviceThreads>,
    span: Span,
}

impl<P: FrameProducer> Device<P> {
    pub fn new(producer: P, config: DeviceConfig) -> Self {
        let queue = Arc::new(BoundedQueue::new(config.queue_capacity));
        Self {
            config,
            queue,
            producer: Mutex::new(Some(producer)),
            running: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            stats: Arc::new(FrameRateStats::new()),
            fault: Arc::new(Mutex::new(None)),
            threads: Mutex::new(DeviceThreads::default()),
            span: info_span!("device"),
        }
    }

    /// 指定日志 span（所有设备线程在该 span 内运行）
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// 帧率统计
    pub fn frame_rate(&self) -> &Arc<FrameRateStats> {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 当前排队帧数
    pub fn backlog(&self) -> usize {
        self.queue.len()
    }

    fn spawn_producer(&self, mut producer: P, started_at: Instant) -> Result<JoinHandle<()>, CanError> {
        let ctx = ProducerContext {
            queue: self.queue.clone(),
            running: self.running.clone(),
            stats: self.stats.clone(),
            started_at,
        };
        let fault = self.fault.clone();
        let span = self.span.clone();

        std::thread::Builder::new()
            .name("canpdo-producer".into())
            .spawn(move || {
                let _guard = span.enter();
                debug!("Producer thread started");
                match producer.run(&ctx) {
                    Ok(()) => debug!("Producer finished"),
                    Err(CanError::Stopped) => debug!("Producer interrupted by stop"),
                    Err(e) => {
                        error!("Frame source failed: {}", e);
                        fault.lock().get_or_insert(e);
                        ctx.running.store(false, Ordering::Release);
                        ctx.queue.put_sentinel();
                    },
                }
            })
            .map_err(|e| CanError::Spawn {
                thread: "producer".into(),
                message: e.to_string(),
            })
    }

    fn spawn_rate_check(&self, shutdown_rx: Receiver<()>) -> Result<JoinHandle<()>, CanError> {
        let stats = self.stats.clone();
        let interval = self.config.rate_check_interval;
        let span = self.span.clone();

        std::thread::Builder::new()
            .name("canpdo-rate-check".into())
            .spawn(move || {
                let _guard = span.enter();
                // 建立基准
                stats.sample();
                loop {
                    match shutdown_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            let rate = stats.sample();
                            debug!(
                                "Frame Rate: {:.0}, Total Rate {:.0}, Frame Count {}",
                                rate.instant, rate.average, rate.total
                            );
                        },
                        // 收到停止信号或发送端被 drop
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .map_err(|e| CanError::Spawn {
                thread: "rate-check".into(),
                message: e.to_string(),
            })
    }
}

impl<P: FrameProducer> FrameSource for Device<P> {
    fn start(&self) -> Result<(), CanError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(CanError::Stopped);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(CanError::AlreadyStarted);
        }
        let Some(producer) = self.producer.lock().take() else {
            return Err(CanError::AlreadyStarted);
        };

        let _guard = self.span.enter();
        self.running.store(true, Ordering::Release);

        let (shutdown_tx, shutdown_rx) = bounded(1);
        let producer_handle = self.spawn_producer(producer, Instant::now())?;
        let rate_handle = self.spawn_rate_check(shutdown_rx)?;

        let mut threads = self.threads.lock();
        threads.producer = Some(producer_handle);
        threads.rate_check = Some(rate_handle);
        threads.shutdown_tx = Some(shutdown_tx);

        info!(
            "Device started (queue capacity: {})",
            self.queue.capacity()
        );
        Ok(())
    }

    fn stop(&self) -> Result<(), CanError> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _guard = self.span.enter();

        self.running.store(false, Ordering::Release);
        // 哨兵保证阻塞在 next_frame 上的消费者被唤醒
        self.queue.put_sentinel();

        let (producer, rate_check, shutdown_tx) = {
            let mut threads = self.threads.lock();
            (
                threads.producer.take(),
                threads.rate_check.take(),
                threads.shutdown_tx.take(),
            )
        };
        if let Some(tx) = shutdown_tx {
            let _ = tx.try_send(());
        }

        let timeout = Duration::from_secs(1);
        let mut result = Ok(());
        for (name, handle) in [("producer", producer), ("rate-check", rate_check)] {
            if let Some(handle) = handle
                && let Err(failure) = handle.join_timeout(timeout)
            {
                let err = CanError::from_join(failure, name, timeout);
                error!("{}", err);
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }

        if self.started.load(Ordering::Acquire) {
            info!("Device stopped after {} frames", self.stats.total());
        }
        result
    }

    fn next_frame(&self) -> Option<PdoFrame> {
        self.queue.get()
    }

    fn take_fault(&self) -> Option<CanError> {
        self.fault.lock().take()
    }
}

impl<P: FrameProducer> Drop for Device<P> {
    fn drop(&mut self) {
        if self.started.load(Ordering::Acquire)
            && !self.stopped.load(Ordering::Acquire)
            && let Err(e) = self.stop()
        {
            warn!("Device failed to stop cleanly on drop: {}", e);
        }
    }
}
