//! 批次路由与流水线监督
//!
//! `Monitor` 拥有分发：路由线程从 [`SampleAssembler`] 取批次，按注册顺序应用过滤器，
//! 然后以 `Arc` 共享给每个活跃的输出端。监督线程低频检查是否还有活跃的输出端，
//! 全部结束后按依赖顺序关闭流水线：先组装器（连同帧来源），再所有输出端。

use crate::calibrate::BatchFilter;
use crate::error::{DriverError, PipelineFault};
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::sample_assembler::SampleAssembler;
use crate::sink::BatchSink;
use canpdo_can::JoinTimeout;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{Span, debug, error, info, info_span, warn};

/// Monitor 配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    /// 检查输出端是否活跃的间隔
    pub supervise_interval: Duration,
    /// 停止时等待各线程退出的超时
    pub join_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            supervise_interval: Duration::from_secs(2),
            join_timeout: Duration::from_secs(2),
        }
    }
}

struct SinkSlot {
    sink: Arc<dyn BatchSink>,
    /// 路由器侧的活跃标志（背压后清除）
    routed: AtomicBool,
}

impl SinkSlot {
    fn is_active(&self) -> bool {
        self.routed.load(Ordering::Acquire) && self.sink.is_active()
    }
}

/// 路由线程、监督线程与控制方共享的状态
struct Shared {
    assembler: Arc<SampleAssembler>,
    sinks: Vec<SinkSlot>,
    config: MonitorConfig,
    faults: Mutex<Vec<PipelineFault>>,
    shutting_down: AtomicBool,
    finished: Mutex<bool>,
    finished_cv: Condvar,
    router: Mutex<Option<JoinHandle<()>>>,
    wake_tx: Sender<()>,
    span: Span,
}

impl Shared {
    fn record(&self, fault: PipelineFault) {
        error!("Pipeline fault: {}", fault);
        self.faults.lock().push(fault);
    }

    fn any_sink_active(&self) -> bool {
        self.sinks.iter().any(SinkSlot::is_active)
    }

    fn wake_supervisor(&self) {
        let _ = self.wake_tx.try_send(());
    }

    fn wait_finished(&self, timeout: Option<Duration>) -> bool {
        let mut finished = self.finished.lock();
        match timeout {
            None => {
                while !*finished {
                    self.finished_cv.wait(&mut finished);
                }
                true
            },
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !*finished {
                    if self.finished_cv.wait_until(&mut finished, deadline).timed_out() {
                        break;
                    }
                }
                *finished
            },
        }
    }

    /// 按依赖顺序关闭流水线（只执行一次，其他调用者等待其完成）
    fn shutdown(&self) -> Result<(), PipelineFault> {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            self.wait_finished(None);
            return Ok(());
        }
        let _guard = self.span.enter();
        info!("Shutting down pipeline");

        let mut first_error: Option<PipelineFault> = None;
        let mut fail = |fault: PipelineFault| {
            first_error.get_or_insert_with(|| fault.clone());
            self.record(fault);
        };

        // 1. 组装器与帧来源
        if let Err(e) = self.assembler.stop() {
            fail(e.into());
        }
        if let Some(e) = self.assembler.take_fault() {
            self.record(e.into());
        }

        // 2. 路由线程（组装器的哨兵使其退出）
        if let Some(handle) = self.router.lock().take()
            && let Err(failure) = handle.join_timeout(self.config.join_timeout)
        {
            fail(PipelineFault::Monitor(DriverError::from_join(
                failure,
                "router",
                self.config.join_timeout,
            )));
        }

        // 3. 输出端，处理完已排队的批次
        for slot in &self.sinks {
            slot.routed.store(false, Ordering::Release);
            if let Err(error) = slot.sink.stop(true) {
                fail(PipelineFault::Sink {
                    name: slot.sink.name().to_string(),
                    error,
                });
            }
            if let Some(error) = slot.sink.take_fault() {
                self.record(PipelineFault::Sink {
                    name: slot.sink.name().to_string(),
                    error,
                });
            }
        }

        *self.finished.lock() = true;
        self.finished_cv.notify_all();
        info!("Pipeline stopped");

        match first_error {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }
}

fn route_loop(shared: &Shared, filters: Vec<Box<dyn BatchFilter>>, metrics: &PipelineMetrics) {
    while let Some(mut batch) = shared.assembler.get_batch() {
        for filter in &filters {
            filter.apply(&mut batch);
        }
        let batch = Arc::new(batch);

        for slot in &shared.sinks {
            if !slot.is_active() {
                continue;
            }
            if let Err(error) = slot.sink.put(batch.clone()) {
                warn!(
                    "Sink {} rejected batch {}, marking inactive",
                    slot.sink.name(),
                    batch.index
                );
                slot.routed.store(false, Ordering::Release);
                PipelineMetrics::incr(&metrics.sink_drops);
                shared.record(PipelineFault::Sink {
                    name: slot.sink.name().to_string(),
                    error,
                });
            }
        }
        PipelineMetrics::incr(&metrics.batches_routed);
    }
    debug!("Route loop finished");
    shared.wake_supervisor();
}

fn supervise_loop(shared: &Shared, wake_rx: Receiver<()>) {
    loop {
        match wake_rx.recv_timeout(shared.config.supervise_interval) {
            Err(RecvTimeoutError::Timeout) => {
                if !shared.any_sink_active() {
                    info!("No more active sinks");
                    break;
                }
            },
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    if let Err(e) = shared.shutdown() {
        warn!("Pipeline shutdown reported: {}", e);
    }
}

/// 创建工作线程（名称、线程体）
type Spawner = fn(String, Box<dyn FnOnce() + Send>) -> std::io::Result<JoinHandle<()>>;

fn spawn_thread(name: String, body: Box<dyn FnOnce() + Send>) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new().name(name).spawn(body)
}

/// 启动中途失败：关闭已启动的部分，返回原始错误
fn abort_start(shared: &Shared, fault: PipelineFault) -> PipelineFault {
    error!("Monitor failed to start: {}", fault);
    if let Err(e) = shared.shutdown() {
        warn!("Cleanup after failed start reported: {}", e);
    }
    fault
}

/// 流水线路由器与监督者
pub struct Monitor {
    assembler: Arc<SampleAssembler>,
    filters: Vec<Box<dyn BatchFilter>>,
    sinks: Vec<Arc<dyn BatchSink>>,
    config: MonitorConfig,
    span: Span,
    shared: Option<Arc<Shared>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    spawner: Spawner,
}

impl Monitor {
    pub fn new(assembler: SampleAssembler, config: MonitorConfig) -> Self {
        Self {
            assembler: Arc::new(assembler),
            filters: Vec::new(),
            sinks: Vec::new(),
            config,
            span: info_span!("monitor"),
            shared: None,
            supervisor: Mutex::new(None),
            spawner: spawn_thread,
        }
    }

    #[cfg(test)]
    fn with_spawner(mut self, spawner: Spawner) -> Self {
        self.spawner = spawner;
        self
    }

    fn spawn(&self, thread: &str, body: Box<dyn FnOnce() + Send>) -> Result<JoinHandle<()>, PipelineFault> {
        (self.spawner)(format!("canpdo-{}", thread), body).map_err(|e| {
            PipelineFault::Monitor(DriverError::Spawn {
                thread: thread.to_string(),
                message: e.to_string(),
            })
        })
    }

    /// 指定日志 span
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// 添加过滤器（按添加顺序应用，只能在启动前调用）
    pub fn add_filter(&mut self, filter: impl BatchFilter + 'static) -> Result<(), DriverError> {
        if self.shared.is_some() {
            return Err(DriverError::AlreadyStarted);
        }
        self.filters.push(Box::new(filter));
        Ok(())
    }

    /// 添加输出端（只能在启动前调用）
    pub fn add_sink(&mut self, sink: Arc<dyn BatchSink>) -> Result<(), DriverError> {
        if self.shared.is_some() {
            return Err(DriverError::AlreadyStarted);
        }
        self.sinks.push(sink);
        Ok(())
    }

    pub fn sinks(&self) -> &[Arc<dyn BatchSink>] {
        &self.sinks
    }

    pub fn assembler(&self) -> &Arc<SampleAssembler> {
        &self.assembler
    }

    /// 启动输出端、组装器和路由/监督线程
    pub fn start(&mut self) -> Result<(), PipelineFault> {
        if self.shared.is_some() {
            return Err(PipelineFault::Monitor(DriverError::AlreadyStarted));
        }
        let _guard = self.span.enter();

        for (i, sink) in self.sinks.iter().enumerate() {
            if let Err(error) = sink.start() {
                for started in &self.sinks[..i] {
                    let _ = started.stop(false);
                }
                return Err(PipelineFault::Sink {
                    name: sink.name().to_string(),
                    error,
                });
            }
        }

        let (wake_tx, wake_rx) = bounded(4);
        let shared = Arc::new(Shared {
            assembler: self.assembler.clone(),
            sinks: self
                .sinks
                .iter()
                .map(|sink| SinkSlot {
                    sink: sink.clone(),
                    routed: AtomicBool::new(true),
                })
                .collect(),
            config: self.config.clone(),
            faults: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
            finished: Mutex::new(false),
            finished_cv: Condvar::new(),
            router: Mutex::new(None),
            wake_tx,
            span: self.span.clone(),
        });
        self.shared = Some(shared.clone());

        if let Err(e) = self.assembler.start() {
            return Err(abort_start(&shared, e.into()));
        }

        let filters = std::mem::take(&mut self.filters);
        let router = {
            let shared = shared.clone();
            let metrics = self.assembler.metrics().clone();
            let span = self.span.clone();
            self.spawn(
                "router",
                Box::new(move || {
                    let _guard = span.enter();
                    route_loop(&shared, filters, &metrics);
                }),
            )
        };
        match router {
            Ok(handle) => *shared.router.lock() = Some(handle),
            Err(fault) => return Err(abort_start(&shared, fault)),
        }

        let supervisor = {
            let shared = shared.clone();
            let span = self.span.clone();
            self.spawn(
                "supervisor",
                Box::new(move || {
                    let _guard = span.enter();
                    supervise_loop(&shared, wake_rx);
                }),
            )
        };
        match supervisor {
            Ok(handle) => *self.supervisor.lock() = Some(handle),
            Err(fault) => return Err(abort_start(&shared, fault)),
        }

        info!("Monitor started with {} sinks", self.sinks.len());
        Ok(())
    }

    /// 停止整个流水线（可重复调用）
    ///
    /// 线程未在超时内退出时返回错误；运行期间的故障通过 [`Monitor::take_faults`] 获取。
    pub fn stop(&self) -> Result<(), PipelineFault> {
        let Some(shared) = &self.shared else {
            return Ok(());
        };
        let result = shared.shutdown();
        shared.wake_supervisor();

        if let Some(handle) = self.supervisor.lock().take()
            && let Err(failure) = handle.join_timeout(self.config.join_timeout)
        {
            let fault = PipelineFault::Monitor(DriverError::from_join(
                failure,
                "supervisor",
                self.config.join_timeout,
            ));
            shared.record(fault.clone());
            return result.and(Err(fault));
        }
        result
    }

    /// 阻塞直到流水线结束（所有输出端结束、故障或被停止）
    pub fn wait(&self) {
        if let Some(shared) = &self.shared {
            shared.wait_finished(None);
        }
    }

    /// 带超时等待，返回流水线是否已结束
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match &self.shared {
            Some(shared) => shared.wait_finished(Some(timeout)),
            None => true,
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared
            .as_ref()
            .is_some_and(|shared| !*shared.finished.lock())
    }

    /// 取出已记录的故障
    pub fn take_faults(&self) -> Vec<PipelineFault> {
        self.shared
            .as_ref()
            .map(|shared| std::mem::take(&mut *shared.faults.lock()))
            .unwrap_or_default()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.assembler.metrics().snapshot()
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        // 流水线自行结束后也要回收监督线程
        if self.shared.is_some()
            && let Err(e) = self.stop()
        {
            warn!("Monitor failed to stop cleanly on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibrate::Calibration;
    use crate::error::SinkError;
    use crate::sample_assembler::AssemblerConfig;
    use canpdo_can::{Device, DeviceConfig, FrameSource, PdoFrame, ReplayProducer};
    use canpdo_protocol::{Batch, Format, FrameFormat};

    /// 收集批次的内存输出端，`limit` 个批次后结束
    struct CollectSink {
        name: String,
        batches: Mutex<Vec<Arc<Batch>>>,
        limit: Option<usize>,
        reject: bool,
        active: AtomicBool,
        stopped_with_flush: Mutex<Option<bool>>,
    }

    impl CollectSink {
        fn new(name: &str, limit: Option<usize>) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                batches: Mutex::new(Vec::new()),
                limit,
                reject: false,
                active: AtomicBool::new(false),
                stopped_with_flush: Mutex::new(None),
            })
        }

        fn rejecting(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                batches: Mutex::new(Vec::new()),
                limit: None,
                reject: true,
                active: AtomicBool::new(false),
                stopped_with_flush: Mutex::new(None),
            })
        }
    }

    impl BatchSink for CollectSink {
        fn name(&self) -> &str {
            &self.name
        }

        fn start(&self) -> Result<(), SinkError> {
            self.active.store(true, Ordering::Release);
            Ok(())
        }

        fn put(&self, batch: Arc<Batch>) -> Result<(), SinkError> {
            if self.reject {
                return Err(SinkError::Backpressure {
                    sink: self.name.clone(),
                    capacity: 0,
                });
            }
            let mut batches = self.batches.lock();
            batches.push(batch);
            if self.limit.is_some_and(|limit| batches.len() >= limit) {
                self.active.store(false, Ordering::Release);
            }
            Ok(())
        }

        fn is_active(&self) -> bool {
            self.active.load(Ordering::Acquire)
        }

        fn stop(&self, flush: bool) -> Result<(), SinkError> {
            self.active.store(false, Ordering::Release);
            self.stopped_with_flush.lock().get_or_insert(flush);
            Ok(())
        }
    }

    fn format() -> Arc<Format> {
        Arc::new(
            Format::new(1000.0)
                .with_frame(FrameFormat::single(0x181).with_names(["a", "b"]))
                .unwrap()
                .with_frame(FrameFormat::fixed_point(0x281))
                .unwrap(),
        )
    }

    fn monitor_for(frames: Vec<PdoFrame>) -> Monitor {
        let source: Arc<dyn FrameSource> = Arc::new(Device::new(
            ReplayProducer::throttled(frames),
            DeviceConfig::default(),
        ));
        let assembler = SampleAssembler::new(
            source,
            format(),
            AssemblerConfig {
                warmup_frames: 0,
                ..Default::default()
            },
        )
        .unwrap();
        Monitor::new(
            assembler,
            MonitorConfig {
                supervise_interval: Duration::from_millis(20),
                join_timeout: Duration::from_secs(2),
            },
        )
    }

    fn cycles(n: usize) -> Vec<PdoFrame> {
        (0..n)
            .flat_map(|k| {
                [
                    PdoFrame::from_single(0x181, [k as f32, 1.0]),
                    PdoFrame::from_7q8(0x281, [0.0; 4]),
                ]
            })
            .collect()
    }

    #[test]
    fn test_shuts_down_when_all_sinks_finish() {
        let mut monitor = monitor_for(cycles(200));
        let short = CollectSink::new("short", Some(5));
        let long = CollectSink::new("long", Some(50));
        monitor.add_sink(short.clone()).unwrap();
        monitor.add_sink(long.clone()).unwrap();
        monitor.start().unwrap();

        assert!(monitor.wait_timeout(Duration::from_secs(10)));
        monitor.stop().unwrap();

        assert_eq!(short.batches.lock().len(), 5);
        assert_eq!(long.batches.lock().len(), 50);
        // 所有输出端以 flush 方式停止
        assert_eq!(*long.stopped_with_flush.lock(), Some(true));
        assert!(monitor.take_faults().is_empty());
    }

    #[test]
    fn test_batches_delivered_in_order_to_every_sink() {
        let mut monitor = monitor_for(cycles(30));
        let first = CollectSink::new("first", Some(30));
        let second = CollectSink::new("second", Some(30));
        monitor.add_sink(first.clone()).unwrap();
        monitor.add_sink(second.clone()).unwrap();
        monitor.start().unwrap();
        assert!(monitor.wait_timeout(Duration::from_secs(10)));

        for sink in [&first, &second] {
            let indices: Vec<u64> = sink.batches.lock().iter().map(|b| b.index).collect();
            assert_eq!(indices, (0..30).collect::<Vec<u64>>());
        }
        // 两个输出端共享同一个批次
        assert!(Arc::ptr_eq(&first.batches.lock()[0], &second.batches.lock()[0]));
        assert_eq!(monitor.metrics().batches_routed, 30);
    }

    #[test]
    fn test_filters_run_before_fan_out() {
        let mut monitor = monitor_for(cycles(3));
        let sink = CollectSink::new("sink", Some(3));
        monitor
            .add_filter(Calibration::new("b", 1.0, 10.0).renamed("b_scaled"))
            .unwrap();
        monitor.add_sink(sink.clone()).unwrap();
        monitor.start().unwrap();
        assert!(monitor.wait_timeout(Duration::from_secs(10)));

        let batches = sink.batches.lock();
        assert_eq!(batches[0].value("b_scaled"), Some(20.0));
        assert!(batches[0].get("b").is_none());
    }

    #[test]
    fn test_backpressure_marks_only_that_sink_inactive() {
        let mut monitor = monitor_for(cycles(10));
        let bad = CollectSink::rejecting("bad");
        let good = CollectSink::new("good", Some(10));
        monitor.add_sink(bad.clone()).unwrap();
        monitor.add_sink(good.clone()).unwrap();
        monitor.start().unwrap();
        assert!(monitor.wait_timeout(Duration::from_secs(10)));

        assert_eq!(good.batches.lock().len(), 10);
        let faults = monitor.take_faults();
        assert_eq!(faults.len(), 1);
        assert!(matches!(&faults[0], PipelineFault::Sink { name, .. } if name == "bad"));
        assert_eq!(monitor.metrics().sink_drops, 1);
    }

    #[test]
    fn test_order_fault_is_reported() {
        let mut frames = cycles(2);
        frames.push(PdoFrame::from_7q8(0x281, [0.0; 4]));
        let mut monitor = monitor_for(frames);
        let sink = CollectSink::new("sink", None);
        monitor.add_sink(sink.clone()).unwrap();
        monitor.start().unwrap();
        assert!(monitor.wait_timeout(Duration::from_secs(10)));

        assert_eq!(sink.batches.lock().len(), 2);
        let faults = monitor.take_faults();
        assert!(faults.iter().any(|f| matches!(
            f,
            PipelineFault::Assembler(DriverError::FrameOrder { received_id: 0x281, .. })
        )));
    }

    fn no_supervisor(name: String, body: Box<dyn FnOnce() + Send>) -> std::io::Result<JoinHandle<()>> {
        if name == "canpdo-supervisor" {
            return Err(std::io::Error::other("thread limit reached"));
        }
        spawn_thread(name, body)
    }

    fn no_router(name: String, body: Box<dyn FnOnce() + Send>) -> std::io::Result<JoinHandle<()>> {
        if name == "canpdo-router" {
            return Err(std::io::Error::other("thread limit reached"));
        }
        spawn_thread(name, body)
    }

    #[test]
    fn test_failed_spawn_stops_started_stages() {
        let cases: [(Spawner, &str); 2] = [(no_router, "router"), (no_supervisor, "supervisor")];
        for (spawner, thread) in cases {
            let mut monitor = monitor_for(cycles(100)).with_spawner(spawner);
            let sink = CollectSink::new("sink", None);
            monitor.add_sink(sink.clone()).unwrap();

            let err = monitor.start().unwrap_err();
            assert!(
                matches!(&err, PipelineFault::Monitor(DriverError::Spawn { thread: t, .. }) if t == thread),
                "{}: {:?}",
                thread,
                err
            );
            assert!(monitor.assembler().is_stopped());
            assert!(!sink.is_active());
            assert!(sink.stopped_with_flush.lock().is_some());
            assert!(!monitor.is_running());
            assert!(monitor.wait_timeout(Duration::from_millis(10)));
            monitor.stop().unwrap();
        }
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut monitor = monitor_for(Vec::new());
        monitor.add_sink(CollectSink::new("sink", None)).unwrap();
        monitor.start().unwrap();
        assert!(monitor.is_running());
        monitor.stop().unwrap();
        monitor.stop().unwrap();
        assert!(!monitor.is_running());
        assert!(monitor.add_sink(CollectSink::new("late", None)).is_err());
    }
}
