//! 输出端的工作线程骨架
//!
//! 每个输出端有自己的有界输入队列和工作线程。`put` 非阻塞，队列满即背压；
//! `stop(flush)` 推入哨兵并在超时内等待线程退出。

use canpdo_can::{BoundedQueue, JoinTimeout};
use canpdo_driver::SinkError;
use canpdo_protocol::Batch;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{Span, debug, error, warn};

pub(crate) type BatchQueue = BoundedQueue<Arc<Batch>>;

pub(crate) struct SinkRunner {
    name: String,
    input: Arc<BatchQueue>,
    active: Arc<AtomicBool>,
    fault: Arc<Mutex<Option<SinkError>>>,
    started: AtomicBool,
    stopped: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    join_timeout: Duration,
    pub(crate) span: Span,
}

impl SinkRunner {
    pub(crate) fn new(name: String, queue_capacity: usize, join_timeout: Duration, span: Span) -> Self {
        Self {
            name,
            input: Arc::new(BoundedQueue::new(queue_capacity)),
            active: Arc::new(AtomicBool::new(false)),
            fault: Arc::new(Mutex::new(None)),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            worker: Mutex::new(None),
            join_timeout,
            span,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// 启动工作线程
    ///
    /// `body` 在输入队列收到哨兵或自行结束时返回；返回错误视为该输出端的致命故障。
    pub(crate) fn spawn<F>(&self, body: F) -> Result<(), SinkError>
    where
        F: FnOnce(&BatchQueue) -> Result<(), SinkError> + Send + 'static,
    {
        if self.stopped.load(Ordering::Acquire) || self.started.swap(true, Ordering::AcqRel) {
            return Err(SinkError::AlreadyStarted);
        }
        self.active.store(true, Ordering::Release);

        let input = self.input.clone();
        let active = self.active.clone();
        let fault = self.fault.clone();
        let span = self.span.clone();
        let name = self.name.clone();

        let handle = std::thread::Builder::new()
            .name(format!("canpdo-sink-{}", self.name))
            .spawn(move || {
                let _guard = span.enter();
                if let Err(e) = body(&input) {
                    error!("Sink {} failed: {}", name, e);
                    fault.lock().get_or_insert(e);
                }
                active.store(false, Ordering::Release);
                debug!("Sink {} thread exiting", name);
            })
            .map_err(|e| {
                self.active.store(false, Ordering::Release);
                SinkError::Write(format!("failed to spawn sink thread: {}", e))
            })?;

        *self.worker.lock() = Some(handle);
        Ok(())
    }

    /// 非阻塞投递
    pub(crate) fn put(&self, batch: Arc<Batch>) -> Result<(), SinkError> {
        if !self.started.load(Ordering::Acquire) {
            return Err(SinkError::NotStarted);
        }
        if !self.is_active() {
            return Ok(());
        }
        if let Err(full) = self.input.try_put(batch) {
            if self.input.is_closed() {
                return Ok(());
            }
            warn!("Sink {} input queue full", self.name);
            self.active.store(false, Ordering::Release);
            return Err(SinkError::Backpressure {
                sink: self.name.clone(),
                capacity: full.capacity,
            });
        }
        Ok(())
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// 停止（可重复调用）
    pub(crate) fn stop(&self, flush: bool) -> Result<(), SinkError> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _guard = self.span.enter();
        self.active.store(false, Ordering::Release);

        if !flush {
            let dropped = self.input.clear();
            if dropped > 0 {
                debug!("Sink {} discarded {} queued batches", self.name, dropped);
            }
        }
        self.input.put_sentinel();

        if let Some(handle) = self.worker.lock().take()
            && let Err(failure) = handle.join_timeout(self.join_timeout)
        {
            let err = SinkError::from_join(failure, &self.name, self.join_timeout);
            error!("{}", err);
            return Err(err);
        }
        Ok(())
    }

    pub(crate) fn take_fault(&self) -> Option<SinkError> {
        self.fault.lock().take()
    }

    /// 工作线程是否已经退出
    pub(crate) fn is_finished(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_none_or(JoinHandle::is_finished)
    }
}

impl Drop for SinkRunner {
    fn drop(&mut self) {
        if self.started.load(Ordering::Acquire)
            && let Err(e) = self.stop(false)
        {
            warn!("Sink {} failed to stop cleanly on drop: {}", self.name, e);
        }
    }
}
