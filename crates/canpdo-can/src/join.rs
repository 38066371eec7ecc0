//! 带超时的线程 join

use std::thread::{JoinHandle, spawn};
use std::time::Duration;

/// join 失败的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinFailure {
    /// 线程未在超时时间内退出
    TimedOut,
    /// 线程 panic
    Panicked,
}

/// Extension trait for timeout-capable thread joins
pub trait JoinTimeout {
    fn join_timeout(self, timeout: Duration) -> Result<(), JoinFailure>;
}

impl<T: Send + 'static> JoinTimeout for JoinHandle<T> {
    fn join_timeout(self, timeout: Duration) -> Result<(), JoinFailure> {
        let (tx, rx) = crossbeam_channel::bounded(1);

        // 看门狗线程负责真正的 join，超时后它会继续等待目标线程
        spawn(move || {
            let result = self.join();
            let _ = tx.send(result.is_ok());
        });

        match rx.recv_timeout(timeout) {
            Ok(true) => Ok(()),
            Ok(false) => Err(JoinFailure::Panicked),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Err(JoinFailure::TimedOut),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Err(JoinFailure::Panicked),
        }
    }
}
