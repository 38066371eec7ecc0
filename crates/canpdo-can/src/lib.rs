//! # canpdo CAN Source Layer
//!
//! 帧来源抽象层：适配器（硬件驱动或虚拟发生器）只负责把帧推入有界队列，
//! 消费者通过 [`FrameSource::next_frame`] 阻塞拉取。
//!
//! ## 溢出策略
//!
//! 队列满时 `push` 立即失败，不会阻塞生产者线程。溢出对帧来源是致命的：
//! 记录 [`CanError::Overflow`]、停止生产、推入哨兵唤醒消费者。

use std::time::Duration;
use thiserror::Error;

// 重新导出 canpdo-protocol 中的 PdoFrame
pub use canpdo_protocol::PdoFrame;

mod device;
mod join;
mod queue;
mod rate;
pub mod replay;
pub mod virtual_producer;

pub use device::{Device, DeviceConfig, FrameProducer, ProducerContext};
pub use join::{JoinFailure, JoinTimeout};
pub use queue::{BoundedQueue, QueueFull};
pub use rate::{FrameRate, FrameRateStats};
pub use replay::ReplayProducer;
pub use virtual_producer::{VirtualConfig, VirtualProducer, waveform};

/// 帧来源层统一错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CanError {
    /// 帧队列已满（致命：帧来源被停止）
    #[error("Frame queue overflow (capacity: {capacity})")]
    Overflow { capacity: usize },

    #[error("Frame source already started")]
    AlreadyStarted,

    #[error("Frame source not started")]
    NotStarted,

    #[error("Frame source already stopped")]
    Stopped,

    /// 线程未在超时时间内退出（内部错误）
    #[error("Thread {thread} did not terminate within {timeout:?}")]
    ThreadJoinTimeout { thread: String, timeout: Duration },

    #[error("Thread {thread} panicked")]
    ThreadPanicked { thread: String },

    #[error("Failed to spawn thread {thread}: {message}")]
    Spawn { thread: String, message: String },
}

impl CanError {
    /// 将 join 失败转换为错误
    pub fn from_join(failure: JoinFailure, thread: &str, timeout: Duration) -> Self {
        match failure {
            JoinFailure::TimedOut => CanError::ThreadJoinTimeout {
                thread: thread.to_string(),
                timeout,
            },
            JoinFailure::Panicked => CanError::ThreadPanicked {
                thread: thread.to_string(),
            },
        }
    }
}

/// 帧来源契约
///
/// 所有方法都接受 `&self`，实现者内部负责同步，因此同一实例可以在
/// 控制线程（`start`/`stop`）与消费线程（`next_frame`）之间共享。
///
/// - `next_frame` 阻塞直到有帧或来源被停止；停止后恰好返回一次 `None`，
///   之后的调用也都返回 `None`
/// - `stop` 必须推入哨兵唤醒被阻塞的消费者，且可重复调用
pub trait FrameSource: Send + Sync {
    /// 启动帧来源
    fn start(&self) -> Result<(), CanError>;

    /// 停止帧来源并等待内部线程退出
    fn stop(&self) -> Result<(), CanError>;

    /// 阻塞获取下一帧
    fn next_frame(&self) -> Option<PdoFrame>;

    /// 取出运行期间记录的致命错误（如溢出）
    fn take_fault(&self) -> Option<CanError> {
        None
    }
}
