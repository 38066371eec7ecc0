//! 驱动层错误类型定义

use canpdo_can::{CanError, JoinFailure};
use canpdo_protocol::ProtocolError;
use std::time::Duration;
use thiserror::Error;

/// 驱动层错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    /// 帧来源错误（溢出、线程错误等）
    #[error("CAN source error: {0}")]
    Can(#[from] CanError),

    /// 格式错误
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// 总线帧顺序错误（致命：需要重新预热同步）
    #[error(
        "Frame order error: received id 0x{received_id:X}, expected index {expected_index}, previous index {prev_index}"
    )]
    FrameOrder {
        received_id: u32,
        expected_index: usize,
        prev_index: usize,
    },

    /// 输出队列已满（下游跟不上，致命）
    #[error("Batch output queue overflow (capacity: {capacity})")]
    OutputOverflow { capacity: usize },

    /// 线程未在超时时间内退出（内部错误）
    #[error("Thread {thread} did not terminate within {timeout:?}")]
    ThreadJoinTimeout { thread: String, timeout: Duration },

    #[error("Thread {thread} panicked")]
    ThreadPanicked { thread: String },

    #[error("Already started")]
    AlreadyStarted,

    #[error("Not started")]
    NotStarted,

    #[error("Failed to spawn thread {thread}: {message}")]
    Spawn { thread: String, message: String },
}

impl DriverError {
    pub(crate) fn from_join(failure: JoinFailure, thread: &str, timeout: Duration) -> Self {
        match failure {
            JoinFailure::TimedOut => DriverError::ThreadJoinTimeout {
                thread: thread.to_string(),
                timeout,
            },
            JoinFailure::Panicked => DriverError::ThreadPanicked {
                thread: thread.to_string(),
            },
        }
    }
}

/// 输出端（sink）错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    /// 输入队列已满（该 sink 被标记为不活跃）
    #[error("Sink {sink} input queue full (capacity: {capacity})")]
    Backpressure { sink: String, capacity: usize },

    /// 记录开始后批次的通道集合发生变化
    #[error("Channel set changed after logging began: expected {expected} channels, got {actual}")]
    ChannelMismatch { expected: usize, actual: usize },

    /// 列数不变但通道名或原始值列与表头不一致
    #[error("Channel set changed after logging began: header [{expected}], batch [{actual}]")]
    HeaderMismatch { expected: String, actual: String },

    /// 批次中没有触发通道
    #[error("Trigger channel {channel} not found in batch")]
    UnknownTrigger { channel: String },

    /// 显示端跟不上，缓冲区溢出
    #[error("Live buffer overflow (capacity: {capacity})")]
    BufferOverflow { capacity: usize },

    #[error("Write error: {0}")]
    Write(String),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Thread {thread} did not terminate within {timeout:?}")]
    ThreadJoinTimeout { thread: String, timeout: Duration },

    #[error("Thread {thread} panicked")]
    ThreadPanicked { thread: String },

    #[error("Sink already started")]
    AlreadyStarted,

    #[error("Sink not started")]
    NotStarted,
}

impl SinkError {
    pub fn from_join(failure: JoinFailure, thread: &str, timeout: Duration) -> Self {
        match failure {
            JoinFailure::TimedOut => SinkError::ThreadJoinTimeout {
                thread: thread.to_string(),
                timeout,
            },
            JoinFailure::Panicked => SinkError::ThreadPanicked {
                thread: thread.to_string(),
            },
        }
    }
}

impl From<std::io::Error> for SinkError {
    fn from(e: std::io::Error) -> Self {
        SinkError::Write(e.to_string())
    }
}

/// 流水线致命错误（由 Monitor 汇总）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineFault {
    #[error("Frame source: {0}")]
    Source(CanError),

    #[error("Sample assembler: {0}")]
    Assembler(DriverError),

    #[error("Sink {name}: {error}")]
    Sink { name: String, error: SinkError },

    /// 路由/监督线程自身的错误
    #[error("Monitor: {0}")]
    Monitor(DriverError),
}

impl From<DriverError> for PipelineFault {
    fn from(e: DriverError) -> Self {
        match e {
            DriverError::Can(e) => PipelineFault::Source(e),
            other => PipelineFault::Assembler(other),
        }
    }
}
