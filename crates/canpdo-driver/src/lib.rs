//! # canpdo Driver Layer
//!
//! 样本组装与批次分发：
//! - 帧组装状态机（预热、周期同步、帧顺序检查）
//! - 线程化的 [`SampleAssembler`]（有界输出队列，溢出致命）
//! - 批次过滤与线性校准
//! - [`Monitor`]：路由批次到各输出端，并在所有输出端结束后关闭流水线
//!
//! 流水线中的每一段都通过有界队列连接，任何一段跟不上都会以致命错误结束，
//! 不会静默丢弃数据。

mod assembler;
mod calibrate;
mod error;
pub mod metrics;
mod monitor;
mod sample_assembler;
mod sink;

pub use assembler::{AssemblerState, FrameAssembler};
pub use calibrate::{BatchFilter, Calibration, Calibrator};
pub use error::{DriverError, PipelineFault, SinkError};
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use monitor::{Monitor, MonitorConfig};
pub use sample_assembler::{AssemblerConfig, SampleAssembler};
pub use sink::BatchSink;
