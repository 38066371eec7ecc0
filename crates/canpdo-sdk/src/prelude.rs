//! Prelude - 常用类型的便捷导入
//!
//! ```rust
//! use canpdo_sdk::prelude::*;
//! ```

// 协议层
pub use crate::protocol::{Batch, Encoding, Format, FrameFormat, PdoFrame, Sample};

// 帧来源
pub use crate::can::{
    Device, DeviceConfig, FrameSource, ReplayProducer, VirtualConfig, VirtualProducer,
};

// 组装与路由
pub use crate::driver::{
    AssemblerConfig, BatchFilter, BatchSink, Calibration, Calibrator, Monitor, MonitorConfig,
    SampleAssembler,
};

// 输出端
pub use crate::sinks::{
    Condition, DisplayMode, Edge, EdgeTrigger, FileLogger, LiveBuffer, LiveScope, LoggerOptions,
    MirrorSink, ScopeSettings,
};

// 错误类型
pub use crate::can::CanError;
pub use crate::driver::{DriverError, PipelineFault, SinkError};
pub use crate::protocol::ProtocolError;
