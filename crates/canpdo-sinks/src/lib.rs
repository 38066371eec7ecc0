//! # canpdo Sinks
//!
//! 批次的下游输出端，全部实现 [`canpdo_driver::BatchSink`]：
//!
//! - [`FileLogger`]：按开始/结束条件把批次写成 CSV
//! - [`LiveScope`]：经触发门控写入 [`LiveBuffer`] 供显示端读取
//! - [`MirrorSink`]：把显示配置和批次转发到另一进程
//!
//! 每个输出端有独立的输入队列和工作线程，一个输出端跟不上只会让它自己失活。

pub mod condition;
pub mod live_buffer;
pub mod logger;
pub mod mirror;
mod runner;
pub mod scope;

pub use condition::{Condition, CountCondition, Edge, EdgeTrigger, ElapsedCondition};
pub use live_buffer::{DisplayMode, LiveBuffer, LiveView, TIME_CHANNEL};
pub use logger::{FileLogger, LoggerOptions};
pub use mirror::{MessageKind, MirrorDecoder, MirrorError, MirrorMessage, MirrorSink};
pub use scope::{LiveScope, ScopeSettings, Timebase, YRange};
