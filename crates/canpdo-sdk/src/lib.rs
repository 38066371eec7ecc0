//! canpdo SDK - CAN PDO 数据采集
//!
//! 从 CAN 总线接收周期性 PDO 帧，按帧序重组为带时间的多通道样本，
//! 再分发给文件记录、实时显示等输出端。
//!
//! # 架构设计
//!
//! 从底层到高层：
//!
//! - **协议层** (`protocol`): 帧、编码（7Q8 / 单精度）、帧格式、样本与批次
//! - **CAN 层** (`can`): 帧来源、有界队列、虚拟发生器与回放
//! - **驱动层** (`driver`): 帧序状态机、组装线程、校准、Monitor 路由与监督
//! - **输出层** (`sinks`): 条件、CSV 记录、实时显示缓冲、远程镜像
//!
//! # 快速开始
//!
//! ```no_run
//! use canpdo_sdk::prelude::*;
//! use std::sync::Arc;
//!
//! canpdo_sdk::init_logging();
//!
//! let format = Arc::new(Format::default_format());
//! let producer = VirtualProducer::new((*format).clone(), VirtualConfig::default());
//! let source: Arc<dyn FrameSource> = Arc::new(Device::new(producer, DeviceConfig::default()));
//! let assembler = SampleAssembler::new(source, format, AssemblerConfig::default()).unwrap();
//!
//! let mut monitor = Monitor::new(assembler, MonitorConfig::default());
//! let logger = FileLogger::create("out.csv", None, Some(Condition::count(1000)), LoggerOptions::default()).unwrap();
//! monitor.add_sink(Arc::new(logger)).unwrap();
//! monitor.start().unwrap();
//! monitor.wait();
//! ```

pub use canpdo_can as can;
pub use canpdo_driver as driver;
pub use canpdo_protocol as protocol;
pub use canpdo_sinks as sinks;

pub mod prelude;

// --- 常用类型 ---

pub use canpdo_can::{CanError, FrameSource};
pub use canpdo_driver::{DriverError, Monitor, MonitorConfig, PipelineFault, SinkError};
pub use canpdo_protocol::{Batch, Format, PdoFrame, ProtocolError, Sample};

use tracing_subscriber::EnvFilter;

/// 未设置 `RUST_LOG` 时的默认过滤规则
pub const DEFAULT_LOG_FILTER: &str = "canpdo=info";

/// 安装全局日志订阅者
///
/// 使用 `RUST_LOG`（缺省 [`DEFAULT_LOG_FILTER`]），并把 `log` crate 的记录桥接到 `tracing`。
/// 重复调用无副作用，返回本次是否完成了安装。
pub fn init_logging() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return false;
    }
    // 订阅者已就位后再桥接 log，失败说明别处已经装过
    let _ = tracing_log::LogTracer::builder()
        .with_max_level(log::LevelFilter::Trace)
        .init();
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_idempotent() {
        init_logging();
        assert!(!init_logging());
        // 桥接后 log 宏不会 panic
        log::info!("log bridge installed");
    }
}
