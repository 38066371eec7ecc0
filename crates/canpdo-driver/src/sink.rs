//! 批次输出端接口

use crate::error::SinkError;
use canpdo_protocol::Batch;
use std::sync::Arc;

/// 批次输出端（日志文件、实时显示、远程镜像等）
///
/// 批次以 `Arc` 共享给所有输出端，输出端不得修改批次。
/// `put` 必须是非阻塞的：输入队列满时返回 [`SinkError::Backpressure`]，
/// 路由器随即把该输出端标记为不活跃。
pub trait BatchSink: Send + Sync {
    /// 用于日志和错误报告的名字
    fn name(&self) -> &str;

    /// 启动输出端（通常会启动自己的写线程）
    fn start(&self) -> Result<(), SinkError>;

    /// 投递一个批次（非阻塞）
    fn put(&self, batch: Arc<Batch>) -> Result<(), SinkError>;

    /// 是否仍在接收批次
    ///
    /// 输出端因结束条件或故障结束后返回 `false`。
    fn is_active(&self) -> bool;

    /// 停止输出端
    ///
    /// `flush == false` 丢弃尚在排队的批次；`flush == true` 先处理完队列。
    fn stop(&self, flush: bool) -> Result<(), SinkError>;

    /// 取出运行期间记录的致命错误
    fn take_fault(&self) -> Option<SinkError> {
        None
    }
}
