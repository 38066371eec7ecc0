//! 带哨兵的有界队列
//!
//! 流水线各阶段之间的单生产者/单消费者 FIFO：
//! - `try_put` 非阻塞，队列满时立即失败
//! - `get` 阻塞，直到有数据或收到哨兵
//! - 底层通道比名义容量多一个槽位，专门留给哨兵，保证 `put_sentinel`
//!   总能唤醒被阻塞的消费者
//! - 收到哨兵后 `get` 恰好返回一次 `None`，之后也一直返回 `None`

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

/// 队列已满，退回未能入队的元素
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Queue full (capacity: {capacity})")]
pub struct QueueFull<T> {
    pub item: T,
    pub capacity: usize,
}

pub struct BoundedQueue<T> {
    tx: Sender<Option<T>>,
    rx: Receiver<Option<T>>,
    capacity: usize,
    /// 哨兵已推入
    closed: AtomicBool,
    /// 消费者已收到哨兵
    drained: AtomicBool,
}

impl<T> BoundedQueue<T> {
    /// 创建队列，`capacity` 为数据容量（至少为 1）
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity + 1);
        Self {
            tx,
            rx,
            capacity,
            closed: AtomicBool::new(false),
            drained: AtomicBool::new(false),
        }
    }

    /// 非阻塞入队
    ///
    /// 队列满或已关闭时返回 `QueueFull`（关闭后的数据不会被消费）。
    pub fn try_put(&self, item: T) -> Result<(), QueueFull<T>> {
        if self.closed.load(Ordering::Acquire) || self.tx.len() >= self.capacity {
            return Err(QueueFull {
                item,
                capacity: self.capacity,
            });
        }
        match self.tx.try_send(Some(item)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(Some(item))) | Err(TrySendError::Disconnected(Some(item))) => {
                Err(QueueFull {
                    item,
                    capacity: self.capacity,
                })
            },
            // try_send 只会退回我们传入的 Some
            Err(_) => Ok(()),
        }
    }

    /// 推入哨兵（可重复调用，只有第一次生效）
    ///
    /// 返回 `true` 表示本次调用推入了哨兵。
    pub fn put_sentinel(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        // 预留槽位保证哨兵总能入队
        let _ = self.tx.try_send(None);
        true
    }

    /// 阻塞出队，收到哨兵后返回 `None`
    pub fn get(&self) -> Option<T> {
        if self.drained.load(Ordering::Acquire) {
            return None;
        }
        match self.rx.recv() {
            Ok(Some(item)) => Some(item),
            Ok(None) | Err(_) => {
                self.drained.store(true, Ordering::Release);
                None
            },
        }
    }

    /// 带超时出队
    ///
    /// - `Ok(Some(item))`：取得数据
    /// - `Ok(None)`：已收到哨兵
    /// - `Err(RecvTimeoutError::Timeout)`：超时
    pub fn get_timeout(&self, timeout: Duration) -> Result<Option<T>, RecvTimeoutError> {
        if self.drained.load(Ordering::Acquire) {
            return Ok(None);
        }
        match self.rx.recv_timeout(timeout) {
            Ok(Some(item)) => Ok(Some(item)),
            Ok(None) | Err(RecvTimeoutError::Disconnected) => {
                self.drained.store(true, Ordering::Release);
                Ok(None)
            },
            Err(RecvTimeoutError::Timeout) => Err(RecvTimeoutError::Timeout),
        }
    }

    /// 当前排队元素数量（含哨兵）
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.tx.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 哨兵是否已推入
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 丢弃当前排队的所有数据（哨兵保留在队列语义中：已关闭的队列仍会返回 `None`）
    pub fn clear(&self) -> usize {
        let mut dropped = 0;
        while let Ok(item) = self.rx.try_recv() {
            match item {
                Some(_) => dropped += 1,
                None => {
                    self.drained.store(true, Ordering::Release);
                    break;
                },
            }
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_try_put_respects_capacity() {
        let queue = BoundedQueue::new(2);
        assert!(queue.try_put(1).is_ok());
        assert!(queue.try_put(2).is_ok());
        let err = queue.try_put(3).unwrap_err();
        assert_eq!(err.item, 3);
        assert_eq!(err.capacity, 2);
        assert!(queue.is_full());
    }

    #[test]
    fn test_sentinel_fits_in_full_queue() {
        let queue = BoundedQueue::new(2);
        queue.try_put(1).unwrap();
        queue.try_put(2).unwrap();
        assert!(queue.put_sentinel());
        assert_eq!(queue.get(), Some(1));
        assert_eq!(queue.get(), Some(2));
        assert_eq!(queue.get(), None);
    }

    #[test]
    fn test_none_is_sticky() {
        let queue: BoundedQueue<u32> = BoundedQueue::new(4);
        queue.put_sentinel();
        assert_eq!(queue.get(), None);
        assert_eq!(queue.get(), None);
        assert_eq!(queue.get_timeout(Duration::from_millis(1)), Ok(None));
    }

    #[test]
    fn test_put_sentinel_is_idempotent() {
        let queue: BoundedQueue<u32> = BoundedQueue::new(1);
        assert!(queue.put_sentinel());
        assert!(!queue.put_sentinel());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_put_after_close_is_rejected() {
        let queue = BoundedQueue::new(4);
        queue.put_sentinel();
        assert!(queue.try_put(1).is_err());
    }

    #[test]
    fn test_sentinel_wakes_blocked_consumer() {
        let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(4));
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.get())
        };
        thread::sleep(Duration::from_millis(20));
        queue.put_sentinel();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn test_get_timeout_expires() {
        let queue: BoundedQueue<u32> = BoundedQueue::new(4);
        assert_eq!(
            queue.get_timeout(Duration::from_millis(5)),
            Err(RecvTimeoutError::Timeout)
        );
    }

    #[test]
    fn test_clear() {
        let queue = BoundedQueue::new(4);
        queue.try_put(1).unwrap();
        queue.try_put(2).unwrap();
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }
}
