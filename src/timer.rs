//! 定时器设施
//! Timer facility
//!
//! 速率控制器只需要一个“触发一次”的定时器（无反馈定时器）。该模块定义了
//! 定时器抽象以及基于 tokio 任务的实现，超时事件通过 mpsc 通道投递回
//! 连接自己的事件循环，从而保持每个连接状态的串行修改。
//!
//! The rate controller only needs a fire-once timer (the no-feedback timer).
//! This module defines the timer abstraction and a tokio-task based
//! implementation. Expirations are delivered as [`TimerEvent`]s over an mpsc
//! channel back into the connection's own event loop, which keeps mutation of
//! a connection's state serialized.

use crate::connection::ConnectionId;
use crate::error::{CollaboratorError, Result};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

/// 定时器句柄，用于取消已安排的定时器
/// Timer handle, used to cancel a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(pub u64);

/// 定时器事件类型
/// Timer event types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// The sender's no-feedback timer expired.
    /// 发送方的无反馈定时器到期。
    NoFeedback,
}

/// 定时器事件数据
/// Timer event data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEventData {
    pub connection: ConnectionId,
    pub handle: TimerHandle,
    pub event: TimerEvent,
}

/// The abstract timer facility consumed by the rate controller.
///
/// 速率控制器使用的抽象定时器设施。
pub trait TimerFacility: Send + Sync + 'static {
    /// Arranges for `event` to be delivered for `connection` after `delay`.
    ///
    /// 安排在 `delay` 之后为 `connection` 投递 `event`。
    fn schedule(
        &self,
        connection: ConnectionId,
        delay: Duration,
        event: TimerEvent,
    ) -> Result<TimerHandle>;

    /// Cancels a timer. Cancelling an expired or unknown handle is a no-op.
    ///
    /// 取消定时器。取消已到期或未知的句柄不做任何事。
    fn cancel(&self, handle: TimerHandle);
}

/// A [`TimerFacility`] backed by one tokio task per pending timer.
///
/// 基于 tokio 任务的 [`TimerFacility`]，每个挂起的定时器对应一个任务。
#[derive(Debug, Clone)]
pub struct TokioTimer {
    inner: Arc<TokioTimerInner>,
}

#[derive(Debug)]
struct TokioTimerInner {
    events: mpsc::Sender<TimerEventData>,
    pending: DashMap<TimerHandle, Option<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl TokioTimer {
    /// 创建新的定时器及其事件接收端
    /// Create a new timer and the receiving end of its events
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TimerEventData>) {
        let (events, rx) = mpsc::channel(capacity);
        let timer = Self {
            inner: Arc::new(TokioTimerInner {
                events,
                pending: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        };
        (timer, rx)
    }

    /// 当前挂起的定时器数量
    /// Number of currently pending timers
    pub fn pending(&self) -> usize {
        self.inner.pending.len()
    }
}

impl TimerFacility for TokioTimer {
    fn schedule(
        &self,
        connection: ConnectionId,
        delay: Duration,
        event: TimerEvent,
    ) -> Result<TimerHandle> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| CollaboratorError::TimerUnavailable)?;

        let handle = TimerHandle(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        // Registered before spawning so a zero delay cannot outrun the bookkeeping.
        self.inner.pending.insert(handle, None);
        let inner = self.inner.clone();
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            // Only deliver if nobody cancelled us in the meantime.
            if inner.pending.remove(&handle).is_none() {
                return;
            }
            let data = TimerEventData {
                connection,
                handle,
                event,
            };
            if let Err(e) = inner.events.try_send(data) {
                warn!(connection, "Failed to deliver timer event: {:?}", e);
            }
        });
        if let Some(mut slot) = self.inner.pending.get_mut(&handle) {
            *slot = Some(task);
        }

        trace!(connection, ?delay, ?event, handle = handle.0, "Timer scheduled");
        Ok(handle)
    }

    fn cancel(&self, handle: TimerHandle) {
        if let Some((_, task)) = self.inner.pending.remove(&handle) {
            if let Some(task) = task {
                task.abort();
            }
            trace!(handle = handle.0, "Timer cancelled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_once() {
        let (timer, mut rx) = TokioTimer::new(8);
        let handle = timer
            .schedule(3, Duration::from_millis(100), TimerEvent::NoFeedback)
            .unwrap();
        assert_eq!(timer.pending(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let data = rx.recv().await.unwrap();
        assert_eq!(data.connection, 3);
        assert_eq!(data.handle, handle);
        assert_eq!(data.event, TimerEvent::NoFeedback);
        assert_eq!(timer.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let (timer, mut rx) = TokioTimer::new(8);
        let handle = timer
            .schedule(1, Duration::from_millis(100), TimerEvent::NoFeedback)
            .unwrap();
        timer.cancel(handle);
        // Cancelling twice is harmless.
        timer.cancel(handle);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(timer.pending(), 0);
    }

    #[test]
    fn test_schedule_without_runtime_fails() {
        let (timer, _rx) = TokioTimer::new(1);
        let result = timer.schedule(1, Duration::from_secs(1), TimerEvent::NoFeedback);
        assert!(matches!(
            result,
            Err(Error::CollaboratorFailure(CollaboratorError::TimerUnavailable))
        ));
    }
}
