//! 有界发送队列与入队背压
//!
//! 生产者通过 `enqueue` 入队：首次等待 `initial_wait`，每次超时翻倍直到 `max_wait`，
//! 累计等待超过 `budget` 时返回 `IpcError::Backpressure`。
//! 队列独立于连接存在，重连不会丢失已入队未发送的数据。

use crate::error::IpcError;
use edge_telemetry::record_backpressure_failure;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::time::Instant;
use tracing::warn;

/// 入队等待策略。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueuePolicy {
    pub initial_wait: Duration,
    pub max_wait: Duration,
    pub budget: Duration,
}

impl Default for EnqueuePolicy {
    fn default() -> Self {
        Self {
            initial_wait: Duration::from_millis(50),
            max_wait: Duration::from_millis(1000),
            budget: Duration::from_secs(65),
        }
    }
}

/// 按递增超时重试入队。
pub async fn enqueue<T>(
    sender: &mpsc::Sender<T>,
    item: T,
    policy: &EnqueuePolicy,
) -> Result<(), IpcError> {
    let started = Instant::now();
    let mut wait = policy.initial_wait;
    let mut item = item;

    loop {
        match sender.send_timeout(item, wait).await {
            Ok(()) => return Ok(()),
            Err(SendTimeoutError::Closed(_)) => return Err(IpcError::ChannelClosed),
            Err(SendTimeoutError::Timeout(returned)) => {
                item = returned;
                let waited = started.elapsed();
                if waited >= policy.budget {
                    record_backpressure_failure();
                    let waited_ms = waited.as_millis() as u64;
                    warn!(target: "edge.ipc", waited_ms, "enqueue_budget_exhausted");
                    return Err(IpcError::Backpressure { waited_ms });
                }
                wait = (wait * 2)
                    .min(policy.max_wait)
                    .min(policy.budget.saturating_sub(waited));
            }
        }
    }
}

/// 多生产者、单消费者的发送队列。
pub struct OutboundQueue<T> {
    sender: mpsc::Sender<T>,
    receiver: Mutex<mpsc::Receiver<T>>,
    /// 未确认送达而放回的数据，保持原顺序并优先于队列中的数据
    pending: Mutex<VecDeque<T>>,
    policy: EnqueuePolicy,
}

impl<T: Send> OutboundQueue<T> {
    pub fn new(capacity: usize, policy: EnqueuePolicy) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: Mutex::new(receiver),
            pending: Mutex::new(VecDeque::new()),
            policy,
        }
    }

    pub fn policy(&self) -> &EnqueuePolicy {
        &self.policy
    }

    pub async fn enqueue(&self, item: T) -> Result<(), IpcError> {
        enqueue(&self.sender, item, &self.policy).await
    }

    /// 取出下一条待发送数据。可在 `select!` 中取消而不丢数据。
    pub async fn next(&self) -> Option<T> {
        if let Some(item) = self.pending.lock().await.pop_front() {
            return Some(item);
        }
        self.receiver.lock().await.recv().await
    }

    /// 按原顺序放回一组数据，排在所有待发送数据之前。
    pub async fn requeue_all(&self, items: impl IntoIterator<Item = T>) {
        let mut pending = self.pending.lock().await;
        let items: Vec<T> = items.into_iter().collect();
        for item in items.into_iter().rev() {
            pending.push_front(item);
        }
    }

    /// 队列中（含放回的）数据条数。
    pub async fn len(&self) -> usize {
        let queued = self.sender.max_capacity() - self.sender.capacity();
        queued + self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_fails_after_budget() {
        let (sender, _receiver) = mpsc::channel::<u32>(1);
        sender.send(0).await.expect("fill");

        let policy = EnqueuePolicy::default();
        let started = Instant::now();
        let err = enqueue(&sender, 1, &policy).await.expect_err("queue is full");
        let elapsed = started.elapsed();

        assert!(matches!(err, IpcError::Backpressure { .. }));
        assert!(elapsed >= Duration::from_secs(65), "failed early after {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(66), "failed late after {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_succeeds_when_space_frees() {
        let (sender, mut receiver) = mpsc::channel::<u32>(1);
        sender.send(0).await.expect("fill");

        let consumer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let first = receiver.recv().await;
            let second = receiver.recv().await;
            (first, second)
        });

        enqueue(&sender, 1, &EnqueuePolicy::default())
            .await
            .expect("enqueued after space frees");
        assert_eq!(consumer.await.expect("join"), (Some(0), Some(1)));
    }

    #[tokio::test]
    async fn test_enqueue_closed_channel() {
        let (sender, receiver) = mpsc::channel::<u32>(1);
        drop(receiver);
        let err = enqueue(&sender, 1, &EnqueuePolicy::default())
            .await
            .expect_err("closed");
        assert!(matches!(err, IpcError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_requeued_item_comes_first() {
        let queue = OutboundQueue::new(4, EnqueuePolicy::default());
        queue.enqueue(1).await.expect("enqueue");
        queue.enqueue(2).await.expect("enqueue");

        let first = queue.next().await.expect("item");
        assert_eq!(first, 1);
        queue.requeue_all([first]).await;
        assert_eq!(queue.len().await, 2);

        assert_eq!(queue.next().await, Some(1));
        assert_eq!(queue.next().await, Some(2));
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_requeue_all_keeps_order_ahead_of_queue() {
        let queue = OutboundQueue::new(8, EnqueuePolicy::default());
        for item in 1..=4 {
            queue.enqueue(item).await.expect("enqueue");
        }
        let taken = vec![
            queue.next().await.expect("1"),
            queue.next().await.expect("2"),
            queue.next().await.expect("3"),
        ];
        queue.requeue_all(taken).await;
        assert_eq!(queue.len().await, 4);

        let mut order = Vec::new();
        while let Some(item) = tokio::time::timeout(Duration::from_millis(10), queue.next())
            .await
            .ok()
            .flatten()
        {
            order.push(item);
        }
        assert_eq!(order, vec![1, 2, 3, 4]);
    }
}
