//! 管线输出侧：订阅、转接与扇出。
//!
//! # 教案式说明
//! - **意图（Why）**：以显式订阅取代无上限的监听者列表；每个订阅拥有有界队列，慢消费者通过背压
//!   拖慢终端 Stage，而不是无限堆积；
//! - **逻辑（How）**：[`OutputHub`] 保存订阅者发送端；终端转发任务对每个 Activity 按订阅顺序逐一
//!   发送，发送期间若管线关闭（代际推进）则立即放弃；
//! - **契约（What）**：
//!   - 同一订阅者收到的顺序即终端发出的顺序；
//!   - 无订阅者时输出被丢弃并计入 `unobserved`；
//!   - `close()` 清空全部订阅者，已有 [`Subscription`] 随后返回 `None`。

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use async_trait::async_trait;
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{
    activity::Activity, error::PipelineError, lifecycle::GenerationClock,
    observability::PipelineStats,
};

/// 订阅标识。
pub type SubscriptionId = u64;

#[derive(Default)]
struct HubState {
    next_id: SubscriptionId,
    subscribers: Vec<(SubscriptionId, mpsc::Sender<Activity>)>,
}

impl HubState {
    fn prune(&mut self) {
        self.subscribers.retain(|(_, tx)| !tx.is_closed());
    }
}

#[derive(Clone)]
pub(crate) struct OutputHub {
    state: Arc<Mutex<HubState>>,
    stats: Arc<PipelineStats>,
    capacity: usize,
}

impl OutputHub {
    pub(crate) fn new(capacity: usize, stats: Arc<PipelineStats>) -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState::default())),
            stats,
            capacity,
        }
    }

    pub(crate) fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.subscribers.push((id, tx));
        Subscription { id, rx }
    }

    pub(crate) fn remove(&self, id: SubscriptionId) -> bool {
        let mut state = self.state.lock();
        let before = state.subscribers.len();
        state.subscribers.retain(|(entry, _)| *entry != id);
        state.subscribers.len() != before
    }

    /// 移除全部订阅者，返回移除前仍存活的数量。
    pub(crate) fn clear(&self) -> usize {
        let mut state = self.state.lock();
        state.prune();
        let removed = state.subscribers.len();
        state.subscribers.clear();
        removed
    }

    pub(crate) fn len(&self) -> usize {
        let mut state = self.state.lock();
        state.prune();
        state.subscribers.len()
    }

    pub(crate) async fn broadcast(
        &self,
        activity: Activity,
        generation: u64,
        clock: &GenerationClock,
    ) {
        let targets = {
            let mut state = self.state.lock();
            state.prune();
            state.subscribers.clone()
        };
        if targets.is_empty() {
            self.stats.record_unobserved();
            return;
        }

        let mut closed = clock.watch();
        if *closed.borrow_and_update() != generation {
            self.stats.record_stale();
            return;
        }

        for (id, tx) in targets {
            tokio::select! {
                sent = tx.send(activity.clone()) => {
                    if sent.is_err() {
                        self.remove(id);
                    }
                }
                _ = closed.changed() => {
                    self.stats.record_stale();
                    return;
                }
            }
        }
        self.stats.record_emitted();
    }
}

/// 输出订阅，同时实现 [`Stream`]。
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::Receiver<Activity>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// 等待下一个输出；管线关闭或订阅被移除后返回 `None`。
    pub async fn recv(&mut self) -> Option<Activity> {
        self.rx.recv().await
    }
}

impl Stream for Subscription {
    type Item = Activity;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// 可作为 `pipe` 目标的外部消费者。
///
/// # 教案式说明
/// - **契约 (What)**：`accept` 完成即表示消费者已接收；返回错误后转接任务停止并自动解除订阅；
/// - **实现 (How)**：`tokio::sync::mpsc::Sender<Activity>` 与 [`Pipeline`](crate::Pipeline) 均已实现，
///   后者使多条管线可以首尾相接。
#[async_trait]
pub trait ActivitySink: Send + Sync + 'static {
    async fn accept(&self, activity: Activity) -> Result<(), PipelineError>;
}

#[async_trait]
impl ActivitySink for mpsc::Sender<Activity> {
    async fn accept(&self, activity: Activity) -> Result<(), PipelineError> {
        self.send(activity)
            .await
            .map_err(|_| PipelineError::SinkClosed)
    }
}

/// `pipe` 返回的句柄，用于 `unpipe`。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PipeHandle {
    id: SubscriptionId,
}

impl PipeHandle {
    pub(crate) fn new(id: SubscriptionId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}
