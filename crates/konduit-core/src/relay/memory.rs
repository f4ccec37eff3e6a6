//! 进程内参考总线。
//!
//! # 教案式说明
//! - **意图（Why）**：在单进程内模拟“多个进程共享一条总线”，用于演示与验证防回声语义，无需真实的
//!   消息中间件；
//! - **逻辑（How）**：[`MemoryRelayBus`] 维护命名空间到订阅端的映射；每个 [`MemoryRelayEndpoint`]
//!   代表一个“进程”，其 `publish` 只投递给同命名空间下的其他端点；每个订阅持有一个无界队列与一个
//!   泵任务，按发布顺序依次调用回调，回调报告订阅方已释放后泵任务退出并注销订阅；
//! - **契约（What）**：`subscribe` 需要在 Tokio 运行时上下文中调用，用于启动泵任务；
//! - **风险提示（Trade-offs）**：队列无界，慢订阅者会累积内存；仅适合测试与演示场景。

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{activity::Activity, error::RelayError};

use super::{RelayBus, RelayHandler};

type EndpointId = u64;

#[derive(Default)]
struct BusState {
    next_endpoint: EndpointId,
    subscribers: HashMap<String, Vec<(EndpointId, mpsc::UnboundedSender<Activity>)>>,
}

impl BusState {
    /// 清理接收端已释放的订阅，返回剩余数量。
    fn prune(&mut self, namespace: &str) -> usize {
        let Some(entries) = self.subscribers.get_mut(namespace) else {
            return 0;
        };
        entries.retain(|(_, tx)| !tx.is_closed());
        let remaining = entries.len();
        if remaining == 0 {
            self.subscribers.remove(namespace);
        }
        remaining
    }
}

/// 进程内共享总线，克隆后指向同一份订阅表。
#[derive(Clone, Default)]
pub struct MemoryRelayBus {
    state: Arc<Mutex<BusState>>,
}

impl MemoryRelayBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建一个新的端点，相当于接入总线的一个独立进程。
    pub fn endpoint(&self) -> MemoryRelayEndpoint {
        let mut state = self.state.lock();
        state.next_endpoint += 1;
        MemoryRelayEndpoint {
            id: state.next_endpoint,
            state: Arc::clone(&self.state),
        }
    }

    /// 指定命名空间下仍然存活的订阅数量。
    pub fn subscriber_count(&self, namespace: &str) -> usize {
        self.state.lock().prune(namespace)
    }
}

/// 总线上的单个端点。
#[derive(Clone)]
pub struct MemoryRelayEndpoint {
    id: EndpointId,
    state: Arc<Mutex<BusState>>,
}

#[async_trait]
impl RelayBus for MemoryRelayEndpoint {
    async fn publish(&self, namespace: &str, activity: &Activity) -> Result<(), RelayError> {
        let mut state = self.state.lock();
        if let Some(entries) = state.subscribers.get_mut(namespace) {
            // 已关闭的订阅在投递时顺带清理。
            entries.retain(|(endpoint, tx)| {
                *endpoint == self.id || tx.send(activity.clone()).is_ok()
            });
        }
        Ok(())
    }

    fn subscribe(&self, namespace: &str, handler: RelayHandler) -> Result<(), RelayError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|err| RelayError::Subscribe {
                namespace: namespace.to_owned(),
                detail: err.to_string(),
            })?;

        let (tx, mut rx) = mpsc::unbounded_channel::<Activity>();
        self.state
            .lock()
            .subscribers
            .entry(namespace.to_owned())
            .or_default()
            .push((self.id, tx));

        let state = Arc::clone(&self.state);
        let namespace = namespace.to_owned();
        runtime.spawn(async move {
            while let Some(activity) = rx.recv().await {
                if !handler(activity).await {
                    break;
                }
            }
            drop(rx);
            state.lock().prune(&namespace);
        });
        Ok(())
    }
}
