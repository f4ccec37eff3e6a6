//! 中继总线契约。
//!
//! # 教案式说明
//! - **意图（Why）**：多个进程共享同一发布/订阅通道时，需要把本地写入镜像到总线，同时阻止总线回送的
//!   Activity 被再次发布，形成回声环路；
//! - **逻辑（How）**：[`RelayBus`] 只描述“发布”与“订阅”两个能力，具体传输与序列化由实现者负责；
//!   [`RelayGuard`] 在写路径两端做出是否发布的决定；
//! - **契约（What）**：`subscribe` 在管线构造时调用一次，即使管线尚处于 Closed；Closed 期间的投递被丢弃。

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::{activity::Activity, error::RelayError};

mod guard;
mod memory;

pub use guard::RelayGuard;
pub use memory::{MemoryRelayBus, MemoryRelayEndpoint};

/// 默认的共享通道命名空间。
pub const DEFAULT_NAMESPACE: &str = "com.konduit.pipeline";

/// 总线入站回调；返回的 Future 完成即表示该 Activity 已交给管线写路径。
///
/// 结果为 `false` 表示订阅方已经释放，总线应当注销该订阅并停止投递。
pub type RelayHandler = Arc<dyn Fn(Activity) -> BoxFuture<'static, bool> + Send + Sync>;

/// 外部发布/订阅传输的能力契约。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - `publish` 每次本地写入恰好调用一次；返回错误只会被记录，不影响本地投递；
///   - `subscribe` 注册入站回调，实现方应按发布顺序依次调用回调并等待其完成；回调返回 `false`
///     后不得再调用它；
/// - **风险提示 (Trade-offs)**：实现若在 `publish` 中同步回调同一进程的订阅者，会造成自投递；
///   参考 [`MemoryRelayEndpoint`]，只向其他端点投递。
#[async_trait]
pub trait RelayBus: Send + Sync + 'static {
    async fn publish(&self, namespace: &str, activity: &Activity) -> Result<(), RelayError>;

    fn subscribe(&self, namespace: &str, handler: RelayHandler) -> Result<(), RelayError>;
}

/// 默认总线：发布与订阅都是空操作。
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopRelayBus;

#[async_trait]
impl RelayBus for NoopRelayBus {
    async fn publish(&self, _namespace: &str, _activity: &Activity) -> Result<(), RelayError> {
        Ok(())
    }

    fn subscribe(&self, _namespace: &str, _handler: RelayHandler) -> Result<(), RelayError> {
        Ok(())
    }
}

/// 中继能力包：总线实现与命名空间，构造后对单个管线不可变。
#[derive(Clone)]
pub struct RelayConfig {
    bus: Arc<dyn RelayBus>,
    namespace: Arc<str>,
}

impl RelayConfig {
    pub fn new(bus: Arc<dyn RelayBus>, namespace: impl Into<Arc<str>>) -> Self {
        Self {
            bus,
            namespace: namespace.into(),
        }
    }

    pub fn bus(&self) -> &Arc<dyn RelayBus> {
        &self.bus
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::new(Arc::new(NoopRelayBus), DEFAULT_NAMESPACE)
    }
}

impl fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConfig")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}
