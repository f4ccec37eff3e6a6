//! Pipeline：把 Valve 链、生命周期与防回声中继组合为单一的双向实体。
//!
//! # 教案式说明
//! - **意图（Why）**：调用方只面对一个对象：写入 Activity、订阅变换结果、把结果转接给外部消费者，
//!   中继镜像在背后透明完成；
//! - **逻辑（How）**：
//!   1. `write` → 生命周期写入守卫 → [`RelayGuard::on_outbound_write`]（可能发布）→ 链首；
//!   2. 总线入站 → [`RelayGuard::on_inbound_deliver`]（Closed 时丢弃）→ 同一写路径，但永不发布；
//!   3. 末级输出 → 输出侧扇出 → [`Subscription`] / `pipe` 目标；
//! - **契约（What）**：`Pipeline` 是 `Arc` 句柄，克隆廉价；总线回调只持有弱引用，实例释放后回调返回
//!   `false`，由总线注销订阅；
//! - **风险与权衡（Trade-offs）**：`write` 的完成仅表示链首已受理（流控确认），不代表处理完成。

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::{
    activity::{Activity, Delivery},
    chain::ChainDeps,
    config::{PipelineConfig, PipelineOptions},
    error::{PipelineError, StageError},
    lifecycle::{LifecycleController, ReadyState},
    observability::{PipelineStats, StatsSnapshot},
    output::{ActivitySink, OutputHub, PipeHandle, Subscription},
    relay::{RelayGuard, RelayHandler},
    valve::{Tagged, Transform},
};

/// Stage 错误广播通道的容量，落后的接收者会收到 `Lagged`。
const STAGE_ERROR_BACKLOG: usize = 64;

struct PipelineInner {
    config: PipelineConfig,
    lifecycle: LifecycleController,
    guard: RelayGuard,
    output: OutputHub,
    stats: Arc<PipelineStats>,
    errors: broadcast::Sender<StageError>,
}

/// Activity 管线。
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    /// 合并选项并构造管线；构造期即向中继总线注册入站订阅。
    pub fn new(options: PipelineOptions) -> Result<Self, PipelineError> {
        Self::with_config(PipelineConfig::resolve(options)?)
    }

    pub fn with_config(config: PipelineConfig) -> Result<Self, PipelineError> {
        let stats = Arc::new(PipelineStats::default());
        let guard = RelayGuard::new(
            config.relay().clone(),
            Arc::clone(config.log()),
            Arc::clone(&stats),
        );
        let output = OutputHub::new(config.channel_capacity(), Arc::clone(&stats));
        let (errors, _) = broadcast::channel(STAGE_ERROR_BACKLOG);

        let inner = Arc::new(PipelineInner {
            config,
            lifecycle: LifecycleController::new(),
            guard,
            output,
            stats,
            errors,
        });
        inner.guard.subscribe(inbound_handler(Arc::downgrade(&inner)))?;

        Ok(Self { inner })
    }

    /// 追加一个 Stage，返回追加后的 Stage 数量。
    pub fn use_valve(&self, transform: impl Transform) -> Result<usize, PipelineError> {
        self.use_shared(Arc::new(transform))
    }

    pub fn use_shared(&self, transform: Arc<dyn Transform>) -> Result<usize, PipelineError> {
        self.inner.lifecycle.register(transform)
    }

    /// 按动态描述从目录中解析 Stage 并追加。
    pub fn use_spec(&self, spec: &Value) -> Result<usize, PipelineError> {
        let transform = self.inner.config.catalog().resolve(spec)?;
        self.use_shared(transform)
    }

    pub fn use_named(&self, name: &str) -> Result<usize, PipelineError> {
        self.use_spec(&Value::String(name.to_owned()))
    }

    /// 装配链路并进入 Open。
    pub fn open(&self) -> Result<&Self, PipelineError> {
        let deps = ChainDeps {
            stats: Arc::clone(&self.inner.stats),
            log: Arc::clone(self.inner.config.log()),
            errors: self.inner.errors.clone(),
            output: self.inner.output.clone(),
            capacity: self.inner.config.channel_capacity(),
            concurrency: self.inner.config.stage_concurrency(),
        };
        let stages = self.inner.lifecycle.open(deps)?;
        self.inner.config.log().info(&format!(
            "pipeline opened with {stages} valve(s) on `{}`",
            self.inner.config.namespace()
        ));
        Ok(self)
    }

    /// 拆除链路、移除全部输出监听者并进入 Closed；不取消在途的变换。
    pub fn close(&self) -> Result<&Self, PipelineError> {
        let detached = self.inner.lifecycle.close(&self.inner.output)?;
        self.inner.config.log().info(&format!(
            "pipeline closed; detached {} link(s) and {} listener(s)",
            detached.links, detached.listeners
        ));
        Ok(self)
    }

    /// 本地写入：发布到中继总线一次，然后交给链首。
    ///
    /// 发布期间被关闭时写入仍返回 `Ok`，该 Activity 携带旧代际，由链路计入 `stale_dropped`。
    pub async fn write(&self, activity: Activity) -> Result<(), PipelineError> {
        let (head, generation) = self.inner.lifecycle.assert_open_for_write()?;
        self.forward(head, generation, Delivery::local(activity)).await
    }

    async fn forward(
        &self,
        head: mpsc::Sender<Tagged>,
        generation: u64,
        delivery: Delivery,
    ) -> Result<(), PipelineError> {
        let activity = self.inner.guard.on_outbound_write(delivery).await;
        head.send(Tagged {
            activity,
            generation,
        })
        .await
        .map_err(|_| PipelineError::ClosedPipeline)
    }

    async fn on_inbound(&self, activity: Activity) {
        // 状态判定与链首获取在同一次加锁内完成；其后发生的关闭由代际标记处理。
        let Ok((head, generation)) = self.inner.lifecycle.assert_open_for_write() else {
            self.inner.guard.on_inbound_deliver(ReadyState::Closed, activity);
            return;
        };
        let Some(delivery) = self
            .inner
            .guard
            .on_inbound_deliver(ReadyState::Open, activity)
        else {
            return;
        };
        // 入站投递不向总线回报错误。
        let _ = self.forward(head, generation, delivery).await;
    }

    /// 订阅终端输出。
    pub fn subscribe(&self) -> Subscription {
        self.inner.output.subscribe()
    }

    /// 把输出转接给外部消费者，返回用于 `unpipe` 的句柄。
    pub fn pipe<S: ActivitySink>(&self, sink: S) -> Result<PipeHandle, PipelineError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| PipelineError::RuntimeUnavailable)?;
        let mut subscription = self.subscribe();
        let handle = PipeHandle::new(subscription.id());
        let log = Arc::clone(self.inner.config.log());

        runtime.spawn(async move {
            while let Some(activity) = subscription.recv().await {
                if let Err(err) = sink.accept(activity).await {
                    log.warn(&format!("pipe target rejected activity, unpiping: {err}"));
                    break;
                }
            }
        });
        Ok(handle)
    }

    /// 解除转接；句柄已失效时返回 `false`。
    pub fn unpipe(&self, handle: PipeHandle) -> bool {
        self.inner.output.remove(handle.id())
    }

    /// 订阅 Stage 执行失败。
    pub fn stage_errors(&self) -> broadcast::Receiver<StageError> {
        self.inner.errors.subscribe()
    }

    pub fn ready_state(&self) -> ReadyState {
        self.inner.lifecycle.ready_state()
    }

    pub fn is_open(&self) -> bool {
        self.ready_state() == ReadyState::Open
    }

    pub fn stage_count(&self) -> usize {
        self.inner.lifecycle.stage_count()
    }

    pub fn stage_labels(&self) -> Vec<String> {
        self.inner.lifecycle.labels()
    }

    /// 当前 open/close 代际，每次 `open` 与 `close` 各自增一次。
    pub fn generation(&self) -> u64 {
        self.inner.lifecycle.generation()
    }

    /// 仍然注册着的监听者：输出订阅（含 `pipe`）加上链路内部链接。
    pub fn listener_count(&self) -> usize {
        self.inner.output.len() + self.inner.lifecycle.link_count()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn namespace(&self) -> &str {
        self.inner.guard.namespace()
    }
}

#[async_trait]
impl ActivitySink for Pipeline {
    async fn accept(&self, activity: Activity) -> Result<(), PipelineError> {
        self.write(activity).await
    }
}

fn inbound_handler(inner: Weak<PipelineInner>) -> RelayHandler {
    Arc::new(move |activity: Activity| {
        let inner = inner.clone();
        async move {
            let Some(inner) = inner.upgrade() else {
                return false;
            };
            Pipeline { inner }.on_inbound(activity).await;
            true
        }
        .boxed()
    })
}
