use std::sync::Arc;

use crate::{
    activity::{Activity, Delivery, Origin},
    error::RelayError,
    lifecycle::ReadyState,
    observability::{Logger, PipelineStats},
};

use super::{RelayConfig, RelayHandler};

/// 写路径两端的防回声守卫。
///
/// # 教案式说明
/// - **意图 (Why)**：保证“每次本地写入恰好发布一次、每次中继写入零次发布”，这是多进程共享总线时
///   不出现回声环路的唯一前提；
/// - **逻辑 (How)**：
///   1. 出站：[`Self::on_outbound_write`] 拆开信封，无论来源如何都剥离旧版标记；仅当来源为本地且负载未
///      携带旧版标记时调用 `publish`；
///   2. 入站：[`Self::on_inbound_deliver`] 在 Closed 时丢弃，否则包装为 [`Delivery::relayed`] 交回写路径；
/// - **契约 (What)**：决策只依赖信封本身，不读取共享可变状态，因此并发的本地写入与中继投递互不干扰；
/// - **风险提示 (Trade-offs)**：`publish` 在交付链路前被等待，慢总线会拖慢写入确认。
pub struct RelayGuard {
    relay: RelayConfig,
    log: Arc<dyn Logger>,
    stats: Arc<PipelineStats>,
}

impl RelayGuard {
    pub fn new(relay: RelayConfig, log: Arc<dyn Logger>, stats: Arc<PipelineStats>) -> Self {
        Self { relay, log, stats }
    }

    pub fn namespace(&self) -> &str {
        self.relay.namespace()
    }

    /// 处理一次即将进入链路的写入，返回剥离标记后的 Activity。
    pub async fn on_outbound_write(&self, delivery: Delivery) -> Activity {
        let (mut activity, origin) = delivery.into_parts();
        let legacy_suppressed = activity.take_legacy_marker();
        let locally_originated = origin == Origin::Local && !legacy_suppressed;
        self.stats.record_write(locally_originated);

        if locally_originated {
            match self
                .relay
                .bus()
                .publish(self.relay.namespace(), &activity)
                .await
            {
                Ok(()) => self.stats.record_published(),
                Err(err) => {
                    self.stats.record_publish_failure();
                    self.log.warn(&format!("relay publish failed: {err}"));
                }
            }
        }

        activity
    }

    /// 决定一次总线投递是否进入写路径。
    ///
    /// - **契约 (What)**：`state` 为 Closed 时返回 `None` 并计入 `relay_dropped`，不产生错误。
    pub fn on_inbound_deliver(&self, state: ReadyState, activity: Activity) -> Option<Delivery> {
        if state == ReadyState::Closed {
            self.record_inbound_dropped("pipeline closed");
            return None;
        }
        Some(Delivery::relayed(activity))
    }

    fn record_inbound_dropped(&self, reason: &str) {
        self.stats.record_relay_dropped();
        tracing::debug!(
            target: "konduit::relay",
            namespace = self.relay.namespace(),
            reason,
            "discarded inbound relay delivery"
        );
    }

    pub(crate) fn subscribe(&self, handler: RelayHandler) -> Result<(), RelayError> {
        self.relay.bus().subscribe(self.relay.namespace(), handler)
    }
}
