//! 日志能力与运行计数。
//!
//! # 教案式说明
//! - **意图（Why）**：管线只需要 `info/warn/error` 三个级别的日志能力；以显式 Trait 表达后，
//!   能力缺失会在构造期（编译期）暴露，而不是在首次调用时才失败；
//! - **逻辑（How）**：默认实现 [`TracingLogger`] 直接转发到 `tracing`，宿主安装任意 `Subscriber`
//!   即可收集；[`PipelineStats`] 以原子计数记录发布、抑制、过期丢弃等关键事件；
//! - **契约（What）**：核心行为不依赖日志结果，Logger 实现不得阻塞。

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// 管线使用的日志能力。
pub trait Logger: Send + Sync + 'static {
    fn info(&self, message: &str);

    fn warn(&self, message: &str);

    fn error(&self, message: &str);
}

/// 转发到 `tracing` 的默认 Logger，事件 target 固定为 `konduit`。
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn info(&self, message: &str) {
        tracing::info!(target: "konduit", "{message}");
    }

    fn warn(&self, message: &str) {
        tracing::warn!(target: "konduit", "{message}");
    }

    fn error(&self, message: &str) {
        tracing::error!(target: "konduit", "{message}");
    }
}

/// 单个管线实例的运行计数。
///
/// # 教案式说明
/// - **意图 (Why)**：防回声不变量（本地写入发布一次、中继写入零次）与过期丢弃都需要可观测、可测试；
/// - **契约 (What)**：所有计数单调递增，使用 `Relaxed` 顺序，仅保证最终一致；需要一致视图时读取
///   [`StatsSnapshot`]。
#[derive(Debug, Default)]
pub struct PipelineStats {
    local_writes: AtomicU64,
    relay_writes: AtomicU64,
    published: AtomicU64,
    publish_failures: AtomicU64,
    relay_dropped: AtomicU64,
    stale_dropped: AtomicU64,
    emitted: AtomicU64,
    unobserved: AtomicU64,
    stage_failures: AtomicU64,
}

impl PipelineStats {
    pub(crate) fn record_write(&self, locally_originated: bool) {
        let counter = if locally_originated {
            &self.local_writes
        } else {
            &self.relay_writes
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_relay_dropped(&self) {
        self.relay_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stale(&self) {
        self.stale_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_emitted(&self) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unobserved(&self) {
        self.unobserved.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stage_failure(&self) {
        self.stage_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            local_writes: self.local_writes.load(Ordering::Relaxed),
            relay_writes: self.relay_writes.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            relay_dropped: self.relay_dropped.load(Ordering::Relaxed),
            stale_dropped: self.stale_dropped.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            unobserved: self.unobserved.load(Ordering::Relaxed),
            stage_failures: self.stage_failures.load(Ordering::Relaxed),
        }
    }
}

/// [`PipelineStats`] 的值快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// 本地发起的写入次数。
    pub local_writes: u64,
    /// 经中继投递后进入链路的写入次数。
    pub relay_writes: u64,
    /// 成功调用 `publish` 的次数。
    pub published: u64,
    pub publish_failures: u64,
    /// Closed 期间被丢弃的中继投递。
    pub relay_dropped: u64,
    /// 因 open/close 代际不匹配而显式丢弃的 Activity。
    pub stale_dropped: u64,
    /// 终端 Stage 交付到输出侧的 Activity。
    pub emitted: u64,
    /// 终端输出时没有任何订阅者。
    pub unobserved: u64,
    pub stage_failures: u64,
}
