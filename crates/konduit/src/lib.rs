//! `konduit` 聚焦提供稳定的 Pipeline 创建入口。
//!
//! # 教案式说明
//! - **意图（Why）**：调用方只依赖本 Crate 即可创建管线、声明 Stage 并接入中继总线，无需关心
//!   `konduit-core` 的模块划分；
//! - **逻辑（How）**：再导出核心类型，并提供 [`create_pipeline`] 与基于清单的
//!   [`DefaultPipelineFactory`]；
//! - **契约（What）**：本 Crate 不引入新的运行时语义，所有行为均由 `konduit-core` 定义；
//! - **风险与权衡（Trade-offs）**：再导出意味着版本需与核心同步更新。

pub use konduit_core::{
    Activity, ActivitySink, ConfigError, DEFAULT_NAMESPACE, Delivery, EmitOutcome, Emitter,
    Logger, MemoryRelayBus, MemoryRelayEndpoint, NoopRelayBus, Origin, PipeHandle, Pipeline,
    PipelineConfig, PipelineError, PipelineOptions, ReadyState, RelayBus, RelayError,
    RelayHandler, RelayOptions, StageError, StageErrorKind, StatsSnapshot, Subscription,
    TracingLogger, Transform, TransformError, ValveCatalog, ValveDescriptor, async_trait, map_fn,
    valve_fn,
};

mod factory;

pub use factory::{DefaultPipelineFactory, PipelineManifest};

/// 以默认值合并 `options` 并创建一条处于 Closed 状态的管线。
///
/// # 教案式说明
/// - **契约（What）**：每次调用都得到独立的配置快照；配置非法时返回
///   [`PipelineError::Config`]，总线订阅失败时返回 [`PipelineError::Relay`]；
/// - **前置条件**：使用带订阅任务的总线（如 [`MemoryRelayBus`]）时需在 Tokio 运行时内调用。
pub fn create_pipeline(options: PipelineOptions) -> Result<Pipeline, PipelineError> {
    Pipeline::new(options)
}
