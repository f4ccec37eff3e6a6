#![deny(unsafe_code)]
#![doc = "konduit-core: 双向 Activity 管线内核。"]
#![doc = ""]
#![doc = "== 组成 =="]
#![doc = "1. Valve / ValveChain：有序的异步变换 Stage，相邻 Stage 以有界通道串联；"]
#![doc = "2. LifecycleController：Closed/Open 状态机，负责装配、拆除与写入守卫；"]
#![doc = "3. RelayGuard：本地写入镜像到中继总线一次，总线回送的 Activity 永不再发布；"]
#![doc = "4. Pipeline：组合以上三者的对外实体。"]

pub mod activity;
pub mod catalog;
pub mod chain;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod observability;
pub mod output;
pub mod pipeline;
pub mod relay;
/// 测试桩命名空间，集中暴露记录型总线与日志，供单元测试与集成测试复用。
///
/// # 使用方式（How）
/// - 通过 `use konduit_core::test_stubs::RecordingRelayBus;` 等语句引入需要的桩类型；
/// - 桩对象均为 `Send + Sync`，可直接放入 `Arc` 交给 [`PipelineOptions`]。
pub mod test_stubs;
pub mod valve;

pub use async_trait::async_trait;

pub use activity::{Activity, Delivery, Origin, SUPPRESSION_MARKER};
pub use catalog::ValveCatalog;
pub use chain::ValveChain;
pub use config::{
    DEFAULT_CHANNEL_CAPACITY, DEFAULT_STAGE_CONCURRENCY, PipelineConfig, PipelineOptions,
    RelayOptions,
};
pub use error::{
    ConfigError, PipelineError, RelayError, StageError, StageErrorKind, TransformError,
};
pub use lifecycle::ReadyState;
pub use observability::{Logger, PipelineStats, StatsSnapshot, TracingLogger};
pub use output::{ActivitySink, PipeHandle, Subscription, SubscriptionId};
pub use pipeline::Pipeline;
pub use relay::{
    DEFAULT_NAMESPACE, MemoryRelayBus, MemoryRelayEndpoint, NoopRelayBus, RelayBus, RelayConfig,
    RelayGuard, RelayHandler,
};
pub use valve::{
    EmitOutcome, Emitter, FnValve, MapValve, Transform, Valve, ValveDescriptor, map_fn, valve_fn,
};
