//! Valve：链路中的单个变换 Stage。
//!
//! # 教案式说明
//! - **意图（Why）**：把用户提供的变换函数包装为统一的 [`Transform`] 契约，链路只关心“收一个、
//!   发零到多个、完成一次”；
//! - **逻辑（How）**：`transform` 返回即视为该输入的延续已发出；输出通过 [`Emitter`] 发送，可以在返回
//!   之前，也可以把 `Emitter` 移入延迟任务、在返回之后发送；
//! - **契约（What）**：Valve 的身份就是它在链上的下标；除变换函数闭包捕获的状态外不持有任何状态；
//! - **风险与权衡（Trade-offs）**：延迟发送在 `close()` 之后到达时会被判定为过期并显式丢弃，
//!   参见 [`EmitOutcome::Stale`]。

use std::{borrow::Cow, future::Future, sync::Arc};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    activity::Activity, error::TransformError, lifecycle::GenerationClock,
    observability::PipelineStats,
};

/// Valve 的描述信息，用于日志与错误定位。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValveDescriptor {
    label: Cow<'static, str>,
}

impl ValveDescriptor {
    pub fn new(label: impl Into<Cow<'static, str>>) -> Self {
        Self {
            label: label.into(),
        }
    }

    pub fn anonymous() -> Self {
        Self::new("anonymous")
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn into_label(self) -> Cow<'static, str> {
        self.label
    }
}

/// 单个 Stage 的变换契约。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - 每个输入恰好调用一次 `transform`，返回（无论成败）即表示该 Stage 可以受理下一个输入；
///   - 返回 `Err` 时链路包装为 [`StageError`](crate::error::StageError) 广播并继续处理后续输入；
///   - 实现必须 `Send + Sync + 'static`，同一实例可能在并发度大于 1 时被并行调用；
/// - **风险提示 (Trade-offs)**：忘记调用 `emit` 不会阻塞链路，但对应的 Activity 在该 Stage 被静默吸收。
#[async_trait]
pub trait Transform: Send + Sync + 'static {
    fn describe(&self) -> ValveDescriptor {
        ValveDescriptor::anonymous()
    }

    async fn transform(&self, activity: Activity, emitter: Emitter) -> Result<(), TransformError>;
}

#[async_trait]
impl<T: Transform + ?Sized> Transform for Arc<T> {
    fn describe(&self) -> ValveDescriptor {
        (**self).describe()
    }

    async fn transform(&self, activity: Activity, emitter: Emitter) -> Result<(), TransformError> {
        (**self).transform(activity, emitter).await
    }
}

/// 由异步闭包构成的 Transform，见 [`valve_fn`]。
pub struct FnValve<F> {
    f: F,
    label: Option<Cow<'static, str>>,
}

impl<F> FnValve<F> {
    pub fn named(mut self, label: impl Into<Cow<'static, str>>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// 以 `Fn(Activity, Emitter) -> Future` 构造 Valve。
pub fn valve_fn<F, Fut>(f: F) -> FnValve<F>
where
    F: Fn(Activity, Emitter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TransformError>> + Send + 'static,
{
    FnValve { f, label: None }
}

#[async_trait]
impl<F, Fut> Transform for FnValve<F>
where
    F: Fn(Activity, Emitter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TransformError>> + Send + 'static,
{
    fn describe(&self) -> ValveDescriptor {
        match &self.label {
            Some(label) => ValveDescriptor::new(label.clone()),
            None => ValveDescriptor::anonymous(),
        }
    }

    async fn transform(&self, activity: Activity, emitter: Emitter) -> Result<(), TransformError> {
        (self.f)(activity, emitter).await
    }
}

/// 同步一进一出映射，见 [`map_fn`]。
pub struct MapValve<F> {
    f: F,
    label: Option<Cow<'static, str>>,
}

impl<F> MapValve<F> {
    pub fn named(mut self, label: impl Into<Cow<'static, str>>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// 以同步函数构造一进一出的 Valve。
pub fn map_fn<F>(f: F) -> MapValve<F>
where
    F: Fn(Activity) -> Activity + Send + Sync + 'static,
{
    MapValve { f, label: None }
}

#[async_trait]
impl<F> Transform for MapValve<F>
where
    F: Fn(Activity) -> Activity + Send + Sync + 'static,
{
    fn describe(&self) -> ValveDescriptor {
        match &self.label {
            Some(label) => ValveDescriptor::new(label.clone()),
            None => ValveDescriptor::new("map"),
        }
    }

    async fn transform(&self, activity: Activity, emitter: Emitter) -> Result<(), TransformError> {
        emitter.emit((self.f)(activity)).await;
        Ok(())
    }
}

/// 链上已注册的 Stage。
pub struct Valve {
    position: usize,
    label: Cow<'static, str>,
    transform: Arc<dyn Transform>,
}

impl Valve {
    pub(crate) fn new(position: usize, transform: Arc<dyn Transform>) -> Self {
        let label = transform.describe().into_label();
        Self {
            position,
            label,
            transform,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn label_owned(&self) -> Cow<'static, str> {
        self.label.clone()
    }

    pub(crate) fn transformer(&self) -> &Arc<dyn Transform> {
        &self.transform
    }
}

/// 链路内部传递的 Activity，携带写入时的 open/close 代际。
#[derive(Debug)]
pub(crate) struct Tagged {
    pub(crate) activity: Activity,
    pub(crate) generation: u64,
}

/// 一次发送的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmitOutcome {
    /// 已交给下游 Stage 或输出侧。
    Forwarded,
    /// 发送时管线已经关闭或重开，Activity 被显式丢弃。
    Stale,
    /// 下游已拆除，无人接收。
    Detached,
}

/// Stage 的输出句柄（即该输入的延续）。
///
/// # 教案式说明
/// - **意图 (Why)**：允许 Transform 在挂起之后恢复发送，而不阻塞其他 Activity 的投递；
/// - **逻辑 (How)**：句柄记录输入时刻的代际；发送前与代际时钟比对，不一致即判定过期；
/// - **契约 (What)**：`emit` 经由有界通道发送，下游饱和时等待，从而把背压传回上游；
/// - **风险提示 (Trade-offs)**：句柄可被克隆并长期持有，持有期间下游通道不会被释放。
#[derive(Clone)]
pub struct Emitter {
    position: usize,
    generation: u64,
    clock: GenerationClock,
    downstream: mpsc::Sender<Tagged>,
    stats: Arc<PipelineStats>,
}

impl Emitter {
    pub(crate) fn new(
        position: usize,
        generation: u64,
        clock: GenerationClock,
        downstream: mpsc::Sender<Tagged>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            position,
            generation,
            clock,
            downstream,
            stats,
        }
    }

    /// 所属 Stage 在链上的下标。
    pub fn position(&self) -> usize {
        self.position
    }

    /// 该延续所属的代际是否仍然有效。
    pub fn is_current(&self) -> bool {
        self.clock.current() == self.generation
    }

    pub async fn emit(&self, activity: Activity) -> EmitOutcome {
        if !self.is_current() {
            self.stats.record_stale();
            tracing::debug!(
                target: "konduit::chain",
                position = self.position,
                generation = self.generation,
                "discarded emission from a closed generation"
            );
            return EmitOutcome::Stale;
        }

        let tagged = Tagged {
            activity,
            generation: self.generation,
        };
        match self.downstream.send(tagged).await {
            Ok(()) => EmitOutcome::Forwarded,
            Err(_) => EmitOutcome::Detached,
        }
    }
}
