//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义管线对外暴露的错误语义：生命周期误用、Stage 执行失败、中继与配置异常；
//! - 生命周期类错误均为“调用即失败、无副作用”，调用方必须修正用法而非重试。
//!
//! ## 设计要求（What）
//! - 所有错误类型派生 `thiserror::Error`，并满足 `Send + Sync + 'static`；
//! - [`StageError`] 需要 `Clone`，以便通过广播通道分发给多个观察者。

use std::borrow::Cow;

use thiserror::Error;

/// 管线核心错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：把生命周期状态机的五类误用（非法 Stage、空链、重复打开、重复关闭、写入已关闭管线）
///   映射为可匹配的枚举，便于调用方做精确断言；
/// - **契约 (What)**：除 [`PipelineError::Relay`] 与 [`PipelineError::SinkClosed`] 外，所有变体都表示
///   操作未产生任何效果；
/// - **设计权衡 (Trade-offs)**：错误文本沿用 `Pipeline is already opened` 等稳定措辞，日志检索时可直接匹配。
#[derive(Debug, Error)]
pub enum PipelineError {
    /// `use_spec` 收到的描述无法解析为已注册的 Transform。
    #[error("Pipeline::use expects a registered transform, got `{spec}`")]
    InvalidStage { spec: String },

    /// 零个 Valve 时调用 `open`。
    #[error("Cannot open empty pipeline")]
    EmptyChain,

    /// 管线已处于 Open 状态。`use_valve` 在 Open 期间同样返回该错误，因为链路已封存。
    #[error("Pipeline is already opened")]
    AlreadyOpen,

    /// 管线已处于 Closed 状态。
    #[error("Pipeline is already closed")]
    AlreadyClosed,

    /// 向 Closed 状态的管线写入。
    #[error("Refusing to write to closed pipeline")]
    ClosedPipeline,

    /// 负载不是 JSON 对象，无法构成 Activity。
    #[error("activity must be a JSON object, found {found}")]
    InvalidActivity { found: &'static str },

    /// `open`/`pipe` 需要在 Tokio 运行时上下文中调用。
    #[error("no tokio runtime available to drive the valve chain")]
    RuntimeUnavailable,

    /// 下游消费者已关闭，无法继续接收输出。
    #[error("activity sink is closed")]
    SinkClosed,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Relay(#[from] RelayError),
}

/// 配置合并或校验阶段的错误。
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("`{field}` must be greater than zero")]
    Zero { field: &'static str },

    #[error("relay namespace must not be empty")]
    EmptyNamespace,

    #[error("failed to parse pipeline options: {0}")]
    Parse(String),
}

/// 中继总线错误。
///
/// - **契约 (What)**：`publish` 失败仅记录并计数，不会阻断本地投递；`subscribe` 失败会让构造直接失败。
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("relay publish on `{namespace}` failed: {detail}")]
    Publish { namespace: String, detail: String },

    #[error("relay subscribe on `{namespace}` failed: {detail}")]
    Subscribe { namespace: String, detail: String },
}

/// Stage 失败的分类。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StageErrorKind {
    /// Transform 明确拒绝该 Activity。
    Rejected,
    /// Transform 内部执行失败。
    Failed,
    /// Transform 在执行期间 panic，已被隔离。
    Panicked,
}

impl StageErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StageErrorKind::Rejected => "rejected",
            StageErrorKind::Failed => "failed",
            StageErrorKind::Panicked => "panicked",
        }
    }
}

/// Transform 返回的失败原因。
///
/// # 教案式说明
/// - **意图 (Why)**：业务逻辑只需描述“为何失败”，定位信息（链上位置、标签）由链路在包装为
///   [`StageError`] 时补齐；
/// - **设计权衡 (Trade-offs)**：以字符串承载原因，牺牲结构化信息换取 `Clone` 与跨线程广播的便利。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct TransformError {
    kind: StageErrorKind,
    message: Cow<'static, str>,
}

impl TransformError {
    pub fn new(kind: StageErrorKind, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(StageErrorKind::Rejected, message)
    }

    pub fn failed(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(StageErrorKind::Failed, message)
    }

    pub(crate) fn panicked(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(StageErrorKind::Panicked, message)
    }

    pub fn kind(&self) -> StageErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// 链路内某个 Stage 的执行失败。
///
/// # 教案式说明
/// - **契约 (What)**：`position` 为 0 起始的链上下标，`label` 来自 [`ValveDescriptor`](crate::valve::ValveDescriptor)；
/// - **风险提示 (Trade-offs)**：核心不尝试修复链路完整性，失败的 Activity 被丢弃，其后的输入照常处理。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("valve #{position} (`{label}`) {}: {}", .cause.kind().as_str(), .cause.message())]
pub struct StageError {
    position: usize,
    label: Cow<'static, str>,
    cause: TransformError,
}

impl StageError {
    pub(crate) fn new(position: usize, label: Cow<'static, str>, cause: TransformError) -> Self {
        Self {
            position,
            label,
            cause,
        }
    }

    pub fn kind(&self) -> StageErrorKind {
        self.cause.kind()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn cause(&self) -> &TransformError {
        &self.cause
    }
}
