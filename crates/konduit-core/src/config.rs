//! 构造期配置：默认值、深度合并与校验。
//!
//! # 设计背景（Why）
//! - 调用方只需给出想要覆盖的选项，其余取系统默认；嵌套的中继选项按字段逐项合并，而不是整体替换；
//! - 默认值每次解析都重新构造并按值复制进实例，不存在跨实例共享的可变默认对象。
//!
//! # 契约说明（What）
//! - [`PipelineOptions`] 的数据部分可由 TOML 反序列化（`deny_unknown_fields`），能力部分（日志、
//!   中继总线、Transform 目录）只能通过构建方法注入；
//! - [`PipelineConfig::resolve`] 在构造期完成全部校验，容量或并发度为零、命名空间为空均直接失败。

use std::{fmt, num::NonZeroUsize, sync::Arc};

use serde::Deserialize;

use crate::{
    catalog::ValveCatalog,
    error::ConfigError,
    observability::{Logger, TracingLogger},
    relay::{RelayBus, RelayConfig},
};

/// 相邻 Stage 之间以及每个输出订阅的默认队列容量。
pub const DEFAULT_CHANNEL_CAPACITY: usize = 16;

/// 单个 Stage 默认允许的在途 Activity 数量。
pub const DEFAULT_STAGE_CONCURRENCY: usize = 1;

/// 中继相关的可覆盖选项。
#[derive(Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayOptions {
    pub namespace: Option<String>,
    #[serde(skip)]
    pub bus: Option<Arc<dyn RelayBus>>,
}

impl fmt::Debug for RelayOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayOptions")
            .field("namespace", &self.namespace)
            .field("bus", &self.bus.as_ref().map(|_| "<dyn RelayBus>"))
            .finish()
    }
}

/// 调用方提供的构造选项；未设置的字段取默认值。
#[derive(Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineOptions {
    pub relay: RelayOptions,
    pub channel_capacity: Option<usize>,
    pub stage_concurrency: Option<usize>,
    #[serde(skip)]
    pub log: Option<Arc<dyn Logger>>,
    #[serde(skip)]
    pub catalog: Option<ValveCatalog>,
}

impl PipelineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从 TOML 文本解析数据类选项。
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        toml::from_str(source).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    pub fn with_logger(mut self, log: Arc<dyn Logger>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn with_relay_bus(mut self, bus: Arc<dyn RelayBus>) -> Self {
        self.relay.bus = Some(bus);
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.relay.namespace = Some(namespace.into());
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = Some(capacity);
        self
    }

    pub fn with_stage_concurrency(mut self, concurrency: usize) -> Self {
        self.stage_concurrency = Some(concurrency);
        self
    }

    pub fn with_catalog(mut self, catalog: ValveCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// 把 `overrides` 中已设置的字段覆盖到 `self` 上，嵌套选项逐字段合并。
    pub fn merge(mut self, overrides: PipelineOptions) -> Self {
        if overrides.relay.namespace.is_some() {
            self.relay.namespace = overrides.relay.namespace;
        }
        if overrides.relay.bus.is_some() {
            self.relay.bus = overrides.relay.bus;
        }
        if overrides.channel_capacity.is_some() {
            self.channel_capacity = overrides.channel_capacity;
        }
        if overrides.stage_concurrency.is_some() {
            self.stage_concurrency = overrides.stage_concurrency;
        }
        if overrides.log.is_some() {
            self.log = overrides.log;
        }
        if overrides.catalog.is_some() {
            self.catalog = overrides.catalog;
        }
        self
    }
}

impl fmt::Debug for PipelineOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineOptions")
            .field("relay", &self.relay)
            .field("channel_capacity", &self.channel_capacity)
            .field("stage_concurrency", &self.stage_concurrency)
            .field("log", &self.log.as_ref().map(|_| "<dyn Logger>"))
            .field("catalog", &self.catalog)
            .finish()
    }
}

/// 合并、校验后的不可变配置，每个管线实例独占一份。
#[derive(Clone)]
pub struct PipelineConfig {
    log: Arc<dyn Logger>,
    relay: RelayConfig,
    channel_capacity: NonZeroUsize,
    stage_concurrency: NonZeroUsize,
    catalog: ValveCatalog,
}

impl PipelineConfig {
    /// 新构造一份系统默认配置。
    pub fn defaults() -> Self {
        Self {
            log: Arc::new(TracingLogger),
            relay: RelayConfig::default(),
            channel_capacity: NonZeroUsize::new(DEFAULT_CHANNEL_CAPACITY)
                .unwrap_or(NonZeroUsize::MIN),
            stage_concurrency: NonZeroUsize::new(DEFAULT_STAGE_CONCURRENCY)
                .unwrap_or(NonZeroUsize::MIN),
            catalog: ValveCatalog::new(),
        }
    }

    /// 将选项深度合并到全新的默认配置上并校验。
    pub fn resolve(options: PipelineOptions) -> Result<Self, ConfigError> {
        let defaults = Self::defaults();

        let namespace = match options.relay.namespace {
            Some(namespace) if namespace.trim().is_empty() => {
                return Err(ConfigError::EmptyNamespace);
            }
            Some(namespace) => Arc::<str>::from(namespace),
            None => Arc::<str>::from(defaults.relay.namespace()),
        };
        let bus = options
            .relay
            .bus
            .unwrap_or_else(|| Arc::clone(defaults.relay.bus()));

        Ok(Self {
            log: options.log.unwrap_or(defaults.log),
            relay: RelayConfig::new(bus, namespace),
            channel_capacity: non_zero(
                "channel_capacity",
                options.channel_capacity,
                defaults.channel_capacity,
            )?,
            stage_concurrency: non_zero(
                "stage_concurrency",
                options.stage_concurrency,
                defaults.stage_concurrency,
            )?,
            catalog: options.catalog.unwrap_or(defaults.catalog),
        })
    }

    pub fn log(&self) -> &Arc<dyn Logger> {
        &self.log
    }

    pub fn relay(&self) -> &RelayConfig {
        &self.relay
    }

    pub fn namespace(&self) -> &str {
        self.relay.namespace()
    }

    pub fn channel_capacity(&self) -> usize {
        self.channel_capacity.get()
    }

    pub fn stage_concurrency(&self) -> usize {
        self.stage_concurrency.get()
    }

    pub fn catalog(&self) -> &ValveCatalog {
        &self.catalog
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::defaults()
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("relay", &self.relay)
            .field("channel_capacity", &self.channel_capacity)
            .field("stage_concurrency", &self.stage_concurrency)
            .field("catalog", &self.catalog)
            .finish_non_exhaustive()
    }
}

fn non_zero(
    field: &'static str,
    value: Option<usize>,
    default: NonZeroUsize,
) -> Result<NonZeroUsize, ConfigError> {
    match value {
        Some(value) => NonZeroUsize::new(value).ok_or(ConfigError::Zero { field }),
        None => Ok(default),
    }
}
