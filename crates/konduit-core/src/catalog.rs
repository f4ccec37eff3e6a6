//! 具名 Transform 目录。
//!
//! # 教案式说明
//! - **意图（Why）**：`use_valve` 的参数在类型层面必然可调用；而由配置或清单驱动的装配只能拿到
//!   一个动态描述（JSON 值），需要在运行期判定它是否指向可用的 Transform；
//! - **契约（What）**：只有“字符串且已注册”的描述可以解析，`null`、数字、未知名称、对象等一律返回
//!   [`PipelineError::InvalidStage`]；
//! - **风险提示（Trade-offs）**：同一名称重复注册时后者覆盖前者，并返回被覆盖的条目。

use std::{collections::BTreeMap, fmt, sync::Arc};

use serde_json::Value;

use crate::{error::PipelineError, valve::Transform};

#[derive(Clone, Default)]
pub struct ValveCatalog {
    entries: BTreeMap<String, Arc<dyn Transform>>,
}

impl ValveCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        transform: impl Transform,
    ) -> Option<Arc<dyn Transform>> {
        self.register_shared(name, Arc::new(transform))
    }

    pub fn register_shared(
        &mut self,
        name: impl Into<String>,
        transform: Arc<dyn Transform>,
    ) -> Option<Arc<dyn Transform>> {
        self.entries.insert(name.into(), transform)
    }

    /// 链式注册，便于在构造期一次性填充目录。
    pub fn with(mut self, name: impl Into<String>, transform: impl Transform) -> Self {
        self.register(name, transform);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Transform>> {
        self.entries.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 将动态描述解析为 Transform。
    pub fn resolve(&self, spec: &Value) -> Result<Arc<dyn Transform>, PipelineError> {
        match spec {
            Value::String(name) => self.get(name).ok_or_else(|| PipelineError::InvalidStage {
                spec: name.clone(),
            }),
            other => Err(PipelineError::InvalidStage {
                spec: other.to_string(),
            }),
        }
    }
}

impl fmt::Debug for ValveCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}
